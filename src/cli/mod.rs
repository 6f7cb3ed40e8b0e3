//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod chat;
pub mod model_list;
pub mod say;

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cli::chat::run_chat;
use crate::cli::model_list::list_models;
use crate::cli::say::run_say;
use crate::core::config::data::CONFIG_KEYS;
use crate::core::config::Config;
use crate::core::models::ModelDescriptor;
use crate::core::providers::{requested_model_id, resolve_session, ProviderSession};
use crate::utils::logging::init_tracing;

#[derive(Parser)]
#[command(name = "chatpipe")]
#[command(about = "Streamed chat completions from the terminal")]
#[command(
    long_about = "chatpipe sends conversations to an OpenAI-compatible chat completion API, \
trimming history to fit the model's context window and printing the reply as it streams in.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY    Your API key (required)\n\
  OPENAI_BASE_URL   Custom API base URL (optional, defaults to https://api.openai.com/v1)\n\
  DEFAULT_MODEL     Model used when --model is not given\n\
  RUST_LOG          Diagnostic log filter (e.g. chatpipe=debug)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Model to use for this run
    #[arg(short = 'm', long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Write diagnostic logs to this file instead of stderr
    #[arg(short = 'l', long, global = true, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Log request and stream details
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Send a single prompt and print the streamed answer
    Say {
        /// Prompt text (multiple words are joined with spaces)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        prompt: Vec<String>,
    },
    /// Interactive line-based chat over a saved conversation (default)
    Chat {
        /// Start a fresh conversation instead of resuming the last one
        #[arg(long)]
        new: bool,
    },
    /// List known models with their limits and capabilities
    Models,
    /// Set a configuration value, or print the configuration without arguments
    Set {
        /// Configuration key to set
        key: Option<String>,
        /// Value to set for the key (multiple words are joined with spaces)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        value: Vec<String>,
    },
    /// Unset a configuration value
    Unset {
        /// Configuration key to unset
        key: String,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.log.as_deref(), args.verbose)?;

    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    let command = args.command.unwrap_or(Commands::Chat { new: false });

    match command {
        Commands::Say { prompt } => run_say(prompt.join(" "), args.model).await,
        Commands::Chat { new } => run_chat(args.model, new).await,
        Commands::Models => {
            let config = Config::load()?;
            list_models(&config, args.model.as_deref());
            Ok(())
        }
        Commands::Set { key, value } => {
            let mut config = Config::load()?;
            let Some(key) = key else {
                config.print_all();
                return Ok(());
            };
            if value.is_empty() {
                eprintln!("⚠️  Missing value for {key}");
                eprintln!("Example: chatpipe set {key} <value>");
                std::process::exit(1);
            }
            if let Err(err) = config.set_value(&key, &value.join(" ")) {
                exit_with_config_error(err);
            }
            config.save()?;
            println!("✅ Set {key} to: {}", value.join(" "));
            Ok(())
        }
        Commands::Unset { key } => {
            let mut config = Config::load()?;
            if let Err(err) = config.unset_value(&key) {
                exit_with_config_error(err);
            }
            config.save()?;
            println!("✅ Unset {key}");
            Ok(())
        }
    }
}

fn exit_with_config_error(err: crate::core::config::ConfigError) -> ! {
    eprintln!("❌ {err}");
    eprintln!("Available keys: {}", CONFIG_KEYS.join(", "));
    std::process::exit(1);
}

/// Resolve the API session, or print the quick fixes and exit.
pub(crate) fn session_or_exit(config: &Config) -> ProviderSession {
    match resolve_session(config) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("{err}");
            let fixes = err.quick_fixes();
            if !fixes.is_empty() {
                eprintln!();
                eprintln!("💡 Quick fixes:");
                for fix in fixes {
                    eprintln!("  • {fix}");
                }
            }
            std::process::exit(err.exit_code());
        }
    }
}

/// The model for this run: `--model`, then `DEFAULT_MODEL`, then the config,
/// then the fallback model.
pub(crate) fn resolve_model(
    config: &Config,
    cli_model: Option<&str>,
) -> Result<ModelDescriptor, Box<dyn Error>> {
    let registry = config.model_registry();
    let requested = requested_model_id(cli_model, config);
    if let Some(id) = cli_model {
        // An explicit request for an unknown model is a mistake, not a preference.
        if !registry.contains(id) {
            let known: Vec<&str> = registry.iter().map(|m| m.id.as_str()).collect();
            return Err(format!("Unknown model '{id}'. Known models: {}", known.join(", ")).into());
        }
    }
    Ok(registry.default_model(requested.as_deref())?.clone())
}
