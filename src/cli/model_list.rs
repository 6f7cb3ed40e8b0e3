//! Model listing functionality
//!
//! Lists the models chatpipe knows about, built-in and configured, with the
//! limits the context budgeter works with.

use crate::core::config::Config;
use crate::core::models::{ModelDescriptor, ModelRegistry};
use crate::core::providers::requested_model_id;

fn capability_notes(model: &ModelDescriptor) -> Vec<&'static str> {
    let mut notes = Vec::new();
    if !model.supports_streaming {
        notes.push("no streaming");
    }
    if !model.supports_system_prompt {
        notes.push("no system prompt");
    }
    if !model.supports_temperature {
        notes.push("fixed temperature");
    }
    notes
}

/// One block of lines per model; the default model is marked.
pub fn format_models(registry: &ModelRegistry, default_id: Option<&str>) -> Vec<String> {
    let mut lines = Vec::new();
    for model in registry.iter() {
        let marker = if default_id == Some(model.id.as_str()) {
            " (default)"
        } else {
            ""
        };
        lines.push(format!("  • {}{marker}", model.id));
        if model.name != model.id {
            lines.push(format!("    Name: {}", model.name));
        }
        let encoding = model
            .resolved_encoding()
            .map(|e| e.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        lines.push(format!(
            "    Context: {} tokens, {encoding}",
            model.token_limit
        ));
        let notes = capability_notes(model);
        if !notes.is_empty() {
            lines.push(format!("    Limits: {}", notes.join(", ")));
        }
    }
    lines
}

pub fn list_models(config: &Config, cli_model: Option<&str>) {
    let registry = config.model_registry();
    let default_id = registry
        .default_model(requested_model_id(cli_model, config).as_deref())
        .map(|m| m.id.clone())
        .ok();

    println!("🤖 Available Models ({})", registry.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    for line in format_models(&registry, default_id.as_deref()) {
        println!("{line}");
    }
}
