//! Resolution of the API endpoint and credential for a session.
//!
//! The key only ever comes from the environment; it is never written to disk.

use thiserror::Error;

use crate::core::config::Config;
use crate::core::constants::DEFAULT_OPENAI_BASE_URL;
use crate::utils::url::normalize_base_url;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const BASE_URL_ENV: &str = "OPENAI_BASE_URL";
pub const DEFAULT_MODEL_ENV: &str = "DEFAULT_MODEL";

const QUICK_FIXES: &[&str] = &[
    "export OPENAI_API_KEY=sk-...                  # Required",
    "export OPENAI_BASE_URL=http://localhost:8080  # Optional, any OpenAI-compatible API",
    "chatpipe set base-url https://...             # Persist a custom endpoint",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderSession {
    pub api_key: String,
    pub base_url: String,
    pub display_name: String,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderResolutionError {
    message: String,
    quick_fixes: &'static [&'static str],
    exit_code: i32,
}

impl ProviderResolutionError {
    pub fn missing_api_key() -> Self {
        Self {
            message: format!(
                "❌ {API_KEY_ENV} environment variable not set\n\nPlease set your API key:\n   export {API_KEY_ENV}=\"your-api-key-here\""
            ),
            quick_fixes: QUICK_FIXES,
            exit_code: 2,
        }
    }

    pub fn quick_fixes(&self) -> &'static [&'static str] {
        self.quick_fixes
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

/// Resolve the session from the process environment and `config`.
pub fn resolve_session(config: &Config) -> Result<ProviderSession, ProviderResolutionError> {
    resolve_session_with(config, |name| std::env::var(name).ok())
}

/// Resolve the session using `lookup` for environment variables.
///
/// `OPENAI_BASE_URL` wins over the configured base URL, which wins over the
/// public OpenAI endpoint.
pub fn resolve_session_with<F>(
    config: &Config,
    lookup: F,
) -> Result<ProviderSession, ProviderResolutionError>
where
    F: Fn(&str) -> Option<String>,
{
    let api_key = lookup(API_KEY_ENV)
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .ok_or_else(ProviderResolutionError::missing_api_key)?;

    let base_url = lookup(BASE_URL_ENV)
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| config.base_url_or_default().to_string());
    let base_url = normalize_base_url(&base_url);

    let display_name = if base_url == DEFAULT_OPENAI_BASE_URL {
        "OpenAI".to_string()
    } else {
        "OpenAI-compatible".to_string()
    };

    Ok(ProviderSession {
        api_key,
        base_url,
        display_name,
    })
}

/// Model id requested by the command line, the environment, or the config,
/// in that order.
pub fn requested_model_id(cli_model: Option<&str>, config: &Config) -> Option<String> {
    requested_model_id_with(cli_model, config, |name| std::env::var(name).ok())
}

pub fn requested_model_id_with<F>(cli_model: Option<&str>, config: &Config, lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    cli_model
        .map(str::to_string)
        .or_else(|| lookup(DEFAULT_MODEL_ENV))
        .or_else(|| config.default_model.clone())
        .filter(|id| !id.trim().is_empty())
}
