use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::config::io::ConfigError;
use crate::core::constants::DEFAULT_OPENAI_BASE_URL;
use crate::core::models::{ModelDescriptor, ModelRegistry};

/// Keys accepted by `chatpipe set` / `chatpipe unset`.
pub const CONFIG_KEYS: &[&str] = &["base-url", "default-model", "system-prompt", "temperature"];

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    /// API root, e.g. `https://api.openai.com/v1`
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    /// System prompt for new conversations; empty means the built-in default.
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    /// Extra model descriptors layered over the built-in registry
    #[serde(default)]
    pub custom_models: Vec<ModelDescriptor>,
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

impl Config {
    pub fn model_registry(&self) -> ModelRegistry {
        ModelRegistry::with_custom(&self.custom_models)
    }

    pub fn base_url_or_default(&self) -> &str {
        self.base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(DEFAULT_OPENAI_BASE_URL)
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match key {
            "base-url" => {
                if !(value.starts_with("http://") || value.starts_with("https://")) {
                    return Err(ConfigError::invalid(key, value, "expected an http(s) URL"));
                }
                self.base_url = Some(value.to_string());
            }
            "default-model" => {
                if !self.model_registry().contains(value) {
                    return Err(ConfigError::invalid(key, value, "not a known model"));
                }
                self.default_model = Some(value.to_string());
            }
            "system-prompt" => self.system_prompt = Some(value.to_string()),
            "temperature" => {
                let temperature: f32 = value
                    .parse()
                    .map_err(|_| ConfigError::invalid(key, value, "expected a number"))?;
                if !(0.0..=2.0).contains(&temperature) {
                    return Err(ConfigError::invalid(key, value, "must be between 0 and 2"));
                }
                self.temperature = Some(temperature);
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    pub fn unset_value(&mut self, key: &str) -> Result<(), ConfigError> {
        match key {
            "base-url" => self.base_url = None,
            "default-model" => self.default_model = None,
            "system-prompt" => self.system_prompt = None,
            "temperature" => self.temperature = None,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}
