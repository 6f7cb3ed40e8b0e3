//! Model descriptors and the read-only model registry.
//!
//! Built-in descriptors are loaded from the `builtin_models.toml` file embedded
//! at build time. User configuration may add more; the registry is never
//! mutated after construction.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::core::constants::FALLBACK_MODEL_ID;
use crate::core::error::ConfigurationError;
use crate::core::tokenizer::{encoding_for_model, Encoding};

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    /// Maximum length of a single message, in characters.
    pub max_length: usize,
    /// Context window, in tokens (prompt + history + reply).
    pub token_limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,
    #[serde(default = "enabled")]
    pub supports_streaming: bool,
    #[serde(default = "enabled")]
    pub supports_system_prompt: bool,
    #[serde(default = "enabled")]
    pub supports_temperature: bool,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, token_limit: usize) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            max_length: token_limit.saturating_mul(3),
            token_limit,
            encoding: None,
            supports_streaming: true,
            supports_system_prompt: true,
            supports_temperature: true,
        }
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn without_streaming(mut self) -> Self {
        self.supports_streaming = false;
        self
    }

    pub fn without_system_prompt(mut self) -> Self {
        self.supports_system_prompt = false;
        self
    }

    pub fn without_temperature(mut self) -> Self {
        self.supports_temperature = false;
        self
    }

    /// The declared encoding, or the one inferred from the model id.
    pub fn resolved_encoding(&self) -> Result<Encoding, ConfigurationError> {
        match self.encoding {
            Some(encoding) => Ok(encoding),
            None => encoding_for_model(&self.id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BuiltinModelsConfig {
    models: Vec<ModelDescriptor>,
}

/// Descriptors shipped with the binary.
pub fn builtin_models() -> &'static [ModelDescriptor] {
    static BUILTIN: OnceLock<Vec<ModelDescriptor>> = OnceLock::new();
    BUILTIN.get_or_init(|| {
        const CONFIG_CONTENT: &str = include_str!("../builtin_models.toml");

        let config: BuiltinModelsConfig =
            toml::from_str(CONFIG_CONTENT).expect("Failed to parse builtin_models.toml");
        config.models
    })
}

/// Immutable lookup table from model id to descriptor.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelDescriptor>,
    index: HashMap<String, usize>,
}

impl ModelRegistry {
    /// Build a registry. Later entries replace earlier ones with the same id,
    /// keeping the original position.
    pub fn new(models: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let mut registry = Self {
            models: Vec::new(),
            index: HashMap::new(),
        };
        for model in models {
            match registry.index.get(&model.id) {
                Some(&slot) => registry.models[slot] = model,
                None => {
                    registry.index.insert(model.id.clone(), registry.models.len());
                    registry.models.push(model);
                }
            }
        }
        registry
    }

    pub fn builtin() -> Self {
        Self::new(builtin_models().iter().cloned())
    }

    /// Built-in models overlaid with user-defined ones.
    pub fn with_custom(custom: &[ModelDescriptor]) -> Self {
        Self::new(builtin_models().iter().chain(custom.iter()).cloned())
    }

    pub fn get(&self, id: &str) -> Result<&ModelDescriptor, ConfigurationError> {
        self.index
            .get(id)
            .map(|&slot| &self.models[slot])
            .ok_or_else(|| ConfigurationError::UnknownModel(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.iter()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Pick the default model: the requested id if the registry knows it,
    /// otherwise the fallback model.
    pub fn default_model(&self, requested: Option<&str>) -> Result<&ModelDescriptor, ConfigurationError> {
        match requested.filter(|id| !id.is_empty()) {
            Some(id) if self.contains(id) => self.get(id),
            Some(id) => {
                tracing::warn!(model = id, "unknown default model, using {FALLBACK_MODEL_ID}");
                self.get(FALLBACK_MODEL_ID)
            }
            None => self.get(FALLBACK_MODEL_ID),
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
