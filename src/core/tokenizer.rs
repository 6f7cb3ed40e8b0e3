//! Token counting for context budgeting.
//!
//! Every model names a BPE encoding; counts are exact for that encoding. There
//! is deliberately no fallback encoding: a model that cannot be mapped is a
//! [`ConfigurationError`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;

use crate::core::error::ConfigurationError;
use crate::core::models::ModelDescriptor;

/// Named BPE encoding schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Encoding {
    O200kBase,
    Cl100kBase,
    P50kBase,
    R50kBase,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::O200kBase => "o200k_base",
            Encoding::Cl100kBase => "cl100k_base",
            Encoding::P50kBase => "p50k_base",
            Encoding::R50kBase => "r50k_base",
        }
    }

    fn load(self) -> Result<CoreBPE, ConfigurationError> {
        let loaded = match self {
            Encoding::O200kBase => tiktoken_rs::o200k_base(),
            Encoding::Cl100kBase => tiktoken_rs::cl100k_base(),
            Encoding::P50kBase => tiktoken_rs::p50k_base(),
            Encoding::R50kBase => tiktoken_rs::r50k_base(),
        };
        loaded.map_err(|err| ConfigurationError::Tokenizer {
            encoding: self.as_str().to_string(),
            reason: err.to_string(),
        })
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = ConfigurationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "o200k_base" => Ok(Encoding::O200kBase),
            "cl100k_base" => Ok(Encoding::Cl100kBase),
            "p50k_base" => Ok(Encoding::P50kBase),
            "r50k_base" => Ok(Encoding::R50kBase),
            other => Err(ConfigurationError::UnknownEncoding(other.to_string())),
        }
    }
}

impl TryFrom<String> for Encoding {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Encoding> for String {
    fn from(value: Encoding) -> Self {
        value.as_str().to_string()
    }
}

const MODEL_PREFIX_ENCODINGS: &[(&str, Encoding)] = &[
    ("gpt-4o", Encoding::O200kBase),
    ("chatgpt-4o", Encoding::O200kBase),
    ("gpt-4.1", Encoding::O200kBase),
    ("gpt-4.5", Encoding::O200kBase),
    ("o1", Encoding::O200kBase),
    ("o3", Encoding::O200kBase),
    ("o4", Encoding::O200kBase),
    ("gpt-4", Encoding::Cl100kBase),
    ("gpt-3.5-turbo", Encoding::Cl100kBase),
    ("gpt-35-turbo", Encoding::Cl100kBase),
    ("text-embedding-", Encoding::Cl100kBase),
    ("text-davinci-00", Encoding::P50kBase),
    ("code-davinci-", Encoding::P50kBase),
    ("davinci", Encoding::R50kBase),
    ("curie", Encoding::R50kBase),
    ("babbage", Encoding::R50kBase),
    ("ada", Encoding::R50kBase),
];

/// Map a model identifier to the encoding its tokenizer uses.
///
/// Prefixes are checked in order, so the more specific `gpt-4o` wins over
/// `gpt-4`.
pub fn encoding_for_model(model_id: &str) -> Result<Encoding, ConfigurationError> {
    MODEL_PREFIX_ENCODINGS
        .iter()
        .find(|(prefix, _)| model_id.starts_with(prefix))
        .map(|(_, encoding)| *encoding)
        .ok_or_else(|| ConfigurationError::NoEncodingForModel(model_id.to_string()))
}

/// Counts tokens in text.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> usize;
}

pub type SharedTokenCounter = Arc<dyn TokenCounter>;

/// Exact counter backed by a tiktoken BPE table.
pub struct BpeTokenCounter {
    encoding: Encoding,
    bpe: CoreBPE,
}

impl BpeTokenCounter {
    pub fn new(encoding: Encoding) -> Result<Self, ConfigurationError> {
        Ok(Self {
            encoding,
            bpe: encoding.load()?,
        })
    }

    pub fn for_model(model: &ModelDescriptor) -> Result<Self, ConfigurationError> {
        Self::new(model.resolved_encoding()?)
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }
}

impl TokenCounter for BpeTokenCounter {
    fn count_text(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }
}

impl fmt::Debug for BpeTokenCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BpeTokenCounter")
            .field("encoding", &self.encoding)
            .finish()
    }
}

/// Lazily built BPE tables, one per encoding. Tables are immutable once
/// loaded and shared across concurrent calls.
#[derive(Default)]
pub struct TokenizerCache {
    loaded: Mutex<HashMap<Encoding, SharedTokenCounter>>,
}

impl TokenizerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_for(
        &self,
        model: &ModelDescriptor,
    ) -> Result<SharedTokenCounter, ConfigurationError> {
        let encoding = model.resolved_encoding()?;
        if let Some(counter) = self.lock().get(&encoding) {
            return Ok(Arc::clone(counter));
        }

        // Built outside the lock; a racing loader simply loses the insert.
        let counter: SharedTokenCounter = Arc::new(BpeTokenCounter::new(encoding)?);
        Ok(Arc::clone(self.lock().entry(encoding).or_insert(counter)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Encoding, SharedTokenCounter>> {
        self.loaded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
