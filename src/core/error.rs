//! Error taxonomy for budgeting and completion calls.
//!
//! Configuration problems are fatal and surface as `Err` before any request
//! is sent. Everything that can go wrong on the wire is a [`CompletionError`]
//! value handed back to the caller, never a panic.

use thiserror::Error;

/// Fatal setup errors: the model or its tokenizer cannot be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("no tokenizer encoding is known for model '{0}'")]
    NoEncodingForModel(String),

    #[error("unknown tokenizer encoding '{0}'")]
    UnknownEncoding(String),

    #[error("failed to load the {encoding} tokenizer: {reason}")]
    Tokenizer { encoding: String, reason: String },
}

/// A failed completion call, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    /// The upstream rejected the credential (401/403).
    #[error("{status_text}")]
    Auth { status: u16, status_text: String },

    /// Any other non-success status from the upstream.
    #[error("API request failed with status {status}: {status_text}")]
    Upstream { status: u16, status_text: String },

    /// Connection, DNS, TLS or mid-stream read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The upstream sent an error object inside an otherwise healthy stream.
    #[error("{0}")]
    Api(String),

    /// A blocking response body could not be decoded.
    #[error("could not decode completion: {0}")]
    Decode(String),
}

impl CompletionError {
    /// Human-readable status text suitable for a toast or banner.
    pub fn status_text(&self) -> String {
        match self {
            CompletionError::Auth { status_text, .. }
            | CompletionError::Upstream { status_text, .. } => status_text.clone(),
            other => other.to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            CompletionError::Auth { status, .. } | CompletionError::Upstream { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, CompletionError::Auth { .. })
    }
}

/// Failure reported by a [`crate::core::completion::Transport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError(err.to_string())
    }
}

impl From<TransportError> for CompletionError {
    fn from(err: TransportError) -> Self {
        CompletionError::Transport(err.0)
    }
}
