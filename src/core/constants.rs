//! Shared constants used across the crate

/// System prompt sent when the caller leaves theirs empty.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are ChatGPT, a large language model trained by OpenAI. \
Follow the user's instructions carefully. Respond using markdown.";

/// Sampling temperature used when the caller does not pick one.
pub const DEFAULT_TEMPERATURE: f32 = 1.0;

/// Tokens held back from the context window for the model's reply and
/// request framing. History is trimmed so that prompt + history + this
/// reserve never exceeds the model's token limit.
pub const RESPONSE_RESERVE_TOKENS: usize = 1000;

/// Model used when neither configuration nor `DEFAULT_MODEL` names one.
pub const FALLBACK_MODEL_ID: &str = "gpt-4o-mini";

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
