//! Context-window budgeting.
//!
//! Selects the longest suffix of a conversation that fits in the model's token
//! limit once the system prompt and [`RESPONSE_RESERVE_TOKENS`] are accounted
//! for. The system prompt is never dropped to make room for history.

use crate::core::constants::{DEFAULT_SYSTEM_PROMPT, DEFAULT_TEMPERATURE, RESPONSE_RESERVE_TOKENS};
use crate::core::error::ConfigurationError;
use crate::core::message::Message;
use crate::core::models::ModelDescriptor;
use crate::core::tokenizer::{BpeTokenCounter, TokenCounter};

/// What survives budgeting for a single request.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetedContext {
    pub prompt: String,
    pub temperature: f32,
    /// Contiguous, chronologically ordered suffix of the input history.
    pub messages: Vec<Message>,
    pub prompt_tokens: usize,
    pub history_tokens: usize,
}

impl BudgetedContext {
    /// Prompt plus retained history, excluding the reply reserve.
    pub fn used_tokens(&self) -> usize {
        self.prompt_tokens + self.history_tokens
    }
}

/// Budget `history` for `model` with the model's own tokenizer.
pub fn budget(
    model: &ModelDescriptor,
    system_prompt: Option<&str>,
    temperature: Option<f32>,
    history: &[Message],
) -> Result<BudgetedContext, ConfigurationError> {
    let counter = BpeTokenCounter::for_model(model)?;
    Ok(budget_with(&counter, model, system_prompt, temperature, history))
}

/// Budget `history` using an already resolved token counter.
pub fn budget_with(
    counter: &dyn TokenCounter,
    model: &ModelDescriptor,
    system_prompt: Option<&str>,
    temperature: Option<f32>,
    history: &[Message],
) -> BudgetedContext {
    let prompt = match system_prompt {
        Some(prompt) if !prompt.is_empty() => prompt.to_string(),
        _ => DEFAULT_SYSTEM_PROMPT.to_string(),
    };
    let temperature = temperature.unwrap_or(DEFAULT_TEMPERATURE);

    let prompt_tokens = counter.count_text(&prompt);
    let mut running = prompt_tokens;
    let mut keep_from = history.len();

    for (index, message) in history.iter().enumerate().rev() {
        let tokens = counter.count_text(&message.content);
        let needed = running
            .saturating_add(tokens)
            .saturating_add(RESPONSE_RESERVE_TOKENS);
        if needed > model.token_limit {
            break;
        }
        running += tokens;
        keep_from = index;
    }

    let messages = history[keep_from..].to_vec();
    if keep_from > 0 {
        tracing::debug!(
            model = %model.id,
            dropped = keep_from,
            kept = messages.len(),
            tokens = running,
            "trimmed conversation history to fit the context window"
        );
    }

    BudgetedContext {
        prompt,
        temperature,
        messages,
        prompt_tokens,
        history_tokens: running - prompt_tokens,
    }
}
