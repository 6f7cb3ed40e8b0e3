//! Completion adapter: budgets a conversation, shapes the outbound request for
//! the model's capabilities, and hands back either the full text or a lazy
//! [`FragmentStream`].

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::api::{ChatCompletion, ChatMessage, ChatRequest};
use crate::core::budget::{budget_with, BudgetedContext};
use crate::core::chat_stream::{extract_error_summary, format_api_error, FragmentStream};
use crate::core::error::{CompletionError, ConfigurationError, TransportError};
use crate::core::message::{Message, Role};
use crate::core::models::ModelDescriptor;
use crate::core::tokenizer::{SharedTokenCounter, TokenizerCache};
use crate::utils::auth::add_auth_headers;
use crate::utils::url::construct_api_url;

/// Raw response body as delivered by the transport.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

pub struct TransportResponse {
    pub status: u16,
    pub body: ByteStream,
}

/// Sends one JSON request and exposes the response body as a byte stream.
///
/// Dropping the returned body must release the underlying connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        url: &str,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] over HTTPS with reqwest.
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        url: &str,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<TransportResponse, TransportError> {
        let http_request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        let http_request = add_auth_headers(http_request, api_key);

        let response = http_request.json(request).send().await?;
        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();
        Ok(TransportResponse { status, body })
    }
}

/// One completion call. Built once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    model: ModelDescriptor,
    messages: Vec<Message>,
    system_prompt: Option<String>,
    temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(model: ModelDescriptor, messages: Vec<Message>) -> Self {
        Self {
            model,
            messages,
            system_prompt: None,
            temperature: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }
}

/// Something the caller asked for that the model cannot honour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityWarning {
    SystemPromptIgnored { model: String },
    TemperatureIgnored { model: String },
}

impl fmt::Display for CapabilityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityWarning::SystemPromptIgnored { model } => {
                write!(f, "{model} does not support system prompts; the prompt was not sent")
            }
            CapabilityWarning::TemperatureIgnored { model } => {
                write!(f, "{model} does not support temperature; the setting was not sent")
            }
        }
    }
}

pub enum CompletionBody {
    /// Whole reply from a non-streaming model.
    Text(String),
    Stream(FragmentStream),
}

impl fmt::Debug for CompletionBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionBody::Text(text) => f.debug_tuple("Text").field(text).finish(),
            CompletionBody::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
        }
    }
}

#[derive(Debug)]
pub struct CompletionResponse {
    pub outcome: Result<CompletionBody, CompletionError>,
    pub warnings: Vec<CapabilityWarning>,
}

impl CompletionResponse {
    fn failed(error: CompletionError, warnings: Vec<CapabilityWarning>) -> Self {
        Self {
            outcome: Err(error),
            warnings,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn status_text(&self) -> Option<String> {
        self.outcome.as_ref().err().map(CompletionError::status_text)
    }

    /// Resolve to the full reply text, draining the stream if there is one.
    pub async fn into_text(self) -> Result<String, CompletionError> {
        match self.outcome? {
            CompletionBody::Text(text) => Ok(text),
            CompletionBody::Stream(stream) => stream.collect_text().await,
        }
    }
}

/// Shape the outbound payload for `model` from a budgeted context.
///
/// `caller_temperature` tells whether the temperature was explicitly chosen,
/// so that dropping it can be reported.
pub fn build_chat_request(
    model: &ModelDescriptor,
    context: &BudgetedContext,
    caller_temperature: bool,
) -> (ChatRequest, Vec<CapabilityWarning>) {
    let mut warnings = Vec::new();
    let mut messages = Vec::with_capacity(context.messages.len() + 1);

    if model.supports_system_prompt {
        messages.push(ChatMessage {
            role: Role::System.as_str().to_string(),
            content: context.prompt.clone(),
        });
    } else {
        warnings.push(CapabilityWarning::SystemPromptIgnored {
            model: model.id.clone(),
        });
    }
    messages.extend(context.messages.iter().map(Message::to_api));

    let temperature = if model.supports_temperature {
        Some(context.temperature)
    } else {
        if caller_temperature {
            warnings.push(CapabilityWarning::TemperatureIgnored {
                model: model.id.clone(),
            });
        }
        None
    };

    let request = ChatRequest {
        model: model.id.clone(),
        messages,
        temperature,
        stream: model.supports_streaming,
    };
    (request, warnings)
}

/// Entry point for completion calls. Cheap to clone; clones share the
/// transport and tokenizer cache.
#[derive(Clone)]
pub struct ChatClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    tokenizers: Arc<TokenizerCache>,
    token_counter: Option<SharedTokenCounter>,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_transport(Arc::new(HttpTransport::default()), base_url)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            tokenizers: Arc::new(TokenizerCache::new()),
            token_counter: None,
        }
    }

    /// Count tokens with `counter` instead of each model's BPE encoding.
    pub fn with_token_counter(mut self, counter: SharedTokenCounter) -> Self {
        self.token_counter = Some(counter);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Budget the request's history for its model.
    pub fn budget(&self, request: &CompletionRequest) -> Result<BudgetedContext, ConfigurationError> {
        let counter = match &self.token_counter {
            Some(counter) => Arc::clone(counter),
            None => self.tokenizers.counter_for(&request.model)?,
        };
        Ok(budget_with(
            counter.as_ref(),
            &request.model,
            request.system_prompt.as_deref(),
            request.temperature,
            &request.messages,
        ))
    }

    /// Run one completion call.
    ///
    /// Only configuration problems are returned as `Err`; every upstream or
    /// transport failure comes back as a failed [`CompletionResponse`]. No
    /// retries are attempted.
    pub async fn complete(
        &self,
        api_key: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ConfigurationError> {
        let model = &request.model;
        let context = self.budget(request)?;
        let (chat_request, warnings) =
            build_chat_request(model, &context, request.temperature.is_some());
        for warning in &warnings {
            warn!("{warning}");
        }

        let url = construct_api_url(&self.base_url, "chat/completions");
        debug!(
            model = %model.id,
            messages = chat_request.messages.len(),
            stream = chat_request.stream,
            "dispatching completion request"
        );

        let response = match self.transport.send(&url, api_key, &chat_request).await {
            Ok(response) => response,
            Err(err) => {
                warn!("completion request failed: {err}");
                return Ok(CompletionResponse::failed(err.into(), warnings));
            }
        };

        if !(200..300).contains(&response.status) {
            let body = read_body(response.body)
                .await
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default();
            warn!(status = response.status, "{}", format_api_error(&body));
            return Ok(CompletionResponse::failed(
                upstream_error(response.status, &body),
                warnings,
            ));
        }

        let outcome = if chat_request.stream {
            Ok(CompletionBody::Stream(FragmentStream::new(response.body)))
        } else {
            read_completion(response.body).await.map(CompletionBody::Text)
        };
        Ok(CompletionResponse { outcome, warnings })
    }
}

impl fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

async fn read_body(mut body: ByteStream) -> Result<Vec<u8>, TransportError> {
    let mut collected = Vec::new();
    while let Some(chunk) = body.next().await {
        collected.extend_from_slice(&chunk?);
    }
    Ok(collected)
}

async fn read_completion(body: ByteStream) -> Result<String, CompletionError> {
    let bytes = read_body(body).await?;
    let completion: ChatCompletion =
        serde_json::from_slice(&bytes).map_err(|err| CompletionError::Decode(err.to_string()))?;
    Ok(completion.text().unwrap_or_default().to_string())
}

fn upstream_error(status: u16, body: &str) -> CompletionError {
    let trimmed = body.trim();
    let status_text = serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|value| extract_error_summary(&value))
        .or_else(|| {
            let plain = !trimmed.is_empty() && !trimmed.starts_with('<') && trimmed.len() <= 200;
            plain.then(|| trimmed.to_string())
        })
        .or_else(|| {
            reqwest::StatusCode::from_u16(status)
                .ok()
                .and_then(|code| code.canonical_reason())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| format!("HTTP {status}"));

    match status {
        401 | 403 => CompletionError::Auth {
            status,
            status_text,
        },
        _ => CompletionError::Upstream {
            status,
            status_text,
        },
    }
}
