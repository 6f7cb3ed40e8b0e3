use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};

use crate::api::ChatRequest;
use crate::core::completion::{ByteStream, Transport, TransportResponse};
use crate::core::error::TransportError;
use crate::core::message::Message;
use crate::core::tokenizer::TokenCounter;

/// One token per whitespace-separated word.
pub struct WordCounter;

impl TokenCounter for WordCounter {
    fn count_text(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

pub fn sse_frame(content: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"choices": [{"delta": {"content": content}}]})
    )
}

pub fn create_test_messages() -> Vec<Message> {
    vec![
        Message::user("Hello"),
        Message::assistant("Hi there!"),
        Message::user("How are you?"),
    ]
}

/// Transport that replays a fixed response and records what it was sent.
pub struct ScriptedTransport {
    status: u16,
    chunks: Vec<Result<Bytes, TransportError>>,
    hold_open: bool,
    connect_error: Option<TransportError>,
    requests: Mutex<Vec<ChatRequest>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedTransport {
    pub fn new(status: u16, chunks: Vec<&str>) -> Self {
        Self {
            status,
            chunks: chunks
                .into_iter()
                .map(|chunk| Ok(Bytes::from(chunk.to_string())))
                .collect(),
            hold_open: false,
            connect_error: None,
            requests: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn failing_to_connect(message: &str) -> Self {
        let mut transport = Self::new(200, Vec::new());
        transport.connect_error = Some(TransportError(message.to_string()));
        transport
    }

    /// Fail the body with `message` after the scripted chunks.
    pub fn then_fail(mut self, message: &str) -> Self {
        self.chunks.push(Err(TransportError(message.to_string())));
        self
    }

    /// Keep the body open (pending) after the scripted chunks.
    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        _url: &str,
        _api_key: &str,
        request: &ChatRequest,
    ) -> Result<TransportResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(err) = &self.connect_error {
            return Err(err.clone());
        }

        let scripted = stream::iter(self.chunks.clone());
        let inner: ByteStream = if self.hold_open {
            scripted.chain(stream::pending()).boxed()
        } else {
            scripted.boxed()
        };
        Ok(TransportResponse {
            status: self.status,
            body: Box::pin(GuardedBody {
                inner,
                closed: Arc::clone(&self.closed),
            }),
        })
    }
}

/// Marks the connection closed when the body is dropped.
struct GuardedBody {
    inner: ByteStream,
    closed: Arc<AtomicBool>,
}

impl Stream for GuardedBody {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for GuardedBody {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
