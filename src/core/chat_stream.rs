//! Transcoding of the provider's event stream into text fragments.
//!
//! [`SseDecoder`] is push-based: feed it raw transport chunks and it returns
//! the events that became complete. [`FragmentStream`] drives a decoder from a
//! response body and yields only the text deltas, in upstream order.
//! [`ChatStreamService`] runs a completion on a background task and forwards
//! it as [`StreamMessage`]s over a channel for UIs that prefer push delivery.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{FusedStream, Stream};
use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::ChatResponse;
use crate::core::completion::{ByteStream, ChatClient, CompletionBody, CompletionRequest};
use crate::core::error::CompletionError;

/// Frames larger than this are abandoned as malformed.
const MAX_PENDING_FRAME_BYTES: usize = 1024 * 1024;

/// A decoded unit of the upstream event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Non-empty text delta from `choices[0].delta.content`.
    Delta(String),
    /// The provider's end marker (`[DONE]`).
    Done,
    /// The provider reported an error inside the stream.
    ApiError(String),
    /// A frame that could not be decoded; carries the raw payload.
    Malformed(String),
}

/// Incremental decoder for `data:`-framed (or bare newline-delimited) JSON
/// events.
///
/// Bytes are buffered until a newline arrives, so a frame split across two
/// transport chunks (even inside a multi-byte character) is reassembled before
/// it is parsed. `data:` lines of one SSE event are joined until they form a
/// complete JSON value; a bare JSON line is always a frame on its own. Lines
/// longer than 1 MiB are dropped as malformed.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    pending: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supply the next raw chunk; returns every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            self.process_raw_line(&line[..newline_pos], &mut events);
        }
        if self.buffer.len() > MAX_PENDING_FRAME_BYTES {
            warn!(
                bytes = self.buffer.len(),
                "dropping oversized line from completion stream"
            );
            let raw = std::mem::take(&mut self.buffer);
            events.push(SseEvent::Malformed(String::from_utf8_lossy(&raw).into_owned()));
        }
        events
    }

    /// Flush whatever is left once the transport has ended.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_raw_line(&line, &mut events);
        }
        if !self.pending.is_empty() {
            events.push(SseEvent::Malformed(std::mem::take(&mut self.pending)));
        }
        events
    }

    fn process_raw_line(&mut self, raw: &[u8], events: &mut Vec<SseEvent>) {
        match std::str::from_utf8(raw) {
            Ok(line) => self.process_line(line.trim(), events),
            Err(err) => {
                warn!("invalid UTF-8 in completion stream: {err}");
                events.push(SseEvent::Malformed(String::from_utf8_lossy(raw).into_owned()));
            }
        }
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            // Event boundary: anything still pending can no longer complete.
            self.flush_pending(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }

        match extract_data_payload(line) {
            Some("[DONE]") => {
                self.flush_pending(events);
                events.push(SseEvent::Done);
            }
            Some(payload) => self.push_data_payload(payload, events),
            // Each bare JSON line is a frame of its own.
            None if line.starts_with('{') || line.starts_with('[') => {
                self.flush_pending(events);
                match serde_json::from_str::<serde_json::Value>(line) {
                    Ok(value) => events.extend(classify_frame(value, line)),
                    Err(_) => events.push(SseEvent::Malformed(line.to_string())),
                }
            }
            // `event:`, `id:`, `retry:` and other SSE fields carry no text.
            None => {}
        }
    }

    /// Accumulate a `data:` payload, joining it to the lines of the same event
    /// until they form one JSON value.
    fn push_data_payload(&mut self, payload: &str, events: &mut Vec<SseEvent>) {
        if !self.pending.is_empty() {
            let joined = format!("{}\n{payload}", self.pending);
            match serde_json::from_str::<serde_json::Value>(&joined) {
                Ok(value) => {
                    self.pending.clear();
                    events.extend(classify_frame(value, &joined));
                    return;
                }
                Err(err) if err.is_eof() && joined.len() <= MAX_PENDING_FRAME_BYTES => {
                    // A payload that stands on its own starts a new frame.
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
                        self.flush_pending(events);
                        events.extend(classify_frame(value, payload));
                    } else {
                        self.pending = joined;
                    }
                    return;
                }
                Err(_) => self.flush_pending(events),
            }
        }

        match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(value) => events.extend(classify_frame(value, payload)),
            Err(err) if err.is_eof() && payload.len() <= MAX_PENDING_FRAME_BYTES => {
                self.pending.push_str(payload);
            }
            Err(_) => events.push(SseEvent::Malformed(payload.to_string())),
        }
    }

    fn flush_pending(&mut self, events: &mut Vec<SseEvent>) {
        if !self.pending.is_empty() {
            events.push(SseEvent::Malformed(std::mem::take(&mut self.pending)));
        }
    }
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn classify_frame(value: serde_json::Value, raw: &str) -> Option<SseEvent> {
    if value.get("error").is_some() {
        return Some(SseEvent::ApiError(format_api_error(raw)));
    }
    match serde_json::from_value::<ChatResponse>(value) {
        Ok(response) => {
            let text = response.delta_text();
            (!text.is_empty()).then(|| SseEvent::Delta(text.to_string()))
        }
        Err(_) => Some(SseEvent::Malformed(raw.to_string())),
    }
}

pub(crate) fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|text| !text.is_empty())
}

/// Render an upstream error body for display: a one-line summary when one
/// can be found, followed by the pretty-printed body.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error:\n```\n<empty>\n```".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            return match extract_error_summary(&json_value) {
                Some(summary) => format!("API Error: {summary}\n```json\n{pretty_json}\n```"),
                None => format!("API Error:\n```json\n{pretty_json}\n```"),
            };
        }
    }

    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        format!("API Error:\n```xml\n{trimmed}\n```")
    } else {
        format!("API Error:\n```\n{trimmed}\n```")
    }
}

/// Lazy, single-pass sequence of text fragments from a streaming completion.
///
/// Yields `Ok(fragment)` in upstream order and ends after `[DONE]` or the end
/// of the body. A transport failure or an upstream error frame is yielded once
/// as the final `Err`; fragments already yielded stay valid. Malformed frames
/// are skipped and counted. Dropping the stream drops the response body, which
/// releases the underlying connection.
pub struct FragmentStream {
    body: Option<ByteStream>,
    decoder: SseDecoder,
    queued: VecDeque<Result<String, CompletionError>>,
    skipped_frames: usize,
}

impl FragmentStream {
    pub fn new(body: ByteStream) -> Self {
        Self {
            body: Some(body),
            decoder: SseDecoder::new(),
            queued: VecDeque::new(),
            skipped_frames: 0,
        }
    }

    /// Number of frames dropped because they could not be decoded.
    pub fn skipped_frames(&self) -> usize {
        self.skipped_frames
    }

    /// Concatenate the remaining fragments.
    pub async fn collect_text(mut self) -> Result<String, CompletionError> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }

    fn absorb(&mut self, events: Vec<SseEvent>) {
        for event in events {
            match event {
                SseEvent::Delta(text) => self.queued.push_back(Ok(text)),
                SseEvent::Malformed(raw) => {
                    self.skipped_frames += 1;
                    warn!(bytes = raw.len(), "skipping malformed completion frame");
                }
                SseEvent::Done => {
                    debug!("completion stream finished");
                    self.close();
                    return;
                }
                SseEvent::ApiError(message) => {
                    self.queued.push_back(Err(CompletionError::Api(message)));
                    self.close();
                    return;
                }
            }
        }
    }

    fn close(&mut self) {
        self.body = None;
    }
}

impl Stream for FragmentStream {
    type Item = Result<String, CompletionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.queued.pop_front() {
                return Poll::Ready(Some(item));
            }
            let Some(body) = this.body.as_mut() else {
                return Poll::Ready(None);
            };
            match body.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    let events = this.decoder.push(&chunk);
                    this.absorb(events);
                }
                Poll::Ready(Some(Err(err))) => {
                    warn!("completion stream interrupted: {err}");
                    this.queued.push_back(Err(err.into()));
                    this.close();
                }
                Poll::Ready(None) => {
                    let events = this.decoder.finish();
                    this.absorb(events);
                    this.close();
                }
            }
        }
    }
}

impl FusedStream for FragmentStream {
    fn is_terminated(&self) -> bool {
        self.body.is_none() && self.queued.is_empty()
    }
}

impl std::fmt::Debug for FragmentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentStream")
            .field("open", &self.body.is_some())
            .field("queued", &self.queued.len())
            .field("skipped_frames", &self.skipped_frames)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamMessage {
    Chunk(String),
    /// Capability notice for the caller (e.g. the model ignores system prompts).
    Notice(String),
    Error(String),
    End,
}

pub struct StreamParams {
    pub client: ChatClient,
    pub api_key: String,
    pub request: CompletionRequest,
    pub cancel_token: tokio_util::sync::CancellationToken,
    pub stream_id: u64,
}

/// Push-style wrapper around [`ChatClient::complete`].
///
/// Every spawned stream ends with exactly one [`StreamMessage::End`] unless it
/// is cancelled, in which case nothing further is sent.
#[derive(Clone)]
pub struct ChatStreamService {
    tx: mpsc::UnboundedSender<(StreamMessage, u64)>,
}

impl ChatStreamService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(StreamMessage, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn spawn_stream(&self, params: StreamParams) -> tokio::task::JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let StreamParams {
                client,
                api_key,
                request,
                cancel_token,
                stream_id,
            } = params;

            tokio::select! {
                _ = forward_completion(&client, &api_key, &request, &tx, stream_id) => {}
                _ = cancel_token.cancelled() => {
                    debug!(stream_id, "completion stream cancelled");
                }
            }
        })
    }
}

async fn forward_completion(
    client: &ChatClient,
    api_key: &str,
    request: &CompletionRequest,
    tx: &mpsc::UnboundedSender<(StreamMessage, u64)>,
    stream_id: u64,
) {
    let send = |message: StreamMessage| tx.send((message, stream_id)).is_ok();

    let response = match client.complete(api_key, request).await {
        Ok(response) => response,
        Err(err) => {
            send(StreamMessage::Error(err.to_string()));
            send(StreamMessage::End);
            return;
        }
    };

    for warning in &response.warnings {
        send(StreamMessage::Notice(warning.to_string()));
    }

    match response.outcome {
        Ok(CompletionBody::Text(text)) => {
            send(StreamMessage::Chunk(text));
        }
        Ok(CompletionBody::Stream(mut fragments)) => {
            while let Some(fragment) = fragments.next().await {
                let delivered = match fragment {
                    Ok(text) => send(StreamMessage::Chunk(text)),
                    Err(err) => send(StreamMessage::Error(err.status_text())),
                };
                if !delivered {
                    // Receiver is gone; dropping `fragments` closes the connection.
                    return;
                }
            }
        }
        Err(err) => {
            send(StreamMessage::Error(err.status_text()));
        }
    }
    send(StreamMessage::End);
}

#[cfg(test)]
mod tests;
