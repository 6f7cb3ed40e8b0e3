use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::core::completion::{ChatClient, CompletionBody, CompletionRequest};
use crate::core::models::ModelDescriptor;
use crate::utils::test_utils::{create_test_messages, sse_frame, ScriptedTransport, WordCounter};

fn deltas(events: &[SseEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| match event {
            SseEvent::Delta(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[test]
fn decoder_handles_spacing_variants_and_done() {
    let mut decoder = SseDecoder::new();
    let events = decoder.push(
        b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
          data:{\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n\
          data:[DONE]\n\n",
    );

    assert_eq!(
        events,
        vec![
            SseEvent::Delta("Hello".to_string()),
            SseEvent::Delta(" world".to_string()),
            SseEvent::Done,
        ]
    );
}

#[test]
fn decoder_reassembles_frames_split_across_chunks() {
    let frame = sse_frame("héllo");
    let bytes = frame.as_bytes();
    // Split inside the two-byte 'é' as well as inside the JSON.
    let split = frame.find('é').unwrap() + 1;

    let mut decoder = SseDecoder::new();
    assert!(decoder.push(&bytes[..10]).is_empty());
    assert!(decoder.push(&bytes[10..split]).is_empty());
    assert_eq!(deltas(&decoder.push(&bytes[split..])), vec!["héllo"]);
    assert!(decoder.finish().is_empty());
}

#[test]
fn decoder_joins_json_spread_over_several_data_lines() {
    let mut decoder = SseDecoder::new();
    let events = decoder.push(
        b"data: {\"choices\":\n\
          data: [{\"delta\":{\"content\":\"joined\"}}]}\n\n",
    );
    assert_eq!(deltas(&events), vec!["joined"]);
}

#[test]
fn decoder_accepts_bare_newline_delimited_json() {
    let mut decoder = SseDecoder::new();
    let events = decoder.push(
        b"{\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n{\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
    );
    assert_eq!(deltas(&events), vec!["a", "b"]);
}

#[test]
fn decoder_ignores_role_only_finish_and_sse_fields() {
    let mut decoder = SseDecoder::new();
    let events = decoder.push(
        b": keep-alive\n\
          event: completion\n\
          id: 7\n\
          data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
          data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\n\
          data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    );
    assert!(events.is_empty());
}

#[test]
fn decoder_flags_malformed_frames_and_keeps_going() {
    let mut decoder = SseDecoder::new();
    let mut input = sse_frame("before");
    input.push_str("data: {\"choices\": [oops]}\n\n");
    input.push_str(&sse_frame("after"));

    let events = decoder.push(input.as_bytes());
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], SseEvent::Delta("before".to_string()));
    assert!(matches!(&events[1], SseEvent::Malformed(raw) if raw.contains("oops")));
    assert_eq!(events[2], SseEvent::Delta("after".to_string()));
}

#[test]
fn decoder_reports_truncated_frame_at_event_boundary_and_finish() {
    let mut decoder = SseDecoder::new();
    let events = decoder.push(b"data: {\"choices\":[\n\n");
    assert!(matches!(&events[..], [SseEvent::Malformed(_)]));

    assert!(decoder.push(b"data: {\"choices\"").is_empty());
    assert!(matches!(&decoder.finish()[..], [SseEvent::Malformed(_)]));
}

#[test]
fn decoder_keeps_ndjson_frames_after_a_truncated_line() {
    let mut decoder = SseDecoder::new();
    let mut events = decoder.push(
        b"{\"choices\":[{\"delta\":{\"content\":\"a\"}\n\
          {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\
          {\"choices\":[\n\
          {\"choices\":[{\"delta\":{\"content\":\"c\"}}]}\n",
    );
    events.extend(decoder.finish());

    assert_eq!(deltas(&events), vec!["b", "c"]);
    let malformed: Vec<_> = events
        .iter()
        .filter(|event| matches!(event, SseEvent::Malformed(_)))
        .collect();
    assert_eq!(malformed.len(), 2);
    assert!(matches!(&events[0], SseEvent::Malformed(raw) if raw.contains("\"a\"")));
    assert_eq!(events[1], SseEvent::Delta("b".to_string()));
    assert!(matches!(&events[2], SseEvent::Malformed(raw) if !raw.contains("\"c\"")));
}

#[test]
fn decoder_starts_over_when_a_data_line_stands_alone() {
    let mut decoder = SseDecoder::new();
    let events = decoder.push(
        b"data: {\"choices\":[\n\
          data: {\"choices\":[{\"delta\":{\"content\":\"fresh\"}}]}\n\n",
    );
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], SseEvent::Malformed(raw) if !raw.contains("fresh")));
    assert_eq!(events[1], SseEvent::Delta("fresh".to_string()));
}

#[test]
fn decoder_sees_done_after_a_truncated_frame() {
    let mut decoder = SseDecoder::new();
    let events = decoder.push(b"data: {\"choices\":[{\"delta\"\ndata: [DONE]\n\n");
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], SseEvent::Malformed(_)));
    assert_eq!(events[1], SseEvent::Done);
    assert!(decoder.finish().is_empty());

    let mut decoder = SseDecoder::new();
    let events = decoder.push(b"{\"choices\":[\ndata: [DONE]\n");
    assert!(matches!(&events[..], [SseEvent::Malformed(_), SseEvent::Done]));
}

#[test]
fn decoder_drops_oversized_lines_without_newline() {
    let mut decoder = SseDecoder::new();
    let mut oversized = b"data: {\"choices\":\"".to_vec();
    oversized.resize(MAX_PENDING_FRAME_BYTES + 16, b'x');

    let events = decoder.push(&oversized);
    assert!(matches!(&events[..], [SseEvent::Malformed(raw)] if raw.len() > MAX_PENDING_FRAME_BYTES));

    // The tail of the dropped line ends at the next newline as noise, then
    // decoding resumes.
    let events = decoder.push(format!("xxx\"}}\n\n{}", sse_frame("next")).as_bytes());
    assert_eq!(deltas(&events), vec!["next"]);
}

#[test]
fn decoder_flushes_a_final_line_without_newline() {
    let mut decoder = SseDecoder::new();
    let frame = sse_frame("tail");
    assert!(decoder.push(frame.trim_end().as_bytes()).is_empty());
    assert_eq!(deltas(&decoder.finish()), vec!["tail"]);
}

#[test]
fn decoder_routes_stream_errors() {
    let mut decoder = SseDecoder::new();
    let events = decoder.push(b"data: {\"error\":{\"message\":\"internal server error\"}}\n\n");

    let expected = r#"API Error: internal server error
```json
{
  "error": {
    "message": "internal server error"
  }
}
```"#;
    assert_eq!(events, vec![SseEvent::ApiError(expected.to_string())]);
}

#[test]
fn format_api_error_prettifies_json_with_summary() {
    let raw = r#"{"error":{"message":"model   overloaded","type":"invalid_request_error"}}"#;
    let expected = r#"API Error: model overloaded
```json
{
  "error": {
    "message": "model   overloaded",
    "type": "invalid_request_error"
  }
}
```"#;
    assert_eq!(format_api_error(raw), expected);
}

#[test]
fn format_api_error_handles_xml_plaintext_and_empty() {
    assert_eq!(
        format_api_error("<error>bad</error>"),
        "API Error:\n```xml\n<error>bad</error>\n```"
    );
    assert_eq!(format_api_error("api failure"), "API Error:\n```\napi failure\n```");
    assert_eq!(format_api_error("  "), "API Error:\n```\n<empty>\n```");
}

fn streaming_request() -> CompletionRequest {
    CompletionRequest::new(
        ModelDescriptor::new("gpt-4o", "GPT-4o", 128_000),
        create_test_messages(),
    )
}

fn client_for(transport: Arc<ScriptedTransport>) -> ChatClient {
    ChatClient::with_transport(transport, "https://api.test.com/v1")
        .with_token_counter(Arc::new(WordCounter))
}

async fn open_stream(transport: Arc<ScriptedTransport>) -> FragmentStream {
    let response = client_for(transport)
        .complete("sk-test", &streaming_request())
        .await
        .unwrap();
    match response.outcome {
        Ok(CompletionBody::Stream(stream)) => stream,
        other => panic!("expected a stream, got {other:?}"),
    }
}

#[tokio::test]
async fn fragments_arrive_in_order_and_skip_malformed_frames() {
    let first = sse_frame("one ");
    let malformed = "data: {not json}\n\n";
    let last = sse_frame("two");
    let transport = Arc::new(ScriptedTransport::new(
        200,
        vec![first.as_str(), malformed, last.as_str(), "data: [DONE]\n\n"],
    ));

    let mut stream = open_stream(Arc::clone(&transport)).await;
    let mut fragments = Vec::new();
    while let Some(fragment) = stream.next().await {
        fragments.push(fragment.unwrap());
    }

    assert_eq!(fragments, vec!["one ", "two"]);
    assert_eq!(stream.skipped_frames(), 1);
    assert!(stream.is_terminated());
    assert!(transport.is_closed());
}

#[tokio::test]
async fn truncated_ndjson_frame_does_not_swallow_later_fragments() {
    let transport = Arc::new(ScriptedTransport::new(
        200,
        vec![
            "{\"choices\":[{\"delta\":{\"content\":\"one \"}}]}\n",
            "{\"choices\":[{\"delta\":{\"content\":\"lost\"}\n",
            "{\"choices\":[{\"delta\":{\"content\":\"two\"}}]}\n",
            "data: [DONE]\n",
        ],
    ));

    let mut stream = open_stream(Arc::clone(&transport)).await;
    let mut fragments = Vec::new();
    while let Some(fragment) = stream.next().await {
        fragments.push(fragment.unwrap());
    }

    assert_eq!(fragments, vec!["one ", "two"]);
    assert_eq!(stream.skipped_frames(), 1);
    assert!(transport.is_closed());
}

#[tokio::test]
async fn done_marker_ends_the_stream_and_releases_the_body() {
    let early = sse_frame("kept");
    let after_done = sse_frame("never");
    let transport = Arc::new(
        ScriptedTransport::new(
            200,
            vec![early.as_str(), "data: [DONE]\n\n", after_done.as_str()],
        )
        .held_open(),
    );

    let text = open_stream(Arc::clone(&transport)).await.collect_text().await;
    assert_eq!(text.unwrap(), "kept");
    assert!(transport.is_closed());
}

#[tokio::test]
async fn transport_failure_mid_stream_keeps_earlier_fragments() {
    let first = sse_frame("partial");
    let transport =
        Arc::new(ScriptedTransport::new(200, vec![first.as_str()]).then_fail("connection reset"));

    let mut stream = open_stream(transport).await;
    assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
    assert_eq!(
        stream.next().await.unwrap(),
        Err(CompletionError::Transport("connection reset".to_string()))
    );
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn upstream_error_frame_terminates_the_stream() {
    let first = sse_frame("ok");
    let transport = Arc::new(ScriptedTransport::new(
        200,
        vec![first.as_str(), "data: {\"error\":{\"message\":\"overloaded\"}}\n\n"],
    ));

    let mut stream = open_stream(transport).await;
    assert_eq!(stream.next().await.unwrap().unwrap(), "ok");
    let err = stream.next().await.unwrap().unwrap_err();
    assert!(err.status_text().starts_with("API Error: overloaded"));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn abandoning_a_stream_releases_the_connection() {
    let first = sse_frame("a");
    let second = sse_frame("b");
    let transport =
        Arc::new(ScriptedTransport::new(200, vec![first.as_str(), second.as_str()]).held_open());

    let mut stream = open_stream(Arc::clone(&transport)).await;
    assert_eq!(stream.next().await.unwrap().unwrap(), "a");
    assert_eq!(stream.next().await.unwrap().unwrap(), "b");
    assert!(!transport.is_closed());

    drop(stream);
    assert!(transport.is_closed());
}

#[tokio::test]
async fn service_forwards_chunks_then_end() {
    let first = sse_frame("Hello");
    let second = sse_frame(", world");
    let transport = Arc::new(ScriptedTransport::new(
        200,
        vec![first.as_str(), second.as_str(), "data: [DONE]\n\n"],
    ));

    let (service, mut rx) = ChatStreamService::new();
    service
        .spawn_stream(StreamParams {
            client: client_for(transport),
            api_key: "sk-test".to_string(),
            request: streaming_request(),
            cancel_token: CancellationToken::new(),
            stream_id: 7,
        })
        .await
        .unwrap();

    let mut received = Vec::new();
    while let Ok(message) = rx.try_recv() {
        received.push(message);
    }
    assert_eq!(
        received,
        vec![
            (StreamMessage::Chunk("Hello".to_string()), 7),
            (StreamMessage::Chunk(", world".to_string()), 7),
            (StreamMessage::End, 7),
        ]
    );
}

#[tokio::test]
async fn service_reports_capability_notices_and_failures() {
    let transport = Arc::new(ScriptedTransport::new(
        401,
        vec![r#"{"error":{"message":"Incorrect API key provided"}}"#],
    ));
    let request = CompletionRequest::new(
        ModelDescriptor::new("o1-mini", "o1-mini", 128_000).without_system_prompt(),
        create_test_messages(),
    );

    let (service, mut rx) = ChatStreamService::new();
    service
        .spawn_stream(StreamParams {
            client: client_for(transport),
            api_key: "bad".to_string(),
            request,
            cancel_token: CancellationToken::new(),
            stream_id: 1,
        })
        .await
        .unwrap();

    let messages: Vec<StreamMessage> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|(message, _)| message)
        .collect();
    assert!(matches!(&messages[0], StreamMessage::Notice(text) if text.contains("system prompts")));
    assert_eq!(
        messages[1],
        StreamMessage::Error("Incorrect API key provided".to_string())
    );
    assert_eq!(messages[2], StreamMessage::End);
}

#[tokio::test]
async fn cancelling_the_service_closes_the_upstream() {
    let first = sse_frame("a");
    let transport = Arc::new(ScriptedTransport::new(200, vec![first.as_str()]).held_open());
    let cancel_token = CancellationToken::new();

    let (service, mut rx) = ChatStreamService::new();
    let handle = service.spawn_stream(StreamParams {
        client: client_for(Arc::clone(&transport)),
        api_key: "sk-test".to_string(),
        request: streaming_request(),
        cancel_token: cancel_token.clone(),
        stream_id: 3,
    });

    let (first_message, _) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first_message, StreamMessage::Chunk("a".to_string()));

    cancel_token.cancel();
    handle.await.unwrap();
    assert!(transport.is_closed());
    assert!(rx.try_recv().is_err());
}
