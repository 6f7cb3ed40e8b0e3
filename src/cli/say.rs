//! One-shot "say" command

use std::error::Error;
use std::io::{self, Write};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cli::{resolve_model, session_or_exit};
use crate::core::chat_stream::{ChatStreamService, StreamMessage, StreamParams};
use crate::core::completion::{ChatClient, CompletionRequest};
use crate::core::config::Config;
use crate::core::message::Message;

/// How a streamed reply finished.
#[derive(Debug, PartialEq)]
pub enum ReplyOutcome {
    Complete(String),
    /// The stream failed; the text received before the failure is kept.
    Failed { partial: String, error: String },
}

/// Run `request`, writing chunks to `out` as they arrive and notices to stderr.
pub async fn stream_reply<W: Write>(
    client: &ChatClient,
    api_key: &str,
    request: CompletionRequest,
    out: &mut W,
) -> io::Result<ReplyOutcome> {
    let (service, mut rx) = ChatStreamService::new();
    let handle = service.spawn_stream(StreamParams {
        client: client.clone(),
        api_key: api_key.to_string(),
        request,
        cancel_token: CancellationToken::new(),
        stream_id: 0,
    });
    drop(service);

    let mut reply = String::new();
    let mut error = None;
    while let Some((message, _)) = rx.recv().await {
        match message {
            StreamMessage::Chunk(content) => {
                reply.push_str(&content);
                out.write_all(content.as_bytes())?;
                out.flush()?;
            }
            StreamMessage::Notice(notice) => eprintln!("ℹ️  {notice}"),
            StreamMessage::Error(err) => error = Some(err),
            StreamMessage::End => break,
        }
    }
    if let Err(err) = handle.await {
        debug!(error = %err, "stream task did not finish cleanly");
    }

    Ok(match error {
        Some(error) => ReplyOutcome::Failed {
            partial: reply,
            error,
        },
        None => ReplyOutcome::Complete(reply),
    })
}

pub async fn run_say(prompt: String, model: Option<String>) -> Result<(), Box<dyn Error>> {
    let prompt = prompt.trim().to_string();
    if prompt.is_empty() {
        eprintln!("Usage: chatpipe say <prompt>");
        std::process::exit(1);
    }

    let config = Config::load()?;
    let session = session_or_exit(&config);
    let model = resolve_model(&config, model.as_deref())?;
    debug!(model = %model.id, base_url = %session.base_url, "sending one-shot prompt");

    let mut request = CompletionRequest::new(model, vec![Message::user(prompt)])
        .with_temperature(config.temperature);
    if let Some(system_prompt) = config.system_prompt.as_deref() {
        request = request.with_system_prompt(system_prompt);
    }

    let client = ChatClient::new(session.base_url);
    let mut stdout = io::stdout();
    match stream_reply(&client, &session.api_key, request, &mut stdout).await? {
        ReplyOutcome::Complete(_) => {
            println!();
            Ok(())
        }
        ReplyOutcome::Failed { error, .. } => {
            eprintln!("\n❌ Error: {error}");
            std::process::exit(1);
        }
    }
}
