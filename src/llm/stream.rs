use futures::{ Stream, StreamExt };
use log::{ error, info };
use tokio_util::sync::CancellationToken;

use super::chat::ChatClient;
use crate::error::LlmError;
use crate::models::chat::ChatMessage;

pub const ERROR_PREFIX: &str = "Sorry, an error occurred: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed(String),
    /// Stopped by the user; carries whatever arrived before the stop.
    Cancelled(String),
    Failed {
        partial: String,
        error: String,
    },
}

impl GenerationOutcome {
    /// Text to show as the assistant reply.
    pub fn reply(&self) -> String {
        match self {
            GenerationOutcome::Completed(text) | GenerationOutcome::Cancelled(text) => text.clone(),
            GenerationOutcome::Failed { error, .. } => format_error(error),
        }
    }
}

pub fn format_error(message: &str) -> String {
    format!("{}{}", ERROR_PREFIX, message)
}

/// Drains `stream` into an accumulator, calling `on_token` with the text so far
/// after every delta. The token is checked before each delta is applied, and a
/// stalled stream is abandoned as soon as the token fires.
pub async fn consume_stream<S, F>(
    mut stream: S,
    cancel: &CancellationToken,
    mut on_token: F
) -> GenerationOutcome
    where S: Stream<Item = Result<String, LlmError>> + Unpin, F: FnMut(&str)
{
    let mut accumulated = String::new();

    loop {
        if cancel.is_cancelled() {
            return GenerationOutcome::Cancelled(accumulated);
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return GenerationOutcome::Cancelled(accumulated);
            }
            item = stream.next() => item,
        };

        match next {
            Some(Ok(delta)) => {
                if cancel.is_cancelled() {
                    return GenerationOutcome::Cancelled(accumulated);
                }
                accumulated.push_str(&delta);
                on_token(&accumulated);
            }
            Some(Err(e)) => {
                error!("Stream failed after {} chars: {}", accumulated.len(), e);
                return GenerationOutcome::Failed {
                    partial: accumulated,
                    error: e.to_string(),
                };
            }
            None => {
                return GenerationOutcome::Completed(accumulated);
            }
        }
    }
}

/// Opens a streamed completion and consumes it. Never fails: transport errors
/// come back as [`GenerationOutcome::Failed`].
pub async fn generate<F>(
    client: &dyn ChatClient,
    messages: &[ChatMessage],
    cancel: &CancellationToken,
    on_token: F
) -> GenerationOutcome
    where F: FnMut(&str)
{
    info!("Requesting completion from {} ({} messages)", client.get_model(), messages.len());
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return GenerationOutcome::Cancelled(String::new());
        }
        opened = client.stream_chat(messages) => opened,
    };

    match opened {
        Ok(stream) => consume_stream(stream, cancel, on_token).await,
        Err(e) => {
            error!("Failed to open completion stream: {}", e);
            GenerationOutcome::Failed {
                partial: String::new(),
                error: e.to_string(),
            }
        }
    }
}
