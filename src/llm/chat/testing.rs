use async_trait::async_trait;
use futures::{ stream, StreamExt };
use std::sync::Mutex;

use super::{ ChatClient, ChatStream };
use crate::error::LlmError;
use crate::models::chat::ChatMessage;

/// Replays a fixed list of deltas and records every request it receives.
pub(crate) struct ScriptedClient {
    chunks: Vec<Result<String, String>>,
    open_error: Option<String>,
    stall_at_end: bool,
    received: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedClient {
    pub(crate) fn new(chunks: &[&str]) -> Self {
        Self::with_results(chunks.iter().map(|c| Ok(c.to_string())).collect())
    }

    pub(crate) fn with_results(chunks: Vec<Result<String, String>>) -> Self {
        Self {
            chunks,
            open_error: None,
            stall_at_end: false,
            received: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_to_open(message: &str) -> Self {
        Self {
            open_error: Some(message.to_string()),
            ..Self::new(&[])
        }
    }

    /// Never ends after the scripted deltas, like a connection that went quiet.
    pub(crate) fn stalling(chunks: &[&str]) -> Self {
        Self {
            stall_at_end: true,
            ..Self::new(chunks)
        }
    }

    pub(crate) fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<ChatStream, LlmError> {
        self.received.lock().unwrap().push(messages.to_vec());
        if let Some(message) = &self.open_error {
            return Err(LlmError::Stream(message.clone()));
        }

        let items: Vec<Result<String, LlmError>> = self.chunks
            .iter()
            .map(|c| c.clone().map_err(LlmError::Stream))
            .collect();
        let scripted = stream::iter(items);
        if self.stall_at_end {
            Ok(Box::pin(scripted.chain(stream::pending())))
        } else {
            Ok(Box::pin(scripted))
        }
    }

    fn get_model(&self) -> String {
        "scripted".to_string()
    }

    fn get_base_url(&self) -> String {
        "http://scripted.invalid".to_string()
    }
}
