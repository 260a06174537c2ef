pub mod openai;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use futures::{ Future, Stream };
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::LlmConfig;
use self::openai::OpenAIChatClient;
use crate::error::{ ConfigError, LlmError };
use crate::models::chat::ChatMessage;

/// Content deltas in arrival order. Dropping the stream aborts the request.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<ChatStream, LlmError>;

    fn get_model(&self) -> String;
    fn get_base_url(&self) -> String;
}

/// Runs `producer` on its own task and exposes what it sends as a stream.
pub fn create_streaming_response<F, Fut>(producer: F) -> ChatStream
    where
        F: FnOnce(mpsc::Sender<Result<String, LlmError>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        producer(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatClient>, ConfigError> {
    let client = OpenAIChatClient::from_config(config)?;
    Ok(Arc::new(client))
}
