use async_trait::async_trait;
use futures::StreamExt;
use log::{ debug, error, info };
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };

use super::{ create_streaming_response, ChatClient, ChatStream };
use crate::error::{ ConfigError, LlmError };
use crate::llm::LlmConfig;
use crate::models::chat::ChatMessage;

/// Client for any OpenAI-compatible `/chat/completions` endpoint (DeepSeek by default).
pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct OpenAIMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage<'a>>,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    error: Option<OpenAIStreamError>,
}

#[derive(Deserialize)]
struct OpenAIStreamError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: Option<OpenAIDelta>,
    #[serde(rename = "finish_reason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum SseEvent {
    /// A chunk arrived; `None` when it carried no content.
    Delta(Option<String>),
    Finished,
    Done,
    /// The endpoint reported a failure inside the stream.
    Error(String),
    Ignore,
}

pub(crate) fn parse_sse_line(line: &str) -> SseEvent {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Ignore;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    match serde_json::from_str::<OpenAIStreamResponse>(data) {
        Ok(resp) => {
            if let Some(err) = resp.error {
                let message = if err.message.is_empty() {
                    "completion endpoint reported an error".to_string()
                } else {
                    err.message
                };
                return SseEvent::Error(message);
            }
            let Some(choice) = resp.choices.into_iter().next() else {
                return SseEvent::Delta(None);
            };
            let content = choice.delta.and_then(|d| d.content).filter(|c| !c.is_empty());
            match (content, choice.finish_reason.as_deref()) {
                (None, Some("stop")) => SseEvent::Finished,
                (content, _) => SseEvent::Delta(content),
            }
        }
        Err(e) => {
            info!("JSON parse error: {} for data: {}", e, data);
            SseEvent::Ignore
        }
    }
}

/// Reassembles lines that were split across transport reads.
#[derive(Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest).filter(|l| !l.trim().is_empty())
    }
}

impl OpenAIChatClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        config: &LlmConfig
    ) -> Result<Self, ConfigError> {
        let chat_model = model.unwrap_or_else(|| config.llm_type.default_model().to_string());
        let api_url = base_url.unwrap_or_else(|| config.llm_type.default_base_url().to_string());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
                ConfigError::HttpClient(format!("Invalid API key format: {}", e))
            )?
        );

        let mut builder = HttpClient::builder().default_headers(headers);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            http,
            model: chat_model,
            base_url: api_url,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ConfigError> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        Self::new(api_key, config.completion_model.clone(), config.base_url.clone(), config)
    }

    fn completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{}/chat/completions", base)
        }
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<ChatStream, LlmError> {
        let req = OpenAIChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| OpenAIMessage { role: m.role.as_str(), content: &m.content })
                .collect(),
            stream: true,
        };

        let resp = self.http.post(self.completions_url()).json(&req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!("Completion endpoint returned {}: {}", status, body);
            return Err(LlmError::Status { status: status.as_u16(), body });
        }

        Ok(
            create_streaming_response(move |tx| async move {
                let mut bytes = resp.bytes_stream();
                let mut lines = LineBuffer::default();

                loop {
                    // A dropped receiver closes the connection even while the endpoint is silent.
                    let next = tokio::select! {
                        _ = tx.closed() => {
                            debug!("Completion stream dropped; aborting request");
                            return;
                        }
                        next = bytes.next() => next,
                    };
                    let Some(chunk_result) = next else {
                        break;
                    };
                    let chunk = match chunk_result {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            let _ = tx.send(Err(LlmError::Http(e))).await;
                            return;
                        }
                    };

                    for line in lines.push(&chunk) {
                        debug!("Completion stream line: {}", line);
                        match parse_sse_line(&line) {
                            SseEvent::Delta(Some(content)) => {
                                if tx.send(Ok(content)).await.is_err() {
                                    return;
                                }
                            }
                            SseEvent::Error(message) => {
                                error!("Completion stream reported an error: {}", message);
                                let _ = tx.send(Err(LlmError::Stream(message))).await;
                                return;
                            }
                            SseEvent::Delta(None) | SseEvent::Ignore => {}
                            SseEvent::Finished | SseEvent::Done => {
                                return;
                            }
                        }
                    }
                }

                if let Some(line) = lines.finish() {
                    match parse_sse_line(&line) {
                        SseEvent::Delta(Some(content)) => {
                            let _ = tx.send(Ok(content)).await;
                        }
                        SseEvent::Error(message) => {
                            let _ = tx.send(Err(LlmError::Stream(message))).await;
                        }
                        _ => {}
                    }
                }
            })
        )
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> String {
        self.base_url.clone()
    }
}
