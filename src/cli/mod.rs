use clap::Parser;
use std::time::Duration;

use crate::error::ConfigError;
use crate::llm::{ LlmConfig, LlmType };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for chat completion (deepseek, openai)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "deepseek")]
    pub chat_llm_type: String,

    /// Base URL for the completion API (defaults to https://api.deepseek.com/v1)
    #[arg(long, env = "DEEPSEEK_BASE_URL")] // No default, let the provider type decide
    pub chat_base_url: Option<String>,

    /// API key for the completion API. Required.
    #[arg(long, env = "DEEPSEEK_API_KEY", default_value = "", hide_env_values = true)]
    pub chat_api_key: String,

    /// Model name for chat completion (e.g., deepseek-chat)
    #[arg(long, env = "CHAT_MODEL")]
    pub chat_model: Option<String>,

    /// Optional upper bound in seconds for one completion request.
    #[arg(long, env = "CHAT_TIMEOUT_SECS")]
    pub chat_timeout_secs: Option<u64>,

    /// Send the last turns of the conversation with every request instead of
    /// only the system prompt and the new message.
    #[arg(long, env = "WINDOWED_CONTEXT", default_value = "false")]
    pub windowed_context: bool,

    // --- Persona Args ---
    /// Optional JSON file overriding the system prompt, header and capabilities.
    #[arg(long, env = "PERSONA_PATH")]
    pub persona_path: Option<String>,

    // --- Server Args ---
    /// Host address and port for the WebSocket server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Optional shared secret. When set, clients must sign the handshake (`ts`, `sig`).
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    /// Port for the HTTP API. Disabled when unset.
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Seconds a session may stay idle before it is dropped. 0 keeps sessions forever.
    #[arg(long, env = "SESSION_IDLE_SECS", default_value = "3600")]
    pub session_idle_secs: u64,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    pub fn llm_config(&self) -> Result<LlmConfig, ConfigError> {
        let llm_type: LlmType = self.chat_llm_type.parse()?;
        Ok(LlmConfig {
            llm_type,
            api_key: Some(self.chat_api_key.clone()).filter(|k| !k.trim().is_empty()),
            completion_model: self.chat_model.clone(),
            base_url: self.chat_base_url.clone(),
            request_timeout: self.chat_timeout_secs.map(Duration::from_secs),
        })
    }

    pub fn chat_model_name(&self) -> String {
        self.chat_model.clone().unwrap_or_else(|| {
            self.chat_llm_type
                .parse::<LlmType>()
                .map(|t| t.default_model().to_string())
                .unwrap_or_default()
        })
    }

    pub fn session_idle_ttl(&self) -> Option<chrono::Duration> {
        match self.session_idle_secs {
            0 => None,
            secs => chrono::Duration::try_seconds(secs as i64),
        }
    }
}
