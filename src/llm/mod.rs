pub mod chat;
pub mod stream;

use serde::{ Deserialize, Serialize };
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
pub const DEFAULT_DEEPSEEK_MODEL: &str = "deepseek-chat";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

/// Providers speaking the OpenAI chat-completions wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmType {
    DeepSeek,
    OpenAI,
}

impl LlmType {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmType::DeepSeek => DEFAULT_DEEPSEEK_BASE_URL,
            LlmType::OpenAI => DEFAULT_OPENAI_BASE_URL,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmType::DeepSeek => DEFAULT_DEEPSEEK_MODEL,
            LlmType::OpenAI => DEFAULT_OPENAI_MODEL,
        }
    }
}

impl FromStr for LlmType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deepseek" => Ok(LlmType::DeepSeek),
            "openai" => Ok(LlmType::OpenAI),
            _ => Err(ConfigError::InvalidLlmType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub llm_type: LlmType,
    pub api_key: Option<String>,
    pub completion_model: Option<String>,
    pub base_url: Option<String>,
    pub request_timeout: Option<Duration>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            llm_type: LlmType::DeepSeek,
            api_key: None,
            completion_model: None,
            base_url: None,
            request_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_llm_type_case_insensitively() {
        assert_eq!("DeepSeek".parse::<LlmType>().unwrap(), LlmType::DeepSeek);
        assert_eq!("openai".parse::<LlmType>().unwrap(), LlmType::OpenAI);
        assert!(matches!("ollama".parse::<LlmType>(), Err(ConfigError::InvalidLlmType(_))));
    }
}
