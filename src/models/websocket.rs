use serde::{ Serialize, Deserialize };
use crate::config::prompt::Capability;
use crate::models::chat::ChatMessage;
use crate::orchestrator::TurnPhase;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "chat")] Chat {
        content: String,
    },
    #[serde(rename = "cancel")]
    Cancel,
    #[serde(rename = "render")]
    Render,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Header {
    pub title: String,
    pub subtitle: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "welcome")] Welcome {
        session_id: String,
        header: Header,
        capabilities: Vec<Capability>,
    },
    #[serde(rename = "history")] History {
        messages: Vec<ChatMessage>,
    },
    #[serde(rename = "rejected")] Rejected {
        reason: String,
    },
    #[serde(rename = "generating")]
    Generating,
    #[serde(rename = "partial")] Partial {
        content: String,
    },
    #[serde(rename = "done")] Done {
        content: String,
        outcome: TurnPhase,
        code_request: bool,
        timestamp: i64,
    },
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "error")] Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Only plain strings and enums; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"error\"}"))
    }
}
