//! One pass of a user turn through validation, generation and history update,
//! plus the per-session render step.
//!
//! A turn moves `Idle → Validating → (Rejected | Composing) → Generating →
//! (Completed | Cancelled | Failed) → Idle`. The user message is stored as soon as
//! the text is accepted, and every accepted turn ends with exactly one assistant
//! message, even when it was stopped or the endpoint failed.

use log::info;
use serde::{ Deserialize, Serialize };
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::agent::{ GenerationSlot, VictoriaChatbot };
use crate::config::prompt::{ Capability, PersonaConfig };
use crate::llm::stream::{ format_error, GenerationOutcome };
use crate::models::chat::ChatMessage;
use crate::models::websocket::Header;
use crate::security::{ is_code_request, SecurityValidator };
use crate::session::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnPhase {
    Idle,
    Validating,
    Rejected,
    Composing,
    Generating,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Terminal phase reached by the turn.
    pub phase: TurnPhase,
    /// Assistant reply, or the rejection reason when `phase` is `Rejected`.
    pub reply: String,
    pub code_request: bool,
}

impl TurnOutcome {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            phase: TurnPhase::Rejected,
            reply: reason.into(),
            code_request: false,
        }
    }
}

/// An accepted turn waiting for its reply. Holds the chatbot's generation slot
/// until it is passed to [`ChatOrchestrator::finish_turn`].
pub struct PreparedTurn {
    slot: GenerationSlot,
    pub messages: Vec<ChatMessage>,
    pub code_request: bool,
}

impl PreparedTurn {
    pub fn chatbot(&self) -> &Arc<VictoriaChatbot> {
        self.slot.chatbot()
    }
}

/// The presentation side of a session.
pub trait Renderer {
    fn render_header(&mut self, header: &Header);
    fn render_capabilities(&mut self, capabilities: &[Capability]);
    fn render_history(&mut self, messages: &[ChatMessage]);
}

pub struct ChatOrchestrator {
    validator: SecurityValidator,
    persona: Arc<PersonaConfig>,
    windowed_context: bool,
}

impl ChatOrchestrator {
    pub fn new(persona: Arc<PersonaConfig>, windowed_context: bool) -> Self {
        Self {
            validator: SecurityValidator::new(),
            persona,
            windowed_context,
        }
    }

    /// Header and gallery once per session, history on every call.
    pub fn render(&self, session: &mut SessionState, renderer: &mut dyn Renderer) {
        if !session.ui_initialized {
            renderer.render_header(&self.persona.header);
            renderer.render_capabilities(&self.persona.capabilities);
            session.ui_initialized = true;
        }
        renderer.render_history(&session.messages.messages);
        session.touch();
    }

    /// Validates `text` and, when accepted, records it and builds the prompt.
    pub fn begin_turn(
        &self,
        session: &mut SessionState,
        text: &str
    ) -> Result<PreparedTurn, TurnOutcome> {
        session.touch();
        let slot = session.chatbot
            .try_reserve()
            .map_err(|busy| TurnOutcome::rejected(busy.to_string()))?;

        session.phase = TurnPhase::Validating;
        let verdict = self.validator.validate(text);
        if !verdict.accepted {
            session.phase = TurnPhase::Idle;
            return Err(TurnOutcome::rejected(verdict.reason));
        }

        session.phase = TurnPhase::Composing;
        let messages = if self.windowed_context {
            session.chatbot.format_messages(&session.messages, text)
        } else {
            session.chatbot.live_messages(text)
        };
        session.messages.push(ChatMessage::user(text));
        session.phase = TurnPhase::Generating;

        let code_request = is_code_request(text);
        info!(
            "Session {}: accepted turn ({} context messages, code request: {})",
            session.id,
            messages.len(),
            code_request
        );
        Ok(PreparedTurn {
            slot,
            messages,
            code_request,
        })
    }

    pub async fn generate<F>(&self, turn: &PreparedTurn, on_token: F) -> GenerationOutcome
        where F: FnMut(&str)
    {
        turn.slot.generate(&turn.messages, on_token).await
    }

    /// Appends the assistant reply, returns the session to `Idle` and frees the
    /// chatbot for the next turn.
    pub fn finish_turn(
        &self,
        session: &mut SessionState,
        turn: PreparedTurn,
        outcome: GenerationOutcome
    ) -> TurnOutcome {
        let (phase, reply) = match outcome {
            GenerationOutcome::Completed(text) => (TurnPhase::Completed, text),
            GenerationOutcome::Cancelled(text) => (TurnPhase::Cancelled, text),
            GenerationOutcome::Failed { error, .. } => (TurnPhase::Failed, format_error(&error)),
        };
        session.messages.push(ChatMessage::assistant(reply.clone()));
        session.phase = TurnPhase::Idle;
        session.touch();
        TurnOutcome {
            phase,
            reply,
            code_request: turn.code_request,
        }
    }

    /// Runs a whole turn. The session lock is released while the reply streams.
    pub async fn handle_turn<F>(
        &self,
        session: &Mutex<SessionState>,
        text: &str,
        on_token: F
    ) -> TurnOutcome
        where F: FnMut(&str)
    {
        let prepared = {
            let mut state = session.lock().await;
            self.begin_turn(&mut state, text)
        };
        let turn = match prepared {
            Ok(turn) => turn,
            Err(rejected) => {
                return rejected;
            }
        };

        let outcome = self.generate(&turn, on_token).await;
        let mut state = session.lock().await;
        self.finish_turn(&mut state, turn, outcome)
    }
}
