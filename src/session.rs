use chrono::{ DateTime, Duration, Utc };
use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agent::VictoriaChatbot;
use crate::config::prompt::PersonaConfig;
use crate::llm::chat::ChatClient;
use crate::models::chat::Conversation;
use crate::orchestrator::TurnPhase;

/// Everything that survives between two interactions of the same client.
pub struct SessionState {
    pub id: String,
    pub messages: Conversation,
    pub chatbot: Arc<VictoriaChatbot>,
    /// Latched after the header and capability gallery were rendered once.
    pub ui_initialized: bool,
    pub phase: TurnPhase,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl SessionState {
    pub fn new(id: impl Into<String>, chatbot: Arc<VictoriaChatbot>) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            messages: Conversation::new(id.clone()),
            id,
            chatbot,
            ui_initialized: false,
            phase: TurnPhase::Idle,
            created_at: now,
            last_seen: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

pub type SharedSession = Arc<Mutex<SessionState>>;

/// Process-local map of sessions. Nothing is persisted.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SharedSession>>,
    chat_client: Arc<dyn ChatClient>,
    persona: Arc<PersonaConfig>,
    idle_ttl: Option<Duration>,
}

impl SessionStore {
    pub fn new(
        chat_client: Arc<dyn ChatClient>,
        persona: Arc<PersonaConfig>,
        idle_ttl: Option<Duration>
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            chat_client,
            persona,
            idle_ttl,
        }
    }

    /// Returns the session for `id`, creating it (with a fresh id when none is
    /// given) on first access.
    pub async fn get_or_create(&self, id: Option<&str>) -> (String, SharedSession) {
        let id = id
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&id) {
            let existing = Arc::clone(existing);
            drop(sessions);
            existing.lock().await.touch();
            return (id, existing);
        }

        let chatbot = Arc::new(
            VictoriaChatbot::new(Arc::clone(&self.chat_client), Arc::clone(&self.persona))
        );
        let session = Arc::new(Mutex::new(SessionState::new(id.clone(), chatbot)));
        sessions.insert(id.clone(), Arc::clone(&session));
        info!("Created session {} ({} active)", id, sessions.len());
        (id, session)
    }

    pub async fn get(&self, id: &str) -> Option<SharedSession> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Drops sessions idle for longer than the configured TTL. Sessions that are
    /// busy (locked or generating) are kept.
    pub async fn purge_expired(&self) -> usize {
        let Some(ttl) = self.idle_ttl else {
            return 0;
        };
        let cutoff = Utc::now() - ttl;
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, session| {
            match session.try_lock() {
                Ok(state) => state.last_seen >= cutoff || state.chatbot.is_generating(),
                Err(_) => true,
            }
        });
        let removed = before - sessions.len();
        if removed > 0 {
            info!("Expired {} idle session(s)", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::testing::ScriptedClient;

    fn store(ttl: Option<Duration>) -> SessionStore {
        SessionStore::new(
            Arc::new(ScriptedClient::new(&[])),
            Arc::new(PersonaConfig::default()),
            ttl
        )
    }

    #[tokio::test]
    async fn creates_lazily_and_reuses() {
        let store = store(None);
        let (id, first) = store.get_or_create(None).await;
        let (same_id, second) = store.get_or_create(Some(&id)).await;

        assert_eq!(id, same_id);
        assert!(Arc::ptr_eq(&first, &second));
        let chatbot_a = first.lock().await.chatbot.clone();
        let chatbot_b = second.lock().await.chatbot.clone();
        assert!(Arc::ptr_eq(&chatbot_a, &chatbot_b));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let store = store(None);
        let (_, a) = store.get_or_create(Some("a")).await;
        let (_, b) = store.get_or_create(Some("b")).await;
        a.lock().await.messages.push(crate::models::chat::ChatMessage::user("hola"));

        assert_eq!(a.lock().await.messages.len(), 1);
        assert!(b.lock().await.messages.is_empty());
        assert!(!b.lock().await.ui_initialized);
    }

    #[tokio::test]
    async fn purges_only_idle_sessions() {
        let store = store(Some(Duration::minutes(30)));
        let (_, old) = store.get_or_create(Some("old")).await;
        let _ = store.get_or_create(Some("fresh")).await;
        old.lock().await.last_seen = Utc::now() - Duration::hours(2);

        assert_eq!(store.purge_expired().await, 1);
        assert!(store.get("old").await.is_none());
        assert!(store.get("fresh").await.is_some());
    }

    #[tokio::test]
    async fn no_ttl_never_purges() {
        let store = store(None);
        let (_, s) = store.get_or_create(Some("x")).await;
        s.lock().await.last_seen = Utc::now() - Duration::days(7);
        assert_eq!(store.purge_expired().await, 0);
    }
}
