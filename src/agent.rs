use crate::config::prompt::{ self, PersonaConfig };
use crate::error::{ ChatError, ConfigError };
use crate::llm::LlmConfig;
use crate::llm::chat::{ ChatClient, new_client as new_chat_client };
use crate::llm::stream::{ self, GenerationOutcome };
use crate::models::chat::{ ChatMessage, Conversation };

use log::{ info, warn };
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };
use std::sync::{ Arc, Mutex, MutexGuard };
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mutable state of the generation currently owned by a chatbot.
pub struct GenerationState {
    cancellation_token: Mutex<CancellationToken>,
    is_generating: AtomicBool,
    /// Bumped on every reservation so a finished run cannot clear a newer run's flag.
    generation: AtomicU64,
    current_response: Mutex<String>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for GenerationState {
    fn default() -> Self {
        Self {
            cancellation_token: Mutex::new(CancellationToken::new()),
            is_generating: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            current_response: Mutex::new(String::new()),
            task: Mutex::new(None),
        }
    }
}

/// Exclusive claim on a chatbot's generation, taken when a turn is accepted
/// and released on drop.
pub struct GenerationSlot {
    chatbot: Arc<VictoriaChatbot>,
    generation: u64,
    cancel: CancellationToken,
}

impl GenerationSlot {
    pub fn chatbot(&self) -> &Arc<VictoriaChatbot> {
        &self.chatbot
    }

    /// Streams a reply for `messages`, calling `on_token` with the text so far.
    /// Every failure is folded into the returned outcome.
    pub async fn generate<F>(&self, messages: &[ChatMessage], on_token: F) -> GenerationOutcome
        where F: FnMut(&str)
    {
        self.chatbot.run_generation(&self.cancel, messages, on_token).await
    }
}

impl Drop for GenerationSlot {
    fn drop(&mut self) {
        let state = &self.chatbot.state;
        // A newer slot owns the flag once the epoch moved on.
        if state.generation.load(Ordering::SeqCst) == self.generation {
            state.is_generating.store(false, Ordering::SeqCst);
        }
    }
}

/// One chatbot per session. Holds the persona and the in-flight generation.
pub struct VictoriaChatbot {
    chat_client: Arc<dyn ChatClient>,
    persona: Arc<PersonaConfig>,
    state: GenerationState,
}

impl VictoriaChatbot {
    pub fn new(chat_client: Arc<dyn ChatClient>, persona: Arc<PersonaConfig>) -> Self {
        Self {
            chat_client,
            persona,
            state: GenerationState::default(),
        }
    }

    pub fn from_config(
        config: &LlmConfig,
        persona: Arc<PersonaConfig>
    ) -> Result<Self, ConfigError> {
        let chat_client = new_chat_client(config)?;
        info!(
            "Chat client configured: Model={}, BaseURL={}",
            chat_client.get_model(),
            chat_client.get_base_url()
        );
        Ok(Self::new(chat_client, persona))
    }

    pub fn system_prompt(&self) -> &str {
        &self.persona.system_prompt
    }

    pub fn persona(&self) -> &Arc<PersonaConfig> {
        &self.persona
    }

    /// Windowed context: persona, the last turns of `history`, then `user_input`.
    pub fn format_messages(&self, history: &Conversation, user_input: &str) -> Vec<ChatMessage> {
        prompt::compose(self.system_prompt(), history, user_input)
    }

    pub fn live_messages(&self, user_input: &str) -> Vec<ChatMessage> {
        prompt::live_messages(self.system_prompt(), user_input)
    }

    pub fn is_generating(&self) -> bool {
        self.state.is_generating.load(Ordering::SeqCst)
    }

    pub fn current_response(&self) -> String {
        lock(&self.state.current_response).clone()
    }

    /// Claims the chatbot for one generation. A second claim while one is held
    /// is refused with [`ChatError::Busy`].
    pub fn try_reserve(self: &Arc<Self>) -> Result<GenerationSlot, ChatError> {
        if
            self.state.is_generating
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Err(ChatError::Busy);
        }
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        *lock(&self.state.cancellation_token) = cancel.clone();
        lock(&self.state.current_response).clear();

        Ok(GenerationSlot {
            chatbot: Arc::clone(self),
            generation,
            cancel,
        })
    }

    /// Reserves the chatbot and streams a reply for `messages`, calling
    /// `on_token` with the text so far.
    ///
    /// Every failure is folded into the returned outcome; the only refusal is a
    /// second generation while one is already running.
    pub async fn generate_response<F>(
        self: &Arc<Self>,
        messages: &[ChatMessage],
        on_token: F
    ) -> Result<GenerationOutcome, ChatError>
        where F: FnMut(&str)
    {
        let slot = self.try_reserve()?;
        Ok(slot.generate(messages, on_token).await)
    }

    async fn run_generation<F>(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        mut on_token: F
    ) -> GenerationOutcome
        where F: FnMut(&str)
    {
        let outcome = stream::generate(self.chat_client.as_ref(), messages, cancel, |text| {
            {
                let mut current = lock(&self.state.current_response);
                current.clear();
                current.push_str(text);
            }
            on_token(text);
        }).await;

        match &outcome {
            GenerationOutcome::Completed(text) => info!("Generation completed ({} chars)", text.len()),
            GenerationOutcome::Cancelled(text) => info!("Generation stopped after {} chars", text.len()),
            GenerationOutcome::Failed { error, .. } => warn!("Generation failed: {}", error),
        }
        outcome
    }

    /// Keeps the handle of the task driving the current generation so that
    /// [`stop_response`](Self::stop_response) can wait for it.
    pub fn attach_task(&self, handle: JoinHandle<()>) {
        if let Some(previous) = lock(&self.state.task).replace(handle) {
            if !previous.is_finished() {
                warn!("Replacing a generation task that is still running");
            }
        }
    }

    /// True while an attached task has not finished, including the window before
    /// it starts generating.
    pub fn has_pending_task(&self) -> bool {
        lock(&self.state.task)
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Signals the running generation to stop and waits briefly for its task.
    pub async fn stop_response(&self) {
        lock(&self.state.cancellation_token).cancel();
        self.state.is_generating.store(false, Ordering::SeqCst);

        let handle = lock(&self.state.task).take();
        if let Some(handle) = handle {
            match tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => info!("Generation task stopped"),
                Ok(Err(e)) => warn!("Generation task ended abnormally: {}", e),
                Err(_) => warn!("Generation task did not stop within {:?}", STOP_JOIN_TIMEOUT),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::chat::testing::ScriptedClient;
    use pretty_assertions::assert_eq;

    fn chatbot(client: ScriptedClient) -> (Arc<ScriptedClient>, Arc<VictoriaChatbot>) {
        let client = Arc::new(client);
        let bot = VictoriaChatbot::new(client.clone(), Arc::new(PersonaConfig::default()));
        (client, Arc::new(bot))
    }

    #[tokio::test]
    async fn generates_and_resets_flag() {
        let (_, bot) = chatbot(ScriptedClient::new(&["Hola", " mundo", "!"]));
        let mut seen = Vec::new();
        let outcome = bot
            .generate_response(&bot.live_messages("hola"), |acc| {
                assert!(bot.is_generating());
                seen.push(acc.to_string());
            }).await
            .unwrap();

        assert_eq!(outcome.reply(), "Hola mundo!");
        assert_eq!(seen, vec!["Hola", "Hola mundo", "Hola mundo!"]);
        assert_eq!(bot.current_response(), "Hola mundo!");
        assert!(!bot.is_generating());
    }

    #[tokio::test]
    async fn failure_returns_error_text_and_clears_flag() {
        let (_, bot) = chatbot(
            ScriptedClient::with_results(vec![Ok("Ho".to_string()), Err("boom".to_string())])
        );
        let outcome = bot.generate_response(&bot.live_messages("hola"), |_| {}).await.unwrap();

        assert!(outcome.reply().starts_with(stream::ERROR_PREFIX));
        assert!(outcome.reply().contains("boom"));
        assert!(!bot.is_generating());
    }

    #[tokio::test]
    async fn stop_response_ends_a_stalled_generation() {
        let (_, bot) = chatbot(ScriptedClient::stalling(&["Hola"]));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let runner = bot.clone();
        let handle = tokio::spawn(async move {
            let messages = runner.live_messages("hola");
            let outcome = runner.generate_response(&messages, |_| {}).await.unwrap();
            let _ = tx.send(outcome);
        });
        bot.attach_task(handle);

        while bot.current_response().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(bot.is_generating());
        bot.stop_response().await;

        assert!(!bot.is_generating());
        assert_eq!(rx.await.unwrap(), GenerationOutcome::Cancelled("Hola".to_string()));
    }

    #[tokio::test]
    async fn refuses_overlapping_generation() {
        let (_, bot) = chatbot(ScriptedClient::stalling(&["a"]));
        let runner = bot.clone();
        let handle = tokio::spawn(async move {
            let messages = runner.live_messages("uno");
            let _ = runner.generate_response(&messages, |_| {}).await;
        });
        bot.attach_task(handle);
        while !bot.is_generating() {
            tokio::task::yield_now().await;
        }

        let second = bot.generate_response(&bot.live_messages("dos"), |_| {}).await;
        assert_eq!(second, Err(ChatError::Busy));
        assert!(bot.has_pending_task());
        bot.stop_response().await;
        assert!(!bot.has_pending_task());
    }

    #[tokio::test]
    async fn reservation_blocks_until_released() {
        let (client, bot) = chatbot(ScriptedClient::new(&["hola"]));
        let slot = bot.try_reserve().unwrap();
        assert!(bot.is_generating());
        assert!(matches!(bot.try_reserve(), Err(ChatError::Busy)));
        assert_eq!(bot.generate_response(&bot.live_messages("x"), |_| {}).await, Err(ChatError::Busy));

        let outcome = slot.generate(&bot.live_messages("hola"), |_| {}).await;
        assert_eq!(outcome, GenerationOutcome::Completed("hola".to_string()));
        assert!(bot.is_generating());
        drop(slot);

        assert!(!bot.is_generating());
        assert_eq!(client.requests().len(), 1);
        assert!(bot.try_reserve().is_ok());
    }

    #[tokio::test]
    async fn stop_before_streaming_cancels_the_reserved_turn() {
        let (_, bot) = chatbot(ScriptedClient::stalling(&["nunca"]));
        let slot = bot.try_reserve().unwrap();
        bot.stop_response().await;

        let outcome = slot.generate(&bot.live_messages("hola"), |_| {}).await;
        assert_eq!(outcome, GenerationOutcome::Cancelled(String::new()));
    }

    #[test]
    fn missing_api_key_fails_construction() {
        let result = VictoriaChatbot::from_config(
            &LlmConfig::default(),
            Arc::new(PersonaConfig::default())
        );
        assert!(matches!(result, Err(ConfigError::MissingApiKey)));
    }

    #[test]
    fn format_messages_uses_persona_and_window() {
        let (_, bot) = chatbot(ScriptedClient::new(&[]));
        let mut history = Conversation::new("s");
        for i in 0..6 {
            history.push(ChatMessage::user(format!("m{}", i)));
        }
        let messages = bot.format_messages(&history, "nuevo");
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[0].content, bot.system_prompt());
        assert_eq!(messages[1].content, "m2");
    }
}
