pub mod agent;
pub mod automl;
pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod security;
pub mod server;
pub mod session;

use cli::Args;
use log::{ info, debug };
use orchestrator::ChatOrchestrator;
use server::Server;
use session::SessionStore;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Chat Model: {}", args.chat_model_name());
    info!("Chat Base URL: {}", args.chat_base_url.as_deref().unwrap_or("(provider default)"));
    info!("Persona Path: {}", args.persona_path.as_deref().unwrap_or("(built-in)"));
    info!("Windowed Context: {}", args.windowed_context);
    info!("Session Idle Secs: {}", args.session_idle_secs);
    if let Some(port) = args.http_port {
        info!("HTTP API Port: {}", port);
    }
    info!("-------------------------");

    let llm_config = args.llm_config()?;
    let chat_client = llm::chat::new_client(&llm_config)?;
    info!(
        "Chat client configured: Model={}, BaseURL={}",
        chat_client.get_model(),
        chat_client.get_base_url()
    );

    let persona = config::prompt::load_persona(args.persona_path.as_deref())?;
    let sessions = Arc::new(SessionStore::new(chat_client, persona.clone(), args.session_idle_ttl()));
    let orchestrator = Arc::new(ChatOrchestrator::new(persona, args.windowed_context));

    if args.session_idle_ttl().is_some() {
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            loop {
                ticker.tick().await;
                let removed = sessions.purge_expired().await;
                debug!("Session sweep removed {}", removed);
            }
        });
    }

    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, sessions, orchestrator, args);
    server.run().await?;

    Ok(())
}
