pub mod api;
pub mod websocket;

use crate::cli::Args;
use crate::orchestrator::ChatOrchestrator;
use crate::session::SessionStore;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    addr: String,
    sessions: Arc<SessionStore>,
    orchestrator: Arc<ChatOrchestrator>,
    args: Args,
}

impl Server {
    pub fn new(
        addr: String,
        sessions: Arc<SessionStore>,
        orchestrator: Arc<ChatOrchestrator>,
        args: Args
    ) -> Self {
        Self {
            addr,
            sessions,
            orchestrator,
            args,
        }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(http_port) = self.args.http_port {
            self.start_http_server(http_port).await?;
        }

        self.start_ws_server().await?;

        Ok(())
    }

    async fn start_http_server(&self, http_port: u16) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(http_port, self.sessions.clone(), self.args.clone()).await
    }

    async fn start_ws_server(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        websocket::start_ws_server(
            &self.addr,
            self.sessions.clone(),
            self.orchestrator.clone(),
            self.args.server_api_key.clone()
        ).await
    }
}
