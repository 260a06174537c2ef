use crate::cli::Args;
use crate::models::chat::ChatMessage;
use crate::session::SessionStore;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    routing::get,
    Router,
    Json,
    extract::{ State, Path },
    response::IntoResponse,
    http::StatusCode,
};
use serde::Serialize;
use tower_http::cors::{ Any, CorsLayer };
use log::{ info, error };

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model: String,
    sessions: usize,
}

#[derive(Serialize)]
struct MessagesResponse {
    session_id: String,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Clone)]
struct AppState {
    sessions: Arc<SessionStore>,
    model: String,
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/sessions/{id}/messages", get(messages_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_http_server(
    http_port: u16,
    sessions: Arc<SessionStore>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let app = router(AppState {
        sessions,
        model: args.chat_model_name(),
    });

    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    error!("HTTP server error: {}", e);
                }
            }
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
            }
        }
    });

    info!("HTTP server started");
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        model: state.model.clone(),
        sessions: state.sessions.len().await,
    })
}

async fn messages_handler(
    State(state): State<AppState>,
    Path(id): Path<String>
) -> impl IntoResponse {
    match state.sessions.get(&id).await {
        Some(session) => {
            let messages = session.lock().await.messages.messages.clone();
            (StatusCode::OK, Json(MessagesResponse { session_id: id, messages })).into_response()
        }
        None =>
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse { message: format!("Unknown session '{}'", id) }),
            ).into_response(),
    }
}
