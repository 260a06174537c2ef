use axum::{
    body::Body,
    extract::State,
    http::{ header, StatusCode },
    response::{ IntoResponse, Response },
    routing::post,
    Json,
    Router,
};
use futures::StreamExt;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ Arc, Mutex };
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use victoria_chat::error::LlmError;
use victoria_chat::llm::chat::{ new_client, ChatClient };
use victoria_chat::llm::stream::{ self, GenerationOutcome, ERROR_PREFIX };
use victoria_chat::llm::LlmConfig;
use victoria_chat::models::chat::ChatMessage;

const HOLA_MUNDO: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hola\"},\"finish_reason\":null}]}\n\n",
    ": keep-alive\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\" mundo\"},\"finish_reason\":null}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"!\"},\"finish_reason\":null}]}\n\n",
    "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: [DONE]\n\n"
);

const OVERLOADED: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hola\"},\"finish_reason\":null}]}\n\n",
    "data: {\"error\":{\"message\":\"model overloaded\",\"type\":\"server_error\"}}\n\n"
);

const FIRST_CHUNK: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hola\"}}]}\n\n";

type Seen = Arc<Mutex<Vec<Value>>>;

/// Flips the flag when the response body is dropped by the server.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

async fn completions(State(seen): State<Seen>, Json(body): Json<Value>) -> ([(header::HeaderName, &'static str); 1], &'static str) {
    seen.lock().unwrap().push(body);
    ([(header::CONTENT_TYPE, "text/event-stream")], HOLA_MUNDO)
}

async fn overloaded() -> ([(header::HeaderName, &'static str); 1], &'static str) {
    ([(header::CONTENT_TYPE, "text/event-stream")], OVERLOADED)
}

/// Sends one delta and then goes quiet without closing the body.
async fn stalled(State(dropped): State<Arc<AtomicBool>>) -> Response {
    let guard = DropFlag(dropped);
    let body = futures::stream::unfold((guard, false), |(guard, sent)| async move {
        if sent {
            futures::future::pending::<()>().await;
        }
        Some((Ok::<_, Infallible>(FIRST_CHUNK), (guard, true)))
    });
    ([(header::CONTENT_TYPE, "text/event-stream")], Body::from_stream(body)).into_response()
}

async fn unauthorized() -> (StatusCode, &'static str) {
    (StatusCode::UNAUTHORIZED, "{\"error\":\"invalid api key\"}")
}

async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    format!("http://{}/v1", addr)
}

fn client_for(base_url: String) -> Arc<dyn ChatClient> {
    new_client(
        &(LlmConfig {
            api_key: Some("sk-test".to_string()),
            base_url: Some(base_url),
            ..LlmConfig::default()
        })
    ).unwrap()
}

fn conversation() -> Vec<ChatMessage> {
    vec![ChatMessage::system("Eres VictorIA"), ChatMessage::user("hola")]
}

#[tokio::test]
async fn streams_deltas_from_sse_endpoint() {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().route("/v1/chat/completions", post(completions)).with_state(seen.clone());
    let client = client_for(spawn_server(app).await);

    let chunks: Vec<String> = client
        .stream_chat(&conversation()).await
        .unwrap()
        .map(|chunk| chunk.unwrap())
        .collect().await;
    assert_eq!(chunks, vec!["Hola", " mundo", "!"]);

    let request = seen.lock().unwrap()[0].clone();
    assert_eq!(request["model"], "deepseek-chat");
    assert_eq!(request["stream"], true);
    assert_eq!(request["messages"][0]["role"], "system");
    assert_eq!(request["messages"][1]["content"], "hola");
}

#[tokio::test]
async fn generate_accumulates_and_reports_partials() {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().route("/v1/chat/completions", post(completions)).with_state(seen);
    let client = client_for(spawn_server(app).await);

    let mut partials = Vec::new();
    let outcome = stream::generate(client.as_ref(), &conversation(), &CancellationToken::new(), |text| {
        partials.push(text.to_string());
    }).await;

    assert_eq!(outcome, GenerationOutcome::Completed("Hola mundo!".to_string()));
    assert_eq!(partials, vec!["Hola", "Hola mundo", "Hola mundo!"]);
}

#[tokio::test]
async fn error_status_becomes_failed_outcome() {
    let app = Router::new().route("/v1/chat/completions", post(unauthorized));
    let client = client_for(spawn_server(app).await);

    match client.stream_chat(&conversation()).await {
        Err(LlmError::Status { status, body }) => {
            assert_eq!(status, 401);
            assert!(body.contains("invalid api key"));
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("expected an error status"),
    }

    let outcome = stream::generate(client.as_ref(), &conversation(), &CancellationToken::new(), |_| {}).await;
    assert!(outcome.reply().starts_with(ERROR_PREFIX));
    assert!(outcome.reply().contains("401"));
}

#[tokio::test]
async fn error_event_mid_stream_fails_the_turn() {
    let app = Router::new().route("/v1/chat/completions", post(overloaded));
    let client = client_for(spawn_server(app).await);

    let mut partials = Vec::new();
    let outcome = stream::generate(client.as_ref(), &conversation(), &CancellationToken::new(), |text| {
        partials.push(text.to_string());
    }).await;

    assert_eq!(
        outcome,
        GenerationOutcome::Failed {
            partial: "Hola".to_string(),
            error: "Stream error: model overloaded".to_string(),
        }
    );
    assert_eq!(partials, vec!["Hola"]);
    assert!(outcome.reply().starts_with(ERROR_PREFIX));
    assert!(outcome.reply().ends_with("model overloaded"));
}

#[tokio::test]
async fn cancelling_a_stalled_stream_closes_the_request() {
    let dropped = Arc::new(AtomicBool::new(false));
    let app = Router::new()
        .route("/v1/chat/completions", post(stalled))
        .with_state(dropped.clone());
    let client = client_for(spawn_server(app).await);

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    let outcome = stream::generate(client.as_ref(), &conversation(), &cancel, move |_| {
        stopper.cancel();
    }).await;
    assert_eq!(outcome, GenerationOutcome::Cancelled("Hola".to_string()));

    for _ in 0..100 {
        if dropped.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(dropped.load(Ordering::SeqCst), "server still holds the response body after cancel");
}
