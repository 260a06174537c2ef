use crate::config::prompt::Capability;
use crate::models::chat::ChatMessage;
use crate::models::websocket::{ ClientMessage, Header, ServerMessage };
use crate::orchestrator::{ ChatOrchestrator, Renderer };
use crate::session::{ SessionStore, SharedSession };
use crate::agent::VictoriaChatbot;

use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };
use tokio_tungstenite::tungstenite::handshake::server::{ Request, Response, ErrorResponse };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;

use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };

use hmac::{ Hmac, Mac };
use sha2::Sha256;
use chrono::Utc;
use url::form_urlencoded;

use log::{ info, warn, error };
use futures::{ SinkExt, StreamExt };

type HmacSha256 = Hmac<Sha256>;
type Outbox = mpsc::UnboundedSender<Message>;

const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;
const SIGNATURE_MAX_SKEW_SECS: i64 = 300;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN)));
}

pub async fn start_ws_server(
    addr: &str,
    sessions: Arc<SessionStore>,
    orchestrator: Arc<ChatOrchestrator>,
    api_key: Option<String>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!("WS server listening on: {}", addr);
    if api_key.as_deref().map_or(true, str::is_empty) {
        warn!("No SERVER_API_KEY set; accepting unsigned connections.");
    }

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let sessions = Arc::clone(&sessions);
        let orchestrator = Arc::clone(&orchestrator);
        let required_api_key = api_key.clone();

        tokio::spawn(async move {
            if
                let Err(e) = process_connection(
                    peer,
                    stream,
                    sessions,
                    orchestrator,
                    required_api_key
                ).await
            {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

pub fn sign_timestamp(secret: &str, ts: &str) -> Result<String, &'static str> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "invalid secret")?;
    mac.update(ts.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks the `ts`/`sig` query pair: `sig` is the hex HMAC-SHA256 of `ts` under
/// the server secret, and `ts` must be within five minutes of `now`.
pub(crate) fn verify_signature(
    secret: &str,
    params: &HashMap<String, String>,
    now: i64
) -> Result<(), &'static str> {
    let ts = params.get("ts").or_else(|| params.get("X-Api-Ts"));
    let sig = params.get("sig").or_else(|| params.get("X-Api-Sign"));
    let (Some(ts), Some(sig)) = (ts, sig) else {
        return Err("missing ts/sig");
    };

    let ts_i: i64 = ts.parse().map_err(|_| "bad timestamp")?;
    if (now - ts_i).abs() > SIGNATURE_MAX_SKEW_SECS {
        return Err("timestamp out of range");
    }

    let provided = hex::decode(sig).map_err(|_| "bad signature")?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "bad signature")?;
    mac.update(ts.as_bytes());
    mac.verify_slice(&provided).map_err(|_| "bad signature")
}

fn query_params(query: Option<&str>) -> HashMap<String, String> {
    form_urlencoded::parse(query.unwrap_or("").as_bytes()).into_owned().collect()
}

fn unauthorized(reason: &str) -> ErrorResponse {
    let mut res = ErrorResponse::new(Some(reason.to_string()));
    *res.status_mut() = StatusCode::UNAUTHORIZED;
    res
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    sessions: Arc<SessionStore>,
    orchestrator: Arc<ChatOrchestrator>,
    required_api_key: Option<String>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let mut requested_session: Option<String> = None;
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let params = query_params(req.uri().query());
        requested_session = params.get("session").cloned();

        match required_api_key.as_deref() {
            Some(secret) if !secret.is_empty() => {
                verify_signature(secret, &params, Utc::now().timestamp()).map_err(|reason| {
                    warn!("Rejected handshake from {}: {}", peer, reason);
                    unauthorized(reason)
                })?;
                Ok(response)
            }
            _ => Ok(response),
        }
    };

    let accepted = accept_hdr_async(stream, auth_callback).await;
    match accepted {
        Ok(ws) => {
            handle_connection(peer, ws, sessions, orchestrator, requested_session).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

fn send(outbox: &Outbox, message: ServerMessage) -> bool {
    outbox.send(Message::Text(message.to_json())).is_ok()
}

/// Collects what the orchestrator renders into protocol messages.
struct WsRenderer {
    session_id: String,
    header: Option<Header>,
    out: Vec<ServerMessage>,
}

impl WsRenderer {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            header: None,
            out: Vec::new(),
        }
    }
}

impl Renderer for WsRenderer {
    fn render_header(&mut self, header: &Header) {
        self.header = Some(header.clone());
    }

    fn render_capabilities(&mut self, capabilities: &[Capability]) {
        let header = self.header.take().unwrap_or_else(|| Header {
            title: String::new(),
            subtitle: String::new(),
        });
        self.out.push(ServerMessage::Welcome {
            session_id: self.session_id.clone(),
            header,
            capabilities: capabilities.to_vec(),
        });
    }

    fn render_history(&mut self, messages: &[ChatMessage]) {
        self.out.push(ServerMessage::History { messages: messages.to_vec() });
    }
}

async fn send_render(
    orchestrator: &ChatOrchestrator,
    session: &SharedSession,
    session_id: &str,
    outbox: &Outbox
) {
    let mut renderer = WsRenderer::new(session_id);
    {
        let mut state = session.lock().await;
        orchestrator.render(&mut state, &mut renderer);
    }
    for message in renderer.out {
        send(outbox, message);
    }
}

fn spawn_turn(
    orchestrator: Arc<ChatOrchestrator>,
    session: SharedSession,
    chatbot: &Arc<VictoriaChatbot>,
    content: String,
    outbox: Outbox
) {
    if chatbot.is_generating() || chatbot.has_pending_task() {
        send(&outbox, ServerMessage::Error {
            message: crate::error::ChatError::Busy.to_string(),
        });
        return;
    }

    let handle = tokio::spawn(async move {
        let prepared = {
            let mut state = session.lock().await;
            orchestrator.begin_turn(&mut state, &content)
        };
        let turn = match prepared {
            Ok(turn) => turn,
            Err(rejected) => {
                send(&outbox, ServerMessage::Rejected { reason: rejected.reply });
                return;
            }
        };

        send(&outbox, ServerMessage::Generating);
        let partials = outbox.clone();
        let generated = orchestrator.generate(&turn, move |text| {
            send(&partials, ServerMessage::Partial { content: text.to_string() });
        }).await;

        let outcome = {
            let mut state = session.lock().await;
            orchestrator.finish_turn(&mut state, turn, generated)
        };
        send(&outbox, ServerMessage::Done {
            content: outcome.reply,
            outcome: outcome.phase,
            code_request: outcome.code_request,
            timestamp: Utc::now().timestamp(),
        });
    });
    chatbot.attach_task(handle);
}

pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    sessions: Arc<SessionStore>,
    orchestrator: Arc<ChatOrchestrator>,
    requested_session: Option<String>
)
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let (mut tx, mut rx) = websocket.split();
    let (session_id, session) = sessions.get_or_create(requested_session.as_deref()).await;
    let chatbot = session.lock().await.chatbot.clone();
    info!("Assigned session {} to {}", session_id, peer);

    let (outbox, mut outgoing) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            if let Err(e) = tx.send(message).await {
                error!("Error sending message to {}: {}", peer, e);
                break;
            }
        }
    });

    send_render(&orchestrator, &session, &session_id, &outbox).await;

    while let Some(msg) = rx.next().await {
        match msg {
            Ok(message) => {
                if message.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds size limit ({} > {})",
                        peer,
                        message.len(),
                        MAX_MESSAGE_SIZE
                    );
                    send(&outbox, ServerMessage::Error {
                        message: "Message too large".to_string(),
                    });
                    break;
                }

                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Chat { content }) => {
                                spawn_turn(
                                    Arc::clone(&orchestrator),
                                    Arc::clone(&session),
                                    &chatbot,
                                    content,
                                    outbox.clone()
                                );
                            }
                            Ok(ClientMessage::Cancel) => {
                                if chatbot.is_generating() || chatbot.has_pending_task() {
                                    info!("Stop requested by {} (session {})", peer, session_id);
                                    chatbot.stop_response().await;
                                    send(&outbox, ServerMessage::Cancelled);
                                } else {
                                    warn!("Stop requested by {} with nothing generating", peer);
                                }
                            }
                            Ok(ClientMessage::Render) => {
                                send_render(&orchestrator, &session, &session_id, &outbox).await;
                            }
                            Err(e) => {
                                error!("Failed to parse message from {}: {}", peer, e);
                                send(&outbox, ServerMessage::Error {
                                    message: format!("Failed to parse message: {}", e),
                                });
                            }
                        }
                    }
                    Message::Close(_) => {
                        info!("Received close frame from {}", peer);
                        break;
                    }
                    Message::Ping(ping_data) => {
                        if outbox.send(Message::Pong(ping_data)).is_err() {
                            error!("Failed to send pong to {}", peer);
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Binary(_) => {
                        warn!("Ignoring binary message from {}", peer);
                    }
                    Message::Frame(_) => {}
                }
            }
            Err(e) => {
                match e {
                    | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    | tokio_tungstenite::tungstenite::Error::Protocol(_)
                    | tokio_tungstenite::tungstenite::Error::Utf8 => {
                        info!("WebSocket connection closed or protocol error for {}: {}", peer, e);
                    }
                    tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                        io_err.kind() == std::io::ErrorKind::ConnectionReset
                    => {
                        info!("WebSocket connection reset by peer {}", peer);
                    }
                    _ => {
                        error!("Error receiving message from {}: {}", peer, e);
                    }
                }
                break;
            }
        }
    }

    if chatbot.is_generating() || chatbot.has_pending_task() {
        chatbot.stop_response().await;
    }
    drop(outbox);
    let _ = writer.await;
    info!("WebSocket connection closed for {} (session {})", peer, session_id);
}
