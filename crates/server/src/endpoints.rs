//! WebSocket connection handling for agents and clients: handshake, the
//! reader/writer task split per connection, and ping/idle-timeout
//! keepalive. A reader loop decodes inbound frames and calls into the
//! router; a writer loop drains the router's outbound channel and owns
//! the socket send half.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use relay_protocol::{ErrorCode, Frame, Role};

use crate::router::{AgentHandle, ClientHandle, Router, RouterOutbound};
use crate::web::AppState;

/// In-memory per-connection message-rate limiter: a fixed window counter
/// reset once it elapses. Distinct from `Store::rate_check`, which guards
/// pairing attempts keyed by client IP; this one guards the steady stream
/// of frames on an already-established socket.
struct RateWindow {
    max: u32,
    window: Duration,
    count: u32,
    window_start: Instant,
}

impl RateWindow {
    fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            count: 0,
            window_start: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        if self.window_start.elapsed() >= self.window {
            self.window_start = Instant::now();
            self.count = 0;
        }
        if self.count >= self.max {
            return false;
        }
        self.count += 1;
        true
    }
}

#[derive(Debug, Deserialize)]
pub struct AgentWsQuery {
    agent_id: String,
    secret: String,
}

#[derive(Debug, Deserialize)]
pub struct ClientWsQuery {
    /// Accepted as a query-string fallback for browser `WebSocket` clients,
    /// which cannot set an `Authorization` header on the handshake request.
    access_token: Option<String>,
}

pub async fn agent_ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<AgentWsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if state
        .credentials
        .verify_agent_secret(&query.agent_id, &query.secret)
        .await
        .is_err()
    {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.max_message_size(state.config.router.msg_max_bytes + 4096)
        .on_upgrade(move |socket| handle_agent_socket(socket, state, query.agent_id))
}

pub async fn client_ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<ClientWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = bearer_token(&headers).or(query.access_token.as_deref());
    let Some(token) = token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let claims = match state.credentials.verify_access_token(token) {
        Ok(claims) => claims,
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };

    ws.max_message_size(state.config.router.msg_max_bytes + 4096)
        .on_upgrade(move |socket| handle_client_socket(socket, state, claims.agent_id, claims.sub))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Validate the first frame received on a fresh connection is `hello` with
/// the expected role, rejecting anything else before admission.
fn expect_hello(frame: &Frame, role: Role) -> Result<(), &'static str> {
    match frame {
        Frame::Hello { role: r, .. } if *r == role => Ok(()),
        Frame::Hello { .. } => Err("hello role does not match this endpoint"),
        _ => Err("first frame on a connection must be hello"),
    }
}

async fn recv_frame(socket: &mut WebSocket, max_bytes: usize) -> Option<Result<Frame, RelayFrameError>> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => {
                if text.len() > max_bytes {
                    return Some(Err(RelayFrameError::TooLarge));
                }
                return Some(
                    serde_json::from_str::<Frame>(&text)
                        .map_err(|e| RelayFrameError::Invalid(e.to_string())),
                );
            }
            Ok(Message::Binary(bytes)) => {
                if bytes.len() > max_bytes {
                    return Some(Err(RelayFrameError::TooLarge));
                }
                return Some(
                    serde_json::from_slice::<Frame>(&bytes)
                        .map_err(|e| RelayFrameError::Invalid(e.to_string())),
                );
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return None,
            Err(_) => return None,
        }
    }
}

enum RelayFrameError {
    TooLarge,
    Invalid(String),
}

async fn send_error(socket: &mut WebSocket, code: ErrorCode, message: impl Into<String>) {
    let frame = Frame::error(None, code, message);
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(text.into())).await;
    }
}

async fn handle_agent_socket(mut socket: WebSocket, state: AppState, agent_id: String) {
    let Some(Ok(first)) = recv_frame(&mut socket, state.config.router.msg_max_bytes).await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    if let Err(reason) = expect_hello(&first, Role::Agent) {
        send_error(&mut socket, ErrorCode::InvalidMessage, reason).await;
        let _ = socket.close().await;
        return;
    }

    let router = Arc::clone(&state.router);
    let (handle, rx) = router.admit_agent(&agent_id).await;
    let _ = state.store.touch_agent_last_seen(&agent_id).await;

    run_connection(socket, router.clone(), rx, ConnectionRole::Agent(handle.clone()), state.config.router.msg_max_bytes).await;

    router.remove_agent(&agent_id, &handle).await;
    let _ = state.store.touch_agent_last_seen(&agent_id).await;
}

async fn handle_client_socket(mut socket: WebSocket, state: AppState, agent_id: String, device_id: String) {
    let Some(Ok(first)) = recv_frame(&mut socket, state.config.router.msg_max_bytes).await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    if let Err(reason) = expect_hello(&first, Role::Client) {
        send_error(&mut socket, ErrorCode::InvalidMessage, reason).await;
        let _ = socket.close().await;
        return;
    }

    let router = Arc::clone(&state.router);
    let (handle, rx) = router.admit_client(&agent_id, &device_id).await;

    run_connection(
        socket,
        router.clone(),
        rx,
        ConnectionRole::Client(handle.clone()),
        state.config.router.msg_max_bytes,
    )
    .await;

    router.remove_client(&agent_id, &device_id, &handle).await;
}

enum ConnectionRole {
    Agent(Arc<AgentHandle>),
    Client(Arc<ClientHandle>),
}

/// Drive one admitted connection to completion: a reader loop decoding
/// inbound frames and routing them, racing a writer loop draining the
/// handle's outbound channel, until either side closes.
async fn run_connection(
    socket: WebSocket,
    router: Arc<Router>,
    mut outbound: tokio::sync::mpsc::Receiver<RouterOutbound>,
    role: ConnectionRole,
    msg_max_bytes: usize,
) {
    let (mut sink, mut stream) = socket.split();
    let mut rate = RateWindow::new(60, Duration::from_secs(60));

    loop {
        tokio::select! {
            outbound_msg = outbound.recv() => {
                match outbound_msg {
                    Some(RouterOutbound::Frame(frame)) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(RouterOutbound::Close(code)) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: "".into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                let Some(incoming) = incoming else { break };
                let Ok(message) = incoming else { break };
                match message {
                    Message::Text(text) => {
                        if !rate.allow() {
                            send_sink_error(&mut sink, None, ErrorCode::RateLimited, "message rate limit exceeded").await;
                            continue;
                        }
                        if text.len() > msg_max_bytes {
                            send_sink_error(&mut sink, None, ErrorCode::MessageTooLarge, "frame exceeds the maximum message size").await;
                            break;
                        }
                        let frame = match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                send_sink_error(&mut sink, None, ErrorCode::InvalidMessage, e.to_string()).await;
                                break;
                            }
                        };
                        if let Some(reply) = handle_inbound_frame(&router, &role, frame).await {
                            let Ok(text) = serde_json::to_string(&reply) else { continue };
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Ping(_) | Message::Pong(_) => {
                        touch(&router, &role).await;
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) => {}
                }
            }
        }
    }
}

async fn send_sink_error(
    sink: &mut SplitSink<WebSocket, Message>,
    request_id: Option<String>,
    code: ErrorCode,
    message: impl Into<String>,
) {
    let frame = Frame::error(request_id, code, message);
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = sink.send(Message::Text(text.into())).await;
    }
}

async fn touch(router: &Arc<Router>, role: &ConnectionRole) {
    match role {
        ConnectionRole::Agent(handle) => router.note_agent_activity(handle).await,
        ConnectionRole::Client(handle) => router.note_client_activity(handle).await,
    }
}

/// Handle one decoded inbound frame, returning a frame to write straight
/// back to the sender (used only for `ping` → `pong`; routed traffic goes
/// through the Router's outbound channel instead).
async fn handle_inbound_frame(router: &Arc<Router>, role: &ConnectionRole, frame: Frame) -> Option<Frame> {
    touch(router, role).await;
    match (role, frame) {
        (ConnectionRole::Client(handle), Frame::ChatRequest { request_id, agent_id, session_id, text, .. }) => {
            router.route_chat_request(handle, request_id, agent_id, session_id, text).await;
            None
        }
        (ConnectionRole::Agent(handle), Frame::ChatResponse { request_id, agent_id, session_id, reply, .. }) => {
            router.route_chat_response(handle, agent_id, request_id, session_id, reply).await;
            None
        }
        (ConnectionRole::Client(handle), Frame::PresenceRequest {}) => {
            Some(router.presence_snapshot(&handle.agent_id).await)
        }
        (_, Frame::Ping { ts }) => Some(Frame::Pong { ts }),
        (_, Frame::Pong { .. }) => None,
        _ => None,
    }
}
