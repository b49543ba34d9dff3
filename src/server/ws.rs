//! WebSocket endpoint: upgrade, inbound envelope decoding, and the
//! per-connection read loop.
//!
//! Wire framing (text frames, JSON): the client wraps everything it sends
//! in an envelope `{ "Kind": <int>, "Body": "<json-string>" }` where `Body`
//! is a further JSON document encoded as a string. Kind 1 registers the
//! connection under a token; Kind 255 carries the reply to a pushed
//! command. Frames the server writes to the client are bare `{id,msg}`
//! objects, not envelope-wrapped - deployed clients depend on that
//! asymmetry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::{CommandReply, Completion};
use crate::server::conn::Connection;
use crate::server::{limits, GatewayState};

/// Envelope kind for registration frames.
pub const KIND_REGISTER: i64 = 1;
/// Envelope kind for command-response frames.
pub const KIND_RESPONSE: i64 = 255;

/// Outer framing for client-to-server messages.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Kind")]
    pub kind: i64,
    #[serde(rename = "Body")]
    pub body: String,
}

/// REGISTER payload. Legacy clients send capitalized field names; both
/// spellings are accepted.
#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    #[serde(alias = "Token")]
    pub token: String,
    #[serde(default, alias = "Event")]
    pub event: String,
}

/// One command on the wire, in both directions: the server writes
/// `{id,msg}` requests and the client answers with `{id,msg}` replies.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandFrame {
    pub id: String,
    pub msg: String,
}

/// GET /ws - upgrade and run the connection until it closes.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let guard = match state.connection_tracker().try_acquire(addr.ip()) {
        Ok(guard) => guard,
        Err(err) => {
            warn!(target: "ws", %addr, "connection rejected: {}", err);
            return Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header("content-type", "application/json")
                .body(Body::from(r#"{"error":"connection limit reached"}"#))
                .unwrap_or_else(|_| StatusCode::SERVICE_UNAVAILABLE.into_response());
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, guard))
        .into_response()
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<GatewayState>,
    _guard: limits::ConnectionGuard,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn = Arc::new(Connection::new(tx));

    // Writer task: owns the sink, drains the queue until the stop signal is
    // raised or the peer goes away.
    let writer_stop = conn.stop_token();
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_stop.cancelled() => break,
            }
        }
    });

    debug!(target: "ws", conn_id = conn.id(), "connection open");
    read_loop(&mut receiver, &state, &conn).await;

    // Close path, run exactly once per connection: unbind, then raise the
    // stop signal, then let the writer drain.
    if let Err(err) = state.registry().unbind(&conn) {
        warn!(target: "ws", conn_id = conn.id(), "unbind failed: {}", err);
    }
    conn.close();
    let _ = send_task.await;
    debug!(target: "ws", conn_id = conn.id(), "connection closed");
}

/// Block on inbound frames until the socket errors, the peer closes, or the
/// stop signal is raised.
async fn read_loop(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    state: &Arc<GatewayState>,
    conn: &Arc<Connection>,
) {
    let stop = conn.stop_token();
    loop {
        let next = tokio::select! {
            next = receiver.next() => next,
            _ = stop.cancelled() => break,
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                debug!(target: "ws", conn_id = conn.id(), "read error: {}", err);
                break;
            }
            None => break,
        };
        let text = match msg {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => {
                debug!(target: "ws", conn_id = conn.id(), "binary frame ignored");
                continue;
            }
        };
        on_message(state, conn, &text);
    }
}

/// Decode one inbound envelope and dispatch on its kind. Frame-level
/// failures are logged and dropped; they never tear down the connection.
fn on_message(state: &GatewayState, conn: &Arc<Connection>, text: &str) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(target: "ws", conn_id = conn.id(), "dropping undecodable frame: {}", err);
            return;
        }
    };
    match envelope.kind {
        KIND_REGISTER => handle_register(state, conn, &envelope.body),
        KIND_RESPONSE => handle_response(state, conn, &envelope.body),
        other => {
            debug!(target: "ws", conn_id = conn.id(), kind = other, "ignoring unknown frame kind");
        }
    }
}

fn handle_register(state: &GatewayState, conn: &Arc<Connection>, body: &str) {
    let register: RegisterBody = match serde_json::from_str(body) {
        Ok(register) => register,
        Err(err) => {
            debug!(target: "ws", conn_id = conn.id(), "dropping bad register body: {}", err);
            return;
        }
    };
    if conn.user_id().is_some() {
        warn!(target: "ws", conn_id = conn.id(), "registration dropped: connection already bound");
        return;
    }
    let user_id = match state.resolve_user_id() {
        Some(resolve) => match resolve(&register.token) {
            Some(user_id) => user_id,
            None => {
                warn!(target: "ws", conn_id = conn.id(), "token rejected by identity resolver");
                return;
            }
        },
        None => register.token.clone(),
    };
    match state.registry().bind(&user_id, conn.clone()) {
        Ok(()) => {
            info!(
                target: "ws",
                conn_id = conn.id(),
                user_id = %user_id,
                event = %register.event,
                "user registered"
            );
        }
        Err(err) => {
            warn!(
                target: "ws",
                conn_id = conn.id(),
                user_id = %user_id,
                "registration dropped: {}", err
            );
        }
    }
}

fn handle_response(state: &GatewayState, conn: &Arc<Connection>, body: &str) {
    let reply: CommandFrame = match serde_json::from_str(body) {
        Ok(reply) => reply,
        Err(err) => {
            debug!(target: "ws", conn_id = conn.id(), "dropping bad response body: {}", err);
            return;
        }
    };
    let Some(user_id) = conn.user_id() else {
        debug!(target: "ws", conn_id = conn.id(), "dropping response from unregistered connection");
        return;
    };
    match state
        .registry()
        .complete_command(&user_id, &reply.id, CommandReply { msg: reply.msg })
    {
        Ok(Completion::Delivered) => {}
        Ok(Completion::Duplicate) => {
            debug!(
                target: "ws",
                conn_id = conn.id(),
                command_id = %reply.id,
                "duplicate response ignored"
            );
        }
        Err(err) => {
            debug!(
                target: "ws",
                conn_id = conn.id(),
                command_id = %reply.id,
                "dropping response: {}", err
            );
        }
    }
}
