//! HTTP surface: push, lookup, and health endpoints plus the router.
//!
//! `/push` is the rendezvous entry point: it creates a command record,
//! writes the request frame to the bound socket, suspends until the read
//! loop delivers the client's reply, and always removes the record before
//! answering.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::registry::PendingCommand;
use crate::server::conn::WriteError;
use crate::server::ws::{self, CommandFrame};
use crate::server::GatewayState;

/// Body returned for undecodable or invalid request data.
pub const ILLEGAL_REQUEST: &str = "request data illegal";

/// Body returned when the rendezvous deadline expires.
pub const TIMEOUT_RESPONSE: &str = "timeout waiting command response";

/// Optional per-request override of the server's push timeout.
pub const TIMEOUT_HEADER: &str = "x-push-timeout-ms";

/// Assemble the full router. Wrong-method requests on these paths get 405
/// from axum's method routing.
pub fn create_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/push", post(push_handler))
        .route("/lookup", get(lookup_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// POST /push body: `{userId, commId, message}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    comm_id: String,
    #[serde(default)]
    message: String,
}

/// POST /push - deliver one command to the target user's socket and block
/// until the client answers or the deadline fires.
async fn push_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(auth) = state.push_auth() {
        if !auth(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let req: PushRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(_) => return (StatusCode::BAD_REQUEST, ILLEGAL_REQUEST).into_response(),
    };
    if req.user_id.is_empty() || req.comm_id.is_empty() {
        return (StatusCode::BAD_REQUEST, ILLEGAL_REQUEST).into_response();
    }

    let wait = push_timeout(&headers, state.config());

    // Record first, frame second: the record must be visible to the read
    // loop before the request can reach the client.
    let pending = match state
        .registry()
        .new_command(&req.user_id, &req.comm_id, &req.message, wait)
    {
        Ok(pending) => pending,
        Err(err) => {
            warn!(
                target: "http",
                user_id = %req.user_id,
                comm_id = %req.comm_id,
                "push rejected: {}", err
            );
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };

    let response = run_rendezvous(&state, &req, pending, wait).await;

    // The record is removed on every exit path - success, timeout, or write
    // failure - so the same command id can be retried immediately.
    if let Err(err) = state.registry().remove_command(&req.user_id, &req.comm_id) {
        // The whole user entry may already be gone if the target unbound
        // while we were waiting.
        debug!(
            target: "http",
            user_id = %req.user_id,
            comm_id = %req.comm_id,
            "record already gone: {}", err
        );
    }

    response
}

/// Write the request frame and wait on the completion signal.
async fn run_rendezvous(
    state: &GatewayState,
    req: &PushRequest,
    pending: PendingCommand,
    wait: Duration,
) -> Response {
    let frame = CommandFrame {
        id: req.comm_id.clone(),
        msg: req.message.clone(),
    };
    let text = match serde_json::to_string(&frame) {
        Ok(text) => text,
        Err(err) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };

    let deadline = tokio::time::Instant::now() + wait;
    if let Err(err) = pending.conn.write_text(text) {
        warn!(
            target: "http",
            user_id = %req.user_id,
            comm_id = %req.comm_id,
            "write failed: {}", err
        );
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }

    match tokio::time::timeout_at(deadline, pending.receiver).await {
        Ok(Ok(reply)) => (StatusCode::OK, reply.msg).into_response(),
        Ok(Err(_)) => {
            // The record was dropped without a reply: the target unbound
            // mid-wait. The contract surfaces that as a timeout unless
            // early cancellation was opted into.
            if state.config().cancel_on_disconnect {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    WriteError::ConnectionClosed.to_string(),
                )
                    .into_response()
            } else {
                tokio::time::sleep_until(deadline).await;
                (StatusCode::INTERNAL_SERVER_ERROR, TIMEOUT_RESPONSE).into_response()
            }
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, TIMEOUT_RESPONSE).into_response(),
    }
}

/// Per-push wait: the `x-push-timeout-ms` header when present and positive,
/// else the server default.
fn push_timeout(headers: &HeaderMap, config: &GatewayConfig) -> Duration {
    headers
        .get(TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(config.push_timeout)
}

#[derive(Debug, Deserialize)]
struct LookupQuery {
    #[serde(default)]
    userid: String,
}

/// GET /lookup?userid=… - 200 when the user is bound on this instance,
/// 404 when not.
async fn lookup_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<LookupQuery>,
) -> Response {
    if query.userid.is_empty() {
        return (StatusCode::BAD_REQUEST, ILLEGAL_REQUEST).into_response();
    }
    match state.registry().has_user(&query.userid) {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

/// GET /health - liveness plus a small gauge snapshot.
async fn health_handler(State(state): State<Arc<GatewayState>>) -> Response {
    let body = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeMs": state.uptime().as_millis() as u64,
        "boundUsers": state.registry().user_count(),
        "pendingCommands": state.registry().pending_command_count(),
        "openConnections": state.connection_tracker().total(),
    });
    (StatusCode::OK, Json(body)).into_response()
}
