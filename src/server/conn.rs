//! Connection object: one upgraded WebSocket as seen by the rest of the
//! process.
//!
//! The socket itself is owned by the reader/writer tasks in `server::ws`;
//! what lives here is the handle other tasks interact with - a queue into
//! the writer task, a one-shot stop signal, a lazily-assigned identifier,
//! and the bound user identity stamped by the registry.

use std::sync::OnceLock;

use axum::extract::ws::Message;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Error returned when writing to a connection that is no longer open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("connection is closed")]
    ConnectionClosed,
}

#[derive(Debug)]
pub struct Connection {
    tx: mpsc::UnboundedSender<Message>,
    stop: CancellationToken,
    id: OnceLock<String>,
    /// Set at most once, under the registry lock, when the connection is
    /// bound to a user.
    user_id: Mutex<Option<String>>,
}

impl Connection {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            tx,
            stop: CancellationToken::new(),
            id: OnceLock::new(),
            user_id: Mutex::new(None),
        }
    }

    /// Opaque identifier, generated on first observation and stable for the
    /// life of the connection.
    pub fn id(&self) -> &str {
        self.id.get_or_init(|| Uuid::new_v4().to_string())
    }

    /// The user identity this connection is bound to, if registered.
    pub fn user_id(&self) -> Option<String> {
        self.user_id.lock().clone()
    }

    /// Stamp the bound user identity. Only the registry calls this, while
    /// holding its lock; the first stamp wins for the life of the
    /// connection.
    pub(crate) fn bind_user(&self, user_id: &str) {
        let mut bound = self.user_id.lock();
        if bound.is_none() {
            *bound = Some(user_id.to_string());
        }
    }

    /// Queue a text frame for the writer task. Fails once the stop signal
    /// has been raised or the writer has gone away.
    pub fn write_text(&self, text: String) -> Result<(), WriteError> {
        if self.stop.is_cancelled() {
            return Err(WriteError::ConnectionClosed);
        }
        self.tx
            .send(Message::Text(text.into()))
            .map_err(|_| WriteError::ConnectionClosed)
    }

    /// Raise the stop signal. Idempotent; concurrent closes are safe.
    pub fn close(&self) {
        self.stop.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token observed by the reader and writer tasks; resolves when the
    /// stop signal is raised.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}
