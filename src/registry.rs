//! Session registry: the process-wide table of bound users and their
//! in-flight commands.
//!
//! Two pieces of state live here, both behind a single lock:
//!
//! - the mapping from user identity to the one live connection bound to it;
//! - per user, the table of outstanding commands keyed by command id.
//!
//! The push handler inserts a command record before writing the request
//! frame and removes it unconditionally when it returns, so a command id
//! can be reused as soon as the HTTP request finishes. The read loop
//! delivers replies through [`SessionRegistry::complete_command`], a
//! borrow-under-lock operation; it never holds a reference to a record
//! across frames.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::server::conn::Connection;

/// Errors surfaced by registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("user id can't be empty")]
    EmptyUserId,
    #[error("command id can't be empty")]
    EmptyCommandId,
    #[error("user already registered")]
    AlreadyRegistered,
    #[error("registration is owned by another connection")]
    NotYours,
    #[error("registration not found")]
    NotFound,
    #[error("no such user")]
    NoSuchUser,
    #[error("command already exists")]
    CommandExists,
    #[error("no such command")]
    NoSuchCommand,
}

/// The client's reply to one command, as delivered to the waiting push task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub msg: String,
}

/// Outcome of delivering a reply to a pending command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The waiting push task was signalled.
    Delivered,
    /// The command had already been completed; the duplicate reply was dropped.
    Duplicate,
}

/// Handle owned by the push task for one in-flight command: the connection
/// the request frame must be written to, and the receiver the reply arrives
/// on. The completion signal is the oneshot channel itself; the reply
/// payload travels on it, so the waker observes the payload.
#[derive(Debug)]
pub struct PendingCommand {
    pub conn: Arc<Connection>,
    pub receiver: oneshot::Receiver<CommandReply>,
}

/// One in-flight request/response pair. The responder is taken exactly once;
/// a record whose responder is `None` has already been completed.
struct CommandRecord {
    conn: Arc<Connection>,
    request: String,
    started_at: Instant,
    timeout: Duration,
    responder: Option<oneshot::Sender<CommandReply>>,
}

/// One bound user: the authoritative connection plus the command table.
struct UserSession {
    conn: Arc<Connection>,
    commands: HashMap<String, CommandRecord>,
}

/// Process-wide session registry. All mutations serialize on one mutex;
/// reads take it too, because the inner command tables are mutated in place.
#[derive(Default)]
pub struct SessionRegistry {
    users: Mutex<HashMap<String, UserSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Establish the exclusive mapping from `user_id` to `conn`.
    ///
    /// The user-id stamp on the connection is written while the registry
    /// lock is held, so an observer that sees the user entry also sees the
    /// back-pointer.
    pub fn bind(&self, user_id: &str, conn: Arc<Connection>) -> Result<(), RegistryError> {
        if user_id.is_empty() {
            return Err(RegistryError::EmptyUserId);
        }
        let mut users = self.users.lock();
        if users.contains_key(user_id) {
            return Err(RegistryError::AlreadyRegistered);
        }
        conn.bind_user(user_id);
        users.insert(
            user_id.to_string(),
            UserSession {
                conn,
                commands: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Remove the registration owned by `conn`.
    ///
    /// A connection that never registered is not an error: the close path
    /// calls this unconditionally. The entry is deleted only when its
    /// stored connection is `conn` itself (pointer identity); a slot held
    /// by a different connection is left alone. Outstanding command records
    /// are dropped with the entry; waiting push tasks observe the loss
    /// through their own deadline, not through an early wake-up.
    pub fn unbind(&self, conn: &Arc<Connection>) -> Result<(), RegistryError> {
        let Some(user_id) = conn.user_id() else {
            return Ok(());
        };
        let mut users = self.users.lock();
        match users.get(&user_id) {
            Some(entry) if !Arc::ptr_eq(&entry.conn, conn) => {
                return Err(RegistryError::NotYours)
            }
            None => return Err(RegistryError::NotFound),
            Some(_) => {}
        }
        if let Some(entry) = users.remove(&user_id) {
            if !entry.commands.is_empty() {
                debug!(
                    target: "registry",
                    user_id = %user_id,
                    dropped = entry.commands.len(),
                    "unbind dropped outstanding commands"
                );
            }
        }
        Ok(())
    }

    /// Whether `user_id` is currently bound on this instance.
    pub fn has_user(&self, user_id: &str) -> Result<bool, RegistryError> {
        if user_id.is_empty() {
            return Err(RegistryError::EmptyUserId);
        }
        Ok(self.users.lock().contains_key(user_id))
    }

    /// Insert a fresh command record under `(user_id, command_id)` and hand
    /// back the rendezvous handle.
    ///
    /// The record is visible to the read loop from the moment this returns,
    /// which is before the caller writes the request frame: a fast client
    /// reply can never arrive ahead of the record.
    pub fn new_command(
        &self,
        user_id: &str,
        command_id: &str,
        request: &str,
        timeout: Duration,
    ) -> Result<PendingCommand, RegistryError> {
        if user_id.is_empty() {
            return Err(RegistryError::EmptyUserId);
        }
        if command_id.is_empty() {
            return Err(RegistryError::EmptyCommandId);
        }
        let mut users = self.users.lock();
        let entry = users.get_mut(user_id).ok_or(RegistryError::NoSuchUser)?;
        if entry.commands.contains_key(command_id) {
            return Err(RegistryError::CommandExists);
        }
        let (responder, receiver) = oneshot::channel();
        let conn = entry.conn.clone();
        entry.commands.insert(
            command_id.to_string(),
            CommandRecord {
                conn: conn.clone(),
                request: request.to_string(),
                started_at: Instant::now(),
                timeout,
                responder: Some(responder),
            },
        );
        Ok(PendingCommand { conn, receiver })
    }

    /// Deliver a client reply to the pending command under
    /// `(user_id, command_id)`.
    ///
    /// The responder is taken under the lock, so the signal is raised at
    /// most once; a second reply for the same command is reported as
    /// [`Completion::Duplicate`] and otherwise ignored. The record itself
    /// stays in the table - removal is the push handler's job.
    pub fn complete_command(
        &self,
        user_id: &str,
        command_id: &str,
        reply: CommandReply,
    ) -> Result<Completion, RegistryError> {
        if user_id.is_empty() {
            return Err(RegistryError::EmptyUserId);
        }
        if command_id.is_empty() {
            return Err(RegistryError::EmptyCommandId);
        }
        let mut users = self.users.lock();
        let entry = users.get_mut(user_id).ok_or(RegistryError::NoSuchUser)?;
        let record = entry
            .commands
            .get_mut(command_id)
            .ok_or(RegistryError::NoSuchCommand)?;
        let Some(responder) = record.responder.take() else {
            return Ok(Completion::Duplicate);
        };
        debug!(
            target: "registry",
            user_id = %user_id,
            command_id = %command_id,
            conn_id = record.conn.id(),
            elapsed_ms = record.started_at.elapsed().as_millis() as u64,
            timeout_ms = record.timeout.as_millis() as u64,
            request_bytes = record.request.len(),
            "command completed"
        );
        // The push task may have given up already (its receiver is dropped
        // on timeout); a failed send is not an error here.
        let _ = responder.send(reply);
        Ok(Completion::Delivered)
    }

    /// Delete the record under `(user_id, command_id)`.
    ///
    /// Called by the push handler on every exit path so the same command id
    /// can be reused immediately afterwards.
    pub fn remove_command(&self, user_id: &str, command_id: &str) -> Result<(), RegistryError> {
        if user_id.is_empty() {
            return Err(RegistryError::EmptyUserId);
        }
        if command_id.is_empty() {
            return Err(RegistryError::EmptyCommandId);
        }
        let mut users = self.users.lock();
        let entry = users.get_mut(user_id).ok_or(RegistryError::NoSuchUser)?;
        entry
            .commands
            .remove(command_id)
            .map(|_| ())
            .ok_or(RegistryError::NoSuchCommand)
    }

    /// Number of currently bound users.
    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }

    /// Total outstanding command records across all users. Bounded by the
    /// number of push requests currently in flight.
    pub fn pending_command_count(&self) -> usize {
        self.users.lock().values().map(|e| e.commands.len()).sum()
    }
}
