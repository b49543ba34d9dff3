//! WebSocket connection limits.
//!
//! A [`ConnectionTracker`] caps the total number of concurrent WebSocket
//! connections and the number from any single IP. Each successful
//! `try_acquire` returns a [`ConnectionGuard`] whose `Drop` impl releases
//! the slot, so counts stay correct on every exit path.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Default maximum total concurrent WebSocket connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Default maximum concurrent WebSocket connections from a single IP.
pub const DEFAULT_MAX_PER_IP: usize = 32;

/// Error returned when a connection limit is exceeded.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
    #[error("total connection limit reached")]
    Total,
    #[error("per-IP connection limit reached")]
    PerIp,
}

struct TrackerInner {
    total: AtomicUsize,
    per_ip: Mutex<HashMap<IpAddr, usize>>,
    max_connections: usize,
    max_per_ip: usize,
}

/// Tracks active WebSocket connections and enforces the caps.
#[derive(Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PER_IP)
    }

    pub fn with_limits(max_connections: usize, max_per_ip: usize) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                total: AtomicUsize::new(0),
                per_ip: Mutex::new(HashMap::new()),
                max_connections,
                max_per_ip,
            }),
        }
    }

    /// Try to acquire a slot for `ip`.
    ///
    /// Loopback addresses are exempt from the per-IP cap (they still count
    /// towards the total), so local tooling can open many sockets.
    pub fn try_acquire(&self, ip: IpAddr) -> Result<ConnectionGuard, LimitExceeded> {
        let inner = &self.inner;

        // Optimistically take a total slot; roll back on overflow.
        let prev = inner.total.fetch_add(1, Ordering::SeqCst);
        if prev >= inner.max_connections {
            inner.total.fetch_sub(1, Ordering::SeqCst);
            return Err(LimitExceeded::Total);
        }

        let is_loopback = ip.is_loopback();
        if !is_loopback {
            let mut per_ip = inner.per_ip.lock();
            let count = per_ip.entry(ip).or_insert(0);
            if *count >= inner.max_per_ip {
                inner.total.fetch_sub(1, Ordering::SeqCst);
                return Err(LimitExceeded::PerIp);
            }
            *count += 1;
        }

        Ok(ConnectionGuard {
            tracker: Arc::clone(inner),
            ip,
            is_loopback,
        })
    }

    /// Current total active connections.
    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::SeqCst)
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("total", &self.total())
            .field("max_connections", &self.inner.max_connections)
            .field("max_per_ip", &self.inner.max_per_ip)
            .finish()
    }
}

/// RAII guard releasing the connection slot when dropped.
pub struct ConnectionGuard {
    tracker: Arc<TrackerInner>,
    ip: IpAddr,
    is_loopback: bool,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.total.fetch_sub(1, Ordering::SeqCst);
        if !self.is_loopback {
            let mut per_ip = self.tracker.per_ip.lock();
            if let Some(count) = per_ip.get_mut(&self.ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    per_ip.remove(&self.ip);
                }
            }
        }
    }
}
