//! Server module
//!
//! HTTP and WebSocket surfaces plus the shared gateway state.

pub mod conn;
pub mod http;
pub mod limits;
pub mod startup;
pub mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap};

use crate::config::GatewayConfig;
use crate::registry::SessionRegistry;

/// Authorization predicate for push requests. The request proceeds only
/// when the predicate returns true.
pub type PushAuthFn = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

/// Optional token-to-user-id resolver consulted during registration. A
/// `None` result rejects the token; without a resolver the token is the
/// user id.
pub type ResolveUserIdFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Shared state injected into every handler. The registry is the only
/// process-wide mutable state; everything else is read-only after startup.
pub struct GatewayState {
    config: GatewayConfig,
    registry: SessionRegistry,
    connection_tracker: limits::ConnectionTracker,
    start_time: Instant,
    push_auth: Option<PushAuthFn>,
    resolve_user_id: Option<ResolveUserIdFn>,
}

impl GatewayState {
    /// Build state from config. A configured auth token installs the
    /// bearer-token push predicate; tests can override it with
    /// [`GatewayState::with_push_auth`].
    pub fn new(config: GatewayConfig) -> Self {
        let connection_tracker =
            limits::ConnectionTracker::with_limits(config.max_ws_connections, config.max_ws_per_ip);
        let push_auth = config.auth_token.clone().map(bearer_token_auth);
        Self {
            config,
            registry: SessionRegistry::new(),
            connection_tracker,
            start_time: Instant::now(),
            push_auth,
            resolve_user_id: None,
        }
    }

    /// Replace the push authorization predicate.
    pub fn with_push_auth(mut self, auth: Option<PushAuthFn>) -> Self {
        self.push_auth = auth;
        self
    }

    /// Install a token-to-user-id resolver.
    pub fn with_user_id_resolver(mut self, resolve: ResolveUserIdFn) -> Self {
        self.resolve_user_id = Some(resolve);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn connection_tracker(&self) -> &limits::ConnectionTracker {
        &self.connection_tracker
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub(crate) fn push_auth(&self) -> Option<&PushAuthFn> {
        self.push_auth.as_ref()
    }

    pub(crate) fn resolve_user_id(&self) -> Option<&ResolveUserIdFn> {
        self.resolve_user_id.as_ref()
    }
}

/// Predicate requiring `Authorization: Bearer <token>` on push requests.
fn bearer_token_auth(token: String) -> PushAuthFn {
    Arc::new(move |headers: &HeaderMap| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|presented| presented == token)
            .unwrap_or(false)
    })
}
