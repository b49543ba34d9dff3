//! Configuration loading.
//!
//! A JSON5 config file with environment-variable overrides. The raw file is
//! parsed into a `serde_json::Value` and the typed [`GatewayConfig`] is
//! extracted from it, so a partial file (or none at all) falls back to
//! production defaults field by field.
//!
//! File resolution order:
//! 1. `PUSHGATE_CONFIG_PATH`
//! 2. `$PUSHGATE_STATE_DIR/pushgate.json5`
//! 3. `~/.pushgate/pushgate.json5`
//!
//! A missing file is not an error; it loads as `{}`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::server::limits::{DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PER_IP};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 12789;

/// Default rendezvous timeout for a push without a per-request override.
pub const DEFAULT_PUSH_TIMEOUT_MS: u64 = 1_000;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },
}

/// Resolve the config file path.
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("PUSHGATE_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    if let Ok(state_dir) = env::var("PUSHGATE_STATE_DIR") {
        return PathBuf::from(state_dir).join("pushgate.json5");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pushgate")
        .join("pushgate.json5")
}

/// Load and parse the configuration file. Returns `{}` if the file does
/// not exist.
pub fn load_config() -> Result<Value, ConfigError> {
    load_config_from(&get_config_path())
}

/// Load and parse a specific configuration file.
pub fn load_config_from(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    json5::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Typed gateway configuration, extracted from the raw config value.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address (default loopback).
    pub bind_address: String,
    /// Listen port.
    pub port: u16,
    /// Bearer token required on push requests; `None` disables push auth.
    pub auth_token: Option<String>,
    /// Server-default rendezvous timeout.
    pub push_timeout: Duration,
    /// When set, a push whose target socket closes mid-wait answers
    /// immediately instead of running out the clock.
    pub cancel_on_disconnect: bool,
    /// Maximum total concurrent WebSocket connections.
    pub max_ws_connections: usize,
    /// Maximum concurrent WebSocket connections from a single IP.
    pub max_ws_per_ip: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            auth_token: None,
            push_timeout: Duration::from_millis(DEFAULT_PUSH_TIMEOUT_MS),
            cancel_on_disconnect: false,
            max_ws_connections: DEFAULT_MAX_CONNECTIONS,
            max_ws_per_ip: DEFAULT_MAX_PER_IP,
        }
    }
}

impl GatewayConfig {
    /// Extract the typed config from a raw config value.
    ///
    /// `PUSHGATE_AUTH_TOKEN` overrides the file-configured token.
    pub fn from_value(cfg: &Value) -> Self {
        let defaults = Self::default();
        let gateway = cfg.get("gateway").and_then(|v| v.as_object());
        let push = cfg.get("push").and_then(|v| v.as_object());

        let bind_address = gateway
            .and_then(|g| g.get("bind"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or(defaults.bind_address);
        let port = gateway
            .and_then(|g| g.get("port"))
            .and_then(|v| v.as_u64())
            .map(|p| p as u16)
            .unwrap_or(defaults.port);

        let file_token = gateway
            .and_then(|g| g.get("auth"))
            .and_then(|a| a.get("token"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let auth_token = env::var("PUSHGATE_AUTH_TOKEN").ok().or(file_token);

        let push_timeout = push
            .and_then(|p| p.get("timeoutMs"))
            .and_then(|v| v.as_u64())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.push_timeout);
        let cancel_on_disconnect = push
            .and_then(|p| p.get("cancelOnDisconnect"))
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.cancel_on_disconnect);

        let max_ws_connections = gateway
            .and_then(|g| g.get("maxWsConnections"))
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(defaults.max_ws_connections);
        let max_ws_per_ip = gateway
            .and_then(|g| g.get("maxWsPerIp"))
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(defaults.max_ws_per_ip);

        Self {
            bind_address,
            port,
            auth_token,
            push_timeout,
            cancel_on_disconnect,
            max_ws_connections,
            max_ws_per_ip,
        }
    }
}
