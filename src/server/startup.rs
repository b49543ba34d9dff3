//! Testable server startup logic.
//!
//! [`ServerConfig`] and [`ServerHandle`] let integration tests spin up a
//! real gateway on an ephemeral port, exercise its HTTP and WebSocket
//! endpoints, and shut it down cleanly. The production path in `main.rs`
//! uses the same entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::server::{http, GatewayState};

/// Everything needed to start a gateway server.
pub struct ServerConfig {
    pub state: Arc<GatewayState>,
    pub bind_address: SocketAddr,
}

impl ServerConfig {
    /// Minimal config for integration tests: bind `127.0.0.1:0` so the OS
    /// assigns the port.
    pub fn for_testing(state: Arc<GatewayState>) -> Self {
        ServerConfig {
            state,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }
}

/// Handle to a running server. Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// `ws://ip:port/ws` URL for the upgrade endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// Trigger graceful shutdown and await the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!("Server task returned error: {}", e),
            Ok(Err(e)) => error!("Server task panicked: {}", e),
            Err(_) => warn!("Server task did not finish within 5s timeout"),
        }
    }
}

/// Start a server from a fully-assembled [`ServerConfig`]. Supports port 0
/// for ephemeral port assignment.
pub async fn run_server_with_config(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let app = http::create_router(config.state);

    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;

    let mut shutdown_watch = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown_watch.borrow() {
                    break;
                }
                if shutdown_watch.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        server_task,
    })
}
