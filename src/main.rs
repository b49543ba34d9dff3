use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use pushgate::cli::{self, Cli, Command};
use pushgate::config::{self, GatewayConfig};
use pushgate::logging;
use pushgate::server::startup::{run_server_with_config, ServerConfig};
use pushgate::server::GatewayState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the server.
        None | Some(Command::Start) => run_server().await,

        Some(Command::Status { port, host }) => cli::handle_status(&host, port).await,

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;

    let raw = config::load_config().unwrap_or_else(|e| {
        warn!("Failed to load config: {}, using defaults", e);
        serde_json::Value::Object(serde_json::Map::new())
    });
    let gateway_config = GatewayConfig::from_value(&raw);
    let bind_address: SocketAddr =
        format!("{}:{}", gateway_config.bind_address, gateway_config.port).parse()?;

    info!("pushgate v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Push auth: {}",
        if gateway_config.auth_token.is_some() {
            "bearer token"
        } else {
            "disabled"
        }
    );
    info!(
        "Push timeout: {} ms (default)",
        gateway_config.push_timeout.as_millis()
    );

    let state = Arc::new(GatewayState::new(gateway_config));
    let handle = run_server_with_config(ServerConfig {
        state,
        bind_address,
    })
    .await?;
    info!("Listening on {}", handle.local_addr());

    let reason = await_shutdown_trigger().await;
    info!("Shutdown signal received ({})", reason);
    handle.shutdown().await;
    info!("Gateway shut down");
    Ok(())
}

/// Initialize logging based on the PUSHGATE_DEV environment variable.
fn init_logging_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let log_config = if std::env::var("PUSHGATE_DEV")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
    {
        logging::LogConfig::development()
    } else {
        logging::LogConfig::production()
    };
    logging::init_logging(log_config)?;
    Ok(())
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for
/// logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            match tokio::signal::ctrl_c().await {
                Ok(()) => "ctrl-c",
                Err(e) => {
                    panic!("Failed to install Ctrl+C handler: {}", e);
                }
            }
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            panic!("Failed to install Ctrl+C handler: {}", e);
        }
    }
}
