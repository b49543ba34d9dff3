//! CLI subcommand definitions and handlers.
//!
//! - `start` (default) - start the gateway server
//! - `status` - query a running instance for health info
//! - `version` - print version info

use clap::{Parser, Subcommand};

use crate::config::{self, GatewayConfig};

/// pushgate - WebSocket push gateway.
#[derive(Parser, Debug)]
#[command(
    name = "pushgate",
    version = env!("CARGO_PKG_VERSION"),
    about = "pushgate - address connected WebSocket clients by user identity"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Start,

    /// Query a running instance for health/status information.
    Status {
        /// Port of the running instance (default: from config).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host of the running instance.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Print version information.
    Version,
}

/// GET /health of a running instance and print the response.
pub async fn handle_status(host: &str, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let port = port.unwrap_or_else(|| {
        let raw = config::load_config().unwrap_or(serde_json::Value::Null);
        GatewayConfig::from_value(&raw).port
    });
    let url = format!("http://{}:{}/health", host, port);

    let resp = reqwest::get(&url).await?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        return Err(format!("gateway returned {}", status).into());
    }
    Ok(())
}

pub fn handle_version() {
    println!("pushgate {}", env!("CARGO_PKG_VERSION"));
}
