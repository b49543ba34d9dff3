//! Logging subsystem
//!
//! Structured logging via tracing with JSON (production) and plaintext
//! (development) output formats.
//!
//! # Log Targets
//!
//! Consistent target names used across the codebase: `gateway`, `ws`,
//! `http`, `registry`, `config`.
//!
//! # Environment Variables
//!
//! - `PUSHGATE_LOG` - primary log level/filter (takes precedence)
//! - `RUST_LOG` - fallback log level/filter

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Guard to prevent double initialization.
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON for production (structured logs).
    Json,
    /// Human-readable plaintext for development.
    #[default]
    Plaintext,
}

/// Log output destination.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File(PathBuf),
}

/// Configuration for the logging subsystem.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Default log level when no env filter is set.
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Plaintext to stdout at debug level.
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::DEBUG,
        }
    }

    /// JSON to stdout at info level.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

/// Error type for logging initialization.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build an EnvFilter from `PUSHGATE_LOG`, then `RUST_LOG`, then the
/// default level.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var("PUSHGATE_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    let default_filter = format!(
        "{level},gateway={level},ws={level},http={level},registry={level},config={level}",
        level = default_level.as_str().to_lowercase()
    );
    Ok(EnvFilter::try_new(default_filter)?)
}

fn make_writer(output: &LogOutput) -> Result<BoxMakeWriter, LoggingError> {
    Ok(match output {
        LogOutput::Stdout => BoxMakeWriter::new(io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(io::stderr),
        LogOutput::File(path) => {
            let file = File::create(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
    })
}

/// Initialize the logging subsystem. Call once at startup; subsequent calls
/// return [`LoggingError::AlreadyInitialized`].
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let filter = build_env_filter(config.default_level)?;
    let timer = UtcTime::rfc_3339();
    let writer = make_writer(&config.output)?;

    match config.format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_target(true)
                .with_current_span(true)
                .with_writer(writer)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_writer(writer)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
    }

    Ok(())
}

/// Initialize logging for tests: plaintext debug, errors ignored so it is
/// safe to call from any number of tests.
pub fn init_test_logging() {
    let _ = init_logging(LogConfig::development());
}
