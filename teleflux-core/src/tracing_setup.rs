//! Tracing setup for Teleflux binaries.
//!
//! Console output follows the level the operator asked for, while a per-run
//! log file under `logs/` always captures everything down to TRACE so chunk
//! retries and session handshakes can be reconstructed after the fact.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name of the full-detail log written on every run.
pub const RUN_LOG_FILE: &str = "teleflux-last-run.log";

/// Errors raised while installing the global subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("Cannot prepare log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Global subscriber already installed: {reason}")]
    AlreadyInstalled { reason: String },
}

/// Installs console + run-log tracing layers.
///
/// `RUST_LOG` overrides `console_level` for the console layer only.
///
/// # Errors
/// - `TracingSetupError::LogFile` - Logs directory or file cannot be created
/// - `TracingSetupError::AlreadyInstalled` - A global subscriber already exists
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, TracingSetupError> {
    let log_file_path = logs_dir
        .unwrap_or_else(|| Path::new("logs"))
        .join(RUN_LOG_FILE);
    let log_file = open_run_log(&log_file_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| TracingSetupError::AlreadyInstalled {
            reason: e.to_string(),
        })?;

    tracing::info!(
        console = %console_level,
        run_log = %log_file_path.display(),
        "Tracing initialized"
    );

    Ok(log_file_path)
}

fn open_run_log(path: &Path) -> Result<File, TracingSetupError> {
    let to_error = |source| TracingSetupError::LogFile {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(to_error)?;
    }
    File::create(path).map_err(to_error)
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl CliLogLevel {
    /// Maps the CLI level to the `tracing` level.
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_tracing_level().as_str().to_lowercase())
    }
}
