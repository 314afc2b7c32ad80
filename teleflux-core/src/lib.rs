//! Teleflux Core - multi-bot chunked streaming engine
//!
//! Serves files stored as chat messages on a remote MTProto-style network
//! as ordered, seekable byte streams. Work is spread across a pool of
//! independently authenticated bots, with per-chunk retry and failover and
//! live health tracking that drives bot selection and chunk sizing.

pub mod config;
pub mod engine;
pub mod locator;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod speedtest;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::TelefluxConfig;
pub use engine::{Engine, RangeRequest};
pub use locator::{FileLocatorCache, LocatorError};
pub use pipeline::{ByteStream, OpenedStream, RangePlan, StreamError, StreamRequest};
pub use pool::{Bot, BotSnapshot, ClientPool, HealthStatus};
pub use protocol::{BotIndex, DcId, FileLocator, MessageRef, ProtocolClient, ProtocolError};
pub use registry::{StatsSink, StreamRegistry, StreamStatus, StreamSummary, TracingStatsSink};
pub use session::{MediaSessionManager, SessionError};
pub use speedtest::{BotBenchmark, SpeedTestError, SpeedTestEvent, SpeedTester};

/// Errors that can bubble up from any Teleflux subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TelefluxError {
    #[error("No bot clients connected")]
    NoBots,

    #[error("Locator error: {0}")]
    Locator(#[from] LocatorError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Speed test error: {0}")]
    SpeedTest(#[from] SpeedTestError),
}

impl TelefluxError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TelefluxError::NoBots | TelefluxError::SpeedTest(SpeedTestError::NoBots) => {
                "No bot clients connected".to_string()
            }
            TelefluxError::Locator(LocatorError::NotFound { message }) => {
                format!("File {message} not found")
            }
            TelefluxError::Locator(LocatorError::Protocol(_)) => {
                "Could not look up the file right now".to_string()
            }
            TelefluxError::Session(_) => "File server unreachable".to_string(),
            TelefluxError::Stream(StreamError::InvalidRange { .. }) => {
                "Requested range not satisfiable".to_string()
            }
            TelefluxError::Stream(_) => "Streaming error occurred".to_string(),
        }
    }

    /// Checks if this error is due to the caller's request.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TelefluxError::Locator(LocatorError::NotFound { .. })
                | TelefluxError::Stream(StreamError::InvalidRange { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, TelefluxError>;
