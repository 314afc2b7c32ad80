//! Persistence of finished-stream summaries.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::state::{StreamId, StreamState, StreamStatus};
use crate::protocol::{BotIndex, DcId};

/// Errors reported by a stats sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Stats sink unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Failed to encode stream summary: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Record persisted once per completed stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSummary {
    pub stream_id: StreamId,
    pub bot: BotIndex,
    pub dc: DcId,
    pub status: StreamStatus,
    pub total_bytes: u64,
    pub duration_secs: f64,
    pub avg_mbps: f64,
    pub peak_mbps: f64,
    pub chunk_size: usize,
    pub parallelism: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub meta: BTreeMap<String, String>,
}

impl StreamSummary {
    pub fn from_state(state: &StreamState) -> Self {
        Self {
            stream_id: state.id.clone(),
            bot: state.bot,
            dc: state.dc,
            status: state.status,
            total_bytes: state.total_bytes,
            duration_secs: state.duration_secs.unwrap_or_default(),
            avg_mbps: state.avg_mbps,
            peak_mbps: state.peak_mbps,
            chunk_size: state.params.plan.chunk_size,
            parallelism: state.params.parallelism,
            started_at: state.started_at,
            ended_at: state.ended_at.unwrap_or(state.last_update),
            meta: state.meta.clone(),
        }
    }
}

/// Destination for stream summaries, typically an analytics database.
#[async_trait]
pub trait StatsSink: Send + Sync {
    /// Persists one summary.
    ///
    /// # Errors
    /// - `SinkError::Unavailable` - Backing store rejected or unreachable
    /// - `SinkError::Encode` - Summary could not be serialized
    async fn record(&self, summary: StreamSummary) -> Result<(), SinkError>;
}

/// Sink that writes each summary as a JSON log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatsSink;

#[async_trait]
impl StatsSink for TracingStatsSink {
    async fn record(&self, summary: StreamSummary) -> Result<(), SinkError> {
        let json = serde_json::to_string(&summary)?;
        info!(stream = %summary.stream_id, summary = %json, "Stream summary");
        Ok(())
    }
}
