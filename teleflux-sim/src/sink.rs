//! In-memory stats sink for assertions on persisted summaries.

use async_trait::async_trait;
use parking_lot::Mutex;
use teleflux_core::registry::{SinkError, StatsSink, StreamSummary};

/// Collects every summary it is handed, optionally failing each write.
#[derive(Debug, Default)]
pub struct MemoryStatsSink {
    summaries: Mutex<Vec<StreamSummary>>,
    unavailable: bool,
}

impl MemoryStatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose writes are always rejected.
    pub fn unavailable() -> Self {
        Self {
            summaries: Mutex::new(Vec::new()),
            unavailable: true,
        }
    }

    pub fn summaries(&self) -> Vec<StreamSummary> {
        self.summaries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.summaries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.lock().is_empty()
    }
}

#[async_trait]
impl StatsSink for MemoryStatsSink {
    async fn record(&self, summary: StreamSummary) -> Result<(), SinkError> {
        if self.unavailable {
            return Err(SinkError::Unavailable {
                reason: "memory sink disabled".to_string(),
            });
        }
        self.summaries.lock().push(summary);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use teleflux_core::protocol::{BotIndex, DcId};
    use teleflux_core::registry::{StreamId, StreamStatus};

    use super::*;

    fn summary() -> StreamSummary {
        let now = Utc::now();
        StreamSummary {
            stream_id: StreamId::generate(),
            bot: BotIndex::new(0),
            dc: DcId(4),
            status: StreamStatus::Finished,
            total_bytes: 1024,
            duration_secs: 0.5,
            avg_mbps: 0.0,
            peak_mbps: 0.0,
            chunk_size: 1024,
            parallelism: 2,
            started_at: now,
            ended_at: now,
            meta: BTreeMap::new(),
        }
    }

    #[test]
    fn test_records_summaries() {
        let sink = MemoryStatsSink::new();
        tokio_test::block_on(sink.record(summary())).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.summaries()[0].total_bytes, 1024);
    }

    #[test]
    fn test_unavailable_sink_rejects() {
        let sink = MemoryStatsSink::unavailable();
        let result = tokio_test::block_on(sink.record(summary()));
        assert!(matches!(result, Err(SinkError::Unavailable { .. })));
        assert!(sink.is_empty());
    }
}
