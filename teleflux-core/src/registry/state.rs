//! Live per-stream telemetry.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::pipeline::RangePlan;
use crate::protocol::{BotIndex, DcId};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Upper bound on a single instantaneous throughput reading, in MB/s.
const INSTANT_MBPS_CEILING: f64 = 1000.0;

/// Shortest time span the instantaneous reading divides by.
const MIN_WINDOW_SECS: f64 = 0.01;

/// Random 16-hex-digit stream identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamId(String);

impl StreamId {
    pub fn generate() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a stream. Only `Active` streams accept new samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Active,
    Cancelled,
    Error,
    Finished,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StreamStatus::Active => "active",
            StreamStatus::Cancelled => "cancelled",
            StreamStatus::Error => "error",
            StreamStatus::Finished => "finished",
        };
        f.write_str(label)
    }
}

/// Parameters a stream was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamParams {
    pub plan: RangePlan,
    pub look_ahead: usize,
    pub parallelism: usize,
}

/// Sliding window of the last few `(bytes, elapsed)` samples.
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    samples: VecDeque<(u64, Duration)>,
    capacity: usize,
}

impl ThroughputWindow {
    pub const DEFAULT_CAPACITY: usize = 3;

    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, bytes: u64, elapsed: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((bytes, elapsed));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Smoothed throughput in MB/s, zero until two samples exist.
    pub fn mbps(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let bytes: u64 = self.samples.iter().map(|(bytes, _)| bytes).sum();
        let secs: f64 = self.samples.iter().map(|(_, elapsed)| elapsed.as_secs_f64()).sum();
        (bytes as f64 / BYTES_PER_MIB / secs.max(MIN_WINDOW_SECS)).min(INSTANT_MBPS_CEILING)
    }
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// Telemetry for one streaming request.
#[derive(Debug, Clone, Serialize)]
pub struct StreamState {
    pub id: StreamId,
    pub bot: BotIndex,
    pub dc: DcId,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub total_bytes: u64,
    pub instant_mbps: f64,
    pub avg_mbps: f64,
    pub peak_mbps: f64,
    pub status: StreamStatus,
    pub params: StreamParams,
    pub meta: BTreeMap<String, String>,
    #[serde(skip)]
    window: ThroughputWindow,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    last_sample: Instant,
}

impl StreamState {
    pub fn new(
        id: StreamId,
        bot: BotIndex,
        dc: DcId,
        params: StreamParams,
        meta: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        let started = Instant::now();
        Self {
            id,
            bot,
            dc,
            started_at: now,
            last_update: now,
            ended_at: None,
            duration_secs: None,
            total_bytes: 0,
            instant_mbps: 0.0,
            avg_mbps: 0.0,
            peak_mbps: 0.0,
            status: StreamStatus::Active,
            params,
            meta,
            window: ThroughputWindow::default(),
            started,
            last_sample: started,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == StreamStatus::Active
    }

    /// Records a delivered chunk of `bytes` and refreshes throughput figures.
    pub fn record_chunk(&mut self, bytes: u64) {
        let now = Instant::now();
        let since_last = now.duration_since(self.last_sample);
        self.window.push(bytes, since_last.max(Duration::from_micros(1)));

        self.total_bytes += bytes;
        self.last_sample = now;
        self.last_update = Utc::now();

        self.instant_mbps = self.window.mbps();
        self.peak_mbps = self.peak_mbps.max(self.instant_mbps);
        self.avg_mbps = mbps(self.total_bytes, now.duration_since(self.started));
    }

    /// Closes the stream. An active stream becomes finished; a cancelled or
    /// errored one keeps its status.
    pub fn finalize(&mut self) {
        let elapsed = self.started.elapsed();
        self.ended_at = Some(Utc::now());
        self.duration_secs = Some(elapsed.as_secs_f64());
        self.avg_mbps = mbps(self.total_bytes, elapsed);
        if self.status == StreamStatus::Active {
            self.status = StreamStatus::Finished;
        }
    }
}

fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    bytes as f64 / BYTES_PER_MIB / elapsed.as_secs_f64().max(1e-6)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> StreamParams {
        StreamParams {
            plan: RangePlan::new(0, 1023, 512).unwrap(),
            look_ahead: 3,
            parallelism: 2,
        }
    }

    #[test]
    fn test_window_needs_two_samples() {
        let mut window = ThroughputWindow::default();
        window.push(1024 * 1024, Duration::from_secs(1));
        assert_eq!(window.mbps(), 0.0);

        window.push(1024 * 1024, Duration::from_secs(1));
        assert!((window.mbps() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_keeps_last_three_and_caps() {
        let mut window = ThroughputWindow::default();
        for _ in 0..5 {
            window.push(u64::MAX / 8, Duration::from_millis(1));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.mbps(), INSTANT_MBPS_CEILING);
    }

    #[test]
    fn test_stream_ids_are_sixteen_hex_digits() {
        let id = StreamId::generate();
        assert_eq!(id.as_str().len(), 16);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_chunk_tracks_peak_and_total() {
        let mut state = StreamState::new(
            StreamId::generate(),
            BotIndex(0),
            DcId(4),
            params(),
            BTreeMap::new(),
        );

        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(500)).await;
            state.record_chunk(1024 * 1024);
        }

        assert_eq!(state.total_bytes, 3 * 1024 * 1024);
        assert!((state.instant_mbps - 2.0).abs() < 1e-6);
        assert!((state.avg_mbps - 2.0).abs() < 1e-6);
        assert!(state.peak_mbps >= state.instant_mbps);
    }

    #[test]
    fn test_finalize_preserves_terminal_status() {
        let mut state = StreamState::new(
            StreamId::generate(),
            BotIndex(0),
            DcId(4),
            params(),
            BTreeMap::new(),
        );
        state.status = StreamStatus::Cancelled;
        state.finalize();
        assert_eq!(state.status, StreamStatus::Cancelled);

        let mut active = state.clone();
        active.status = StreamStatus::Active;
        active.finalize();
        assert_eq!(active.status, StreamStatus::Finished);
        assert!(active.duration_secs.is_some());
    }
}
