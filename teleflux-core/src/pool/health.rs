//! Live health counters and the policies derived from them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::protocol::BotIndex;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Weight of one failure relative to one active stream when scoring bots.
pub const FAILURE_WEIGHT: u64 = 3;

/// Share of the previous average kept when folding in a new measurement.
const THROUGHPUT_HISTORY_WEIGHT: f64 = 0.7;

/// Advisory health classification. Never used to exclude a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failing,
}

impl HealthStatus {
    pub fn from_failures(failures: u64) -> Self {
        if failures > 15 {
            HealthStatus::Failing
        } else if failures > 5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Chunk size tier for a bot's smoothed throughput in MB/s.
///
/// Unknown (zero) throughput falls into the smallest tier.
pub fn chunk_size_for_throughput(avg_mbps: f64) -> usize {
    if avg_mbps >= 60.0 {
        4 * MIB
    } else if avg_mbps >= 20.0 {
        2 * MIB
    } else if avg_mbps >= 5.0 {
        MIB
    } else {
        512 * KIB
    }
}

/// Counters shared by every stream running on one bot.
///
/// Streams on a multi-threaded runtime update these concurrently, so every
/// field is an atomic or behind a lock.
#[derive(Debug, Default)]
pub struct BotHealth {
    workload: AtomicUsize,
    failures: AtomicU64,
    bypassed: AtomicU64,
    avg_mbps: Mutex<f64>,
}

impl BotHealth {
    /// Number of streams currently running on the bot.
    pub fn workload(&self) -> usize {
        self.workload.load(Ordering::Acquire)
    }

    /// Cumulative failure count. Never reset.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    /// Chunks a fallback bot served on this bot's behalf.
    pub fn bypassed(&self) -> u64 {
        self.bypassed.load(Ordering::Acquire)
    }

    /// Smoothed throughput in MB/s, zero when never measured.
    pub fn avg_mbps(&self) -> f64 {
        *self.avg_mbps.lock()
    }

    pub fn record_failure(&self) -> u64 {
        self.failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn record_bypass(&self) {
        self.bypassed.fetch_add(1, Ordering::AcqRel);
    }

    /// Folds a stream's average throughput into the smoothed estimate.
    ///
    /// The first measurement is taken as is; later ones keep 70% history.
    pub fn fold_throughput(&self, measured_mbps: f64) -> f64 {
        let mut avg = self.avg_mbps.lock();
        *avg = if *avg == 0.0 {
            measured_mbps
        } else {
            THROUGHPUT_HISTORY_WEIGHT * *avg + (1.0 - THROUGHPUT_HISTORY_WEIGHT) * measured_mbps
        };
        *avg
    }

    /// Selection score, lower is better.
    pub fn score(&self) -> u64 {
        self.workload() as u64 + FAILURE_WEIGHT * self.failures()
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_failures(self.failures())
    }

    /// Marks one more active stream until the guard is dropped.
    pub fn begin_stream(self: &Arc<Self>) -> WorkloadGuard {
        self.workload.fetch_add(1, Ordering::AcqRel);
        WorkloadGuard {
            health: Arc::clone(self),
        }
    }
}

/// Decrements the owning bot's workload on drop.
#[derive(Debug)]
pub struct WorkloadGuard {
    health: Arc<BotHealth>,
}

impl Drop for WorkloadGuard {
    fn drop(&mut self) {
        self.health.workload.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Reporting view of one bot, for admin dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotSnapshot {
    pub bot: BotIndex,
    pub display_name: String,
    pub current_load: usize,
    pub failures: u64,
    pub bypassed: u64,
    pub avg_mbps: f64,
    pub status: HealthStatus,
}

impl BotSnapshot {
    pub fn capture(bot: BotIndex, health: &BotHealth) -> Self {
        Self {
            bot,
            display_name: bot.display_name(),
            current_load: health.workload(),
            failures: health.failures(),
            bypassed: health.bypassed(),
            avg_mbps: (health.avg_mbps() * 100.0).round() / 100.0,
            status: health.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_tiers() {
        assert_eq!(chunk_size_for_throughput(0.0), 512 * 1024);
        assert_eq!(chunk_size_for_throughput(4.99), 512 * 1024);
        assert_eq!(chunk_size_for_throughput(5.0), 1024 * 1024);
        assert_eq!(chunk_size_for_throughput(19.9), 1024 * 1024);
        assert_eq!(chunk_size_for_throughput(25.0), 2 * 1024 * 1024);
        assert_eq!(chunk_size_for_throughput(60.0), 4 * 1024 * 1024);
    }

    #[test]
    fn test_status_thresholds() {
        assert_eq!(HealthStatus::from_failures(5), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_failures(6), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_failures(15), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_failures(16), HealthStatus::Failing);
    }

    #[test]
    fn test_throughput_first_sample_then_smoothing() {
        let health = BotHealth::default();

        assert_eq!(health.fold_throughput(10.0), 10.0);
        let smoothed = health.fold_throughput(20.0);
        assert!((smoothed - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_workload_guard_releases_on_drop() {
        let health = Arc::new(BotHealth::default());

        let first = health.begin_stream();
        let second = health.begin_stream();
        assert_eq!(health.workload(), 2);

        drop(first);
        assert_eq!(health.workload(), 1);
        drop(second);
        assert_eq!(health.workload(), 0);
    }

    #[test]
    fn test_score_weights_failures() {
        let health = Arc::new(BotHealth::default());
        let _guard = health.begin_stream();
        health.record_failure();
        health.record_failure();

        assert_eq!(health.score(), 1 + 2 * FAILURE_WEIGHT);
    }
}
