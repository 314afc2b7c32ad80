//! On-demand benchmark of every bot against one stored file.
//!
//! Each bot resolves its own locator (reference tokens cannot be shared),
//! measures time-to-first-byte with a tiny probe, then downloads a fixed
//! window with several workers pulling offsets from a shared queue. Failed
//! benchmark requests are skipped, never retried: the result is a best-effort
//! measurement, not a delivery guarantee.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::SpeedTestConfig;
use crate::locator::LocatorError;
use crate::pool::{Bot, ClientPool};
use crate::protocol::{BotIndex, DcId, FileLocator, MediaSession, MessageRef, ProtocolError};
use crate::session::SessionError;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Capacity of the event channel handed to streaming callers.
const EVENT_BUFFER: usize = 64;

/// Errors that prevent a benchmark from running at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpeedTestError {
    #[error("No bot clients connected")]
    NoBots,
}

/// Reasons a single bot's benchmark failed.
#[derive(Debug, thiserror::Error)]
enum BenchmarkFailure {
    #[error(transparent)]
    Locator(#[from] LocatorError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Ping probe failed: {0}")]
    Probe(ProtocolError),

    #[error("No data on ping probe")]
    EmptyProbe,
}

/// Benchmark outcome for one bot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotBenchmark {
    pub bot: BotIndex,
    pub display_name: String,
    pub home_dc: Option<DcId>,
    pub ping_ms: Option<f64>,
    pub mbps: Option<f64>,
    pub elapsed_secs: Option<f64>,
    pub bytes_downloaded: u64,
    pub error: Option<String>,
}

impl BotBenchmark {
    fn new(bot: BotIndex, home_dc: Option<DcId>) -> Self {
        Self {
            bot,
            display_name: bot.display_name(),
            home_dc,
            ping_ms: None,
            mbps: None,
            elapsed_secs: None,
            bytes_downloaded: 0,
            error: None,
        }
    }
}

/// Running totals for one bot while its download is in progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkProgress {
    pub bot: BotIndex,
    pub display_name: String,
    pub bytes_downloaded: u64,
    pub elapsed_secs: f64,
    pub mbps: f64,
}

/// Events emitted by [`SpeedTester::benchmark_all_with_events`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SpeedTestEvent {
    Start {
        total: usize,
        target_dc: Option<DcId>,
    },
    Progress {
        data: BenchmarkProgress,
    },
    Result {
        data: BotBenchmark,
        completed: usize,
        total: usize,
    },
    Done {
        total: usize,
    },
}

/// Work shared by the download workers of one bot.
struct DownloadWindow {
    offsets: Mutex<VecDeque<u64>>,
    eof: AtomicBool,
    downloaded: AtomicU64,
    last_progress: Mutex<Instant>,
    started: Instant,
}

/// Runs benchmarks across the whole pool.
pub struct SpeedTester {
    pool: Arc<ClientPool>,
    config: SpeedTestConfig,
    tasks: TaskTracker,
}

impl SpeedTester {
    pub fn new(pool: Arc<ClientPool>, config: SpeedTestConfig, tasks: TaskTracker) -> Self {
        Self {
            pool,
            config,
            tasks,
        }
    }

    /// Benchmarks every bot concurrently against `message`.
    ///
    /// Results are sorted by throughput, fastest first; bots without a
    /// measurement come last.
    ///
    /// # Errors
    /// - `SpeedTestError::NoBots` - The pool is empty
    pub async fn benchmark_all(
        &self,
        message: MessageRef,
    ) -> Result<Vec<BotBenchmark>, SpeedTestError> {
        if self.pool.is_empty() {
            return Err(SpeedTestError::NoBots);
        }

        info!(%message, bots = self.pool.len(), "Starting speed test");
        let runs = self
            .pool
            .bots()
            .iter()
            .map(|bot| self.benchmark_bot(Arc::clone(bot), message, None));
        let mut results = join_all(runs).await;
        sort_by_throughput(&mut results);
        Ok(results)
    }

    /// Streaming variant of [`benchmark_all`](Self::benchmark_all).
    ///
    /// The receiver yields `Start`, then `Progress` and `Result` events as
    /// they happen, then a final `Done`. Must be called from within a Tokio
    /// runtime.
    ///
    /// # Errors
    /// - `SpeedTestError::NoBots` - The pool is empty
    pub fn benchmark_all_with_events(
        self: &Arc<Self>,
        message: MessageRef,
    ) -> Result<mpsc::Receiver<SpeedTestEvent>, SpeedTestError> {
        if self.pool.is_empty() {
            return Err(SpeedTestError::NoBots);
        }

        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let tester = Arc::clone(self);
        self.tasks.spawn(async move {
            tester.run_with_events(message, events).await;
        });
        Ok(receiver)
    }

    async fn run_with_events(&self, message: MessageRef, events: mpsc::Sender<SpeedTestEvent>) {
        let total = self.pool.len();
        let target_dc = self.target_dc(message).await;
        if events
            .send(SpeedTestEvent::Start { total, target_dc })
            .await
            .is_err()
        {
            return;
        }

        let mut runs: FuturesUnordered<_> = self
            .pool
            .bots()
            .iter()
            .map(|bot| self.benchmark_bot(Arc::clone(bot), message, Some(events.clone())))
            .collect();

        let mut completed = 0;
        while let Some(result) = runs.next().await {
            completed += 1;
            let event = SpeedTestEvent::Result {
                data: result,
                completed,
                total,
            };
            if events.send(event).await.is_err() {
                debug!("Speed test listener went away");
                return;
            }
        }

        // Receiver may already be gone; nothing left to report either way.
        let _ = events.send(SpeedTestEvent::Done { total }).await;
    }

    /// Datacenter holding the file, resolved best-effort through the first bot.
    async fn target_dc(&self, message: MessageRef) -> Option<DcId> {
        let bot = self.pool.bots().first()?;
        bot.resolve_fresh(message)
            .await
            .map(|locator| locator.dc_id)
            .ok()
    }

    async fn benchmark_bot(
        &self,
        bot: Arc<Bot>,
        message: MessageRef,
        progress: Option<mpsc::Sender<SpeedTestEvent>>,
    ) -> BotBenchmark {
        let home_dc = bot.client().home_dc().await.ok();
        let mut result = BotBenchmark::new(bot.index(), home_dc);

        if let Err(e) = self.measure(&bot, message, progress, &mut result).await {
            warn!(bot = %bot.index(), dc = ?home_dc, error = %e, "Speed test failed");
            result.error = Some(e.to_string());
        }
        result
    }

    async fn measure(
        &self,
        bot: &Bot,
        message: MessageRef,
        progress: Option<mpsc::Sender<SpeedTestEvent>>,
        result: &mut BotBenchmark,
    ) -> Result<(), BenchmarkFailure> {
        let locator = bot.resolve_fresh(message).await?;
        let session = bot.sessions().session_for(locator.dc_id).await?;

        let ping_started = Instant::now();
        let probe = tokio::time::timeout(
            self.config.fetch_timeout,
            session.fetch_range(&locator, 0, self.config.probe_size),
        )
        .await
        .map_err(|_| BenchmarkFailure::Probe(ProtocolError::Timeout))?
        .map_err(BenchmarkFailure::Probe)?;
        result.ping_ms = Some(round_to(ping_started.elapsed().as_secs_f64() * 1000.0, 2));

        if probe.is_empty() {
            return Err(BenchmarkFailure::EmptyProbe);
        }

        let started = Instant::now();
        let window = DownloadWindow {
            offsets: Mutex::new(
                (0..self.config.window_bytes)
                    .step_by(self.config.chunk_size.max(1))
                    .collect(),
            ),
            eof: AtomicBool::new(false),
            downloaded: AtomicU64::new(0),
            last_progress: Mutex::new(started),
            started,
        };

        let workers = (0..self.config.workers.max(1)).map(|_| {
            self.download_worker(
                bot.index(),
                session.as_ref(),
                &locator,
                &window,
                progress.as_ref(),
            )
        });
        join_all(workers).await;

        let elapsed = started.elapsed().as_secs_f64().max(1e-6);
        let downloaded = window.downloaded.load(Ordering::Acquire);
        result.bytes_downloaded = downloaded;
        result.elapsed_secs = Some(round_to(elapsed, 3));
        result.mbps = Some(round_to(downloaded as f64 / BYTES_PER_MIB / elapsed, 3));

        info!(
            bot = %bot.index(),
            ping_ms = ?result.ping_ms,
            mbps = ?result.mbps,
            bytes = downloaded,
            "Speed test finished"
        );
        Ok(())
    }

    async fn download_worker(
        &self,
        bot: BotIndex,
        session: &dyn MediaSession,
        locator: &FileLocator,
        window: &DownloadWindow,
        progress: Option<&mpsc::Sender<SpeedTestEvent>>,
    ) {
        while !window.eof.load(Ordering::Acquire) {
            let Some(offset) = window.offsets.lock().pop_front() else {
                break;
            };
            let wanted = self
                .config
                .chunk_size
                .min((self.config.window_bytes - offset) as usize);

            let fetched = tokio::time::timeout(
                self.config.fetch_timeout,
                session.fetch_range(locator, offset, wanted),
            )
            .await;

            let chunk = match fetched {
                Ok(Ok(chunk)) => chunk,
                Ok(Err(e)) => {
                    debug!(%bot, offset, error = %e, "Speed test request failed; skipping");
                    continue;
                }
                Err(_) => {
                    debug!(%bot, offset, "Speed test request timed out; skipping");
                    continue;
                }
            };

            if chunk.is_empty() {
                window.eof.store(true, Ordering::Release);
                continue;
            }
            if chunk.len() < wanted {
                window.eof.store(true, Ordering::Release);
            }

            let received = chunk.len() as u64;
            let downloaded = window.downloaded.fetch_add(received, Ordering::AcqRel) + received;

            if let Some(events) = progress {
                if let Some(event) = self.progress_event(bot, window, downloaded) {
                    let _ = events.send(event).await;
                }
            }
        }
    }

    /// Builds a progress event if the configured interval has passed.
    fn progress_event(
        &self,
        bot: BotIndex,
        window: &DownloadWindow,
        downloaded: u64,
    ) -> Option<SpeedTestEvent> {
        let now = Instant::now();
        {
            let mut last = window.last_progress.lock();
            if now.duration_since(*last) < self.config.progress_interval {
                return None;
            }
            *last = now;
        }

        let elapsed = now.duration_since(window.started).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(SpeedTestEvent::Progress {
            data: BenchmarkProgress {
                bot,
                display_name: bot.display_name(),
                bytes_downloaded: downloaded,
                elapsed_secs: round_to(elapsed, 3),
                mbps: round_to(downloaded as f64 / BYTES_PER_MIB / elapsed, 3),
            },
        })
    }
}

/// Fastest first; bots without a throughput figure last.
fn sort_by_throughput(results: &mut [BotBenchmark]) {
    results.sort_by(|a, b| {
        let a = a.mbps.unwrap_or(-1.0);
        let b = b.mbps.unwrap_or(-1.0);
        b.total_cmp(&a)
    });
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
