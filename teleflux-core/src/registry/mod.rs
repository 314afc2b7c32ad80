//! Stream Registry: the live table of in-flight streams and a short history.
//!
//! Every streaming request is registered here when it opens and updated on
//! every delivered chunk. On close the final state is folded into the bot's
//! throughput estimate, persisted through a [`StatsSink`], and after a short
//! delay moved from the live table into a bounded recent-history ring.

pub mod sink;
pub mod state;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

pub use sink::{SinkError, StatsSink, StreamSummary, TracingStatsSink};
pub use state::{StreamId, StreamParams, StreamState, StreamStatus, ThroughputWindow};

use crate::config::StreamingConfig;
use crate::pool::{BotHealth, WorkloadGuard};
use crate::protocol::{BotIndex, DcId};

/// Registration of one open stream. Holds the bot's workload slot.
#[derive(Debug)]
pub struct StreamTicket {
    id: StreamId,
    health: Arc<BotHealth>,
    workload: WorkloadGuard,
}

impl StreamTicket {
    pub fn id(&self) -> &StreamId {
        &self.id
    }
}

/// Live and recently finished streams, for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub active: Vec<StreamState>,
    pub recent: Vec<StreamState>,
}

/// Live table plus history ring, shared with delayed eviction tasks.
#[derive(Debug)]
struct StreamTables {
    live: RwLock<HashMap<StreamId, StreamState>>,
    recent: Mutex<VecDeque<StreamState>>,
    recent_capacity: usize,
}

impl StreamTables {
    fn evict(&self, id: &StreamId) {
        let Some(state) = self.live.write().remove(id) else {
            return;
        };
        let mut recent = self.recent.lock();
        recent.push_front(state);
        recent.truncate(self.recent_capacity);
    }
}

/// Process-wide table of stream telemetry.
pub struct StreamRegistry {
    config: StreamingConfig,
    tables: Arc<StreamTables>,
    sink: Arc<dyn StatsSink>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl StreamRegistry {
    pub fn new(
        config: StreamingConfig,
        sink: Arc<dyn StatsSink>,
        tasks: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        let tables = Arc::new(StreamTables {
            live: RwLock::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(config.recent_capacity)),
            recent_capacity: config.recent_capacity,
        });
        Self {
            config,
            tables,
            sink,
            tasks,
            shutdown,
        }
    }

    /// Registers a new stream on `bot` and takes one workload slot for it.
    pub fn open(
        &self,
        bot: BotIndex,
        health: &Arc<BotHealth>,
        dc: DcId,
        params: StreamParams,
        meta: BTreeMap<String, String>,
    ) -> StreamTicket {
        let id = StreamId::generate();
        let workload = health.begin_stream();
        let state = StreamState::new(id.clone(), bot, dc, params, meta);

        debug!(stream = %id, %bot, %dc, parts = params.plan.part_count, "Stream opened");
        self.tables.live.write().insert(id.clone(), state);

        StreamTicket {
            id,
            health: Arc::clone(health),
            workload,
        }
    }

    /// Records a delivered chunk. Ignored once the stream left `Active`.
    pub fn record_chunk(&self, id: &StreamId, bytes: u64) {
        if let Some(state) = self.tables.live.write().get_mut(id) {
            if state.is_active() {
                state.record_chunk(bytes);
            }
        }
    }

    /// Moves an active stream to a terminal status.
    pub fn mark(&self, id: &StreamId, status: StreamStatus) {
        if let Some(state) = self.tables.live.write().get_mut(id) {
            if state.is_active() {
                state.status = status;
            }
        }
    }

    /// Current state of a live or recent stream.
    pub fn stream(&self, id: &StreamId) -> Option<StreamState> {
        if let Some(state) = self.tables.live.read().get(id) {
            return Some(state.clone());
        }
        self.tables
            .recent
            .lock()
            .iter()
            .find(|state| &state.id == id)
            .cloned()
    }

    pub fn active_count(&self) -> usize {
        self.tables.live.read().len()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut active: Vec<_> = self.tables.live.read().values().cloned().collect();
        active.sort_by_key(|state| state.started_at);
        let recent = self.tables.recent.lock().iter().cloned().collect();
        RegistrySnapshot { active, recent }
    }

    /// Finalizes the stream, folds its throughput into the bot's average,
    /// releases the workload slot, and schedules persistence and eviction.
    ///
    /// Returns `None` if the stream is no longer in the live table.
    pub fn close(&self, ticket: StreamTicket) -> Option<StreamSummary> {
        let StreamTicket {
            id,
            health,
            workload,
        } = ticket;

        let summary = {
            let mut live = self.tables.live.write();
            let state = live.get_mut(&id)?;
            state.finalize();
            StreamSummary::from_state(state)
        };

        let smoothed = health.fold_throughput(summary.avg_mbps);
        drop(workload);
        debug!(
            stream = %id,
            status = %summary.status,
            bytes = summary.total_bytes,
            avg_mbps = summary.avg_mbps,
            bot_avg_mbps = smoothed,
            "Stream closed"
        );

        self.persist(summary.clone());
        self.schedule_eviction(id);
        Some(summary)
    }

    /// Moves a stream from the live table to the front of the history ring.
    pub fn evict(&self, id: &StreamId) {
        self.tables.evict(id);
    }

    fn persist(&self, summary: StreamSummary) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(stream = %summary.stream_id, "No runtime; dropping stream summary");
            return;
        }
        let sink = Arc::clone(&self.sink);
        self.tasks.spawn(async move {
            let stream = summary.stream_id.clone();
            if let Err(e) = sink.record(summary).await {
                warn!(%stream, error = %e, "Failed to persist stream summary");
            }
        });
    }

    fn schedule_eviction(&self, id: StreamId) {
        if tokio::runtime::Handle::try_current().is_err() {
            self.tables.evict(&id);
            return;
        }
        let delay = self.config.eviction_delay;
        let shutdown = self.shutdown.clone();
        let tables = Arc::clone(&self.tables);
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            tables.evict(&id);
        });
    }
}
