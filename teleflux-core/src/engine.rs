//! Process-wide streaming engine.
//!
//! Owns the bot pool, the stream registry, and every background task, and is
//! the single entry point for the HTTP layer and admin surfaces.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::TelefluxError;
use crate::config::TelefluxConfig;
use crate::pipeline::{OpenedStream, RangePlan, StreamError, StreamPipeline, StreamRequest};
use crate::pool::{BotSnapshot, ClientPool};
use crate::protocol::{MessageRef, ProtocolClient};
use crate::registry::{RegistrySnapshot, StatsSink, StreamRegistry};
use crate::speedtest::{BotBenchmark, SpeedTestEvent, SpeedTester};

/// Inclusive byte range of a stored file requested by a client.
#[derive(Debug, Clone)]
pub struct RangeRequest {
    pub message: MessageRef,
    pub from: u64,
    pub until: u64,
    pub downstream: CancellationToken,
    pub meta: BTreeMap<String, String>,
}

impl RangeRequest {
    pub fn new(message: MessageRef, from: u64, until: u64) -> Self {
        Self {
            message,
            from,
            until,
            downstream: CancellationToken::new(),
            meta: BTreeMap::new(),
        }
    }

    /// Ties the stream to a downstream disconnect signal.
    pub fn with_downstream(mut self, downstream: CancellationToken) -> Self {
        self.downstream = downstream;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// Multi-bot streaming engine.
pub struct Engine {
    config: TelefluxConfig,
    pool: Arc<ClientPool>,
    registry: Arc<StreamRegistry>,
    pipeline: StreamPipeline,
    speed_tester: Arc<SpeedTester>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Engine {
    /// Builds the engine around already-connected bot clients.
    pub fn new(
        clients: Vec<Arc<dyn ProtocolClient>>,
        config: TelefluxConfig,
        sink: Arc<dyn StatsSink>,
    ) -> Self {
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let pool = Arc::new(ClientPool::new(clients, &config));
        let registry = Arc::new(StreamRegistry::new(
            config.streaming.clone(),
            sink,
            tasks.clone(),
            shutdown.clone(),
        ));
        let pipeline = StreamPipeline::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            config.streaming.clone(),
            tasks.clone(),
            shutdown.clone(),
        );
        let speed_tester = Arc::new(SpeedTester::new(
            Arc::clone(&pool),
            config.speed_test.clone(),
            tasks.clone(),
        ));

        Self {
            config,
            pool,
            registry,
            pipeline,
            speed_tester,
            tasks,
            shutdown,
        }
    }

    /// Starts background maintenance: session pre-warm and cache clearing.
    pub fn start(&self) {
        info!(bots = self.pool.len(), "Starting streaming engine");
        self.pool
            .spawn_maintenance(&self.config, &self.tasks, &self.shutdown);
    }

    pub fn config(&self) -> &TelefluxConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn speed_tester(&self) -> &Arc<SpeedTester> {
        &self.speed_tester
    }

    /// Opens a stream for `request` on the best available bot.
    ///
    /// The file is resolved and the bot's session to the file's datacenter
    /// is established before any byte is fetched, so those failures surface
    /// here rather than mid-stream.
    ///
    /// # Errors
    /// - `TelefluxError::NoBots` - The pool is empty
    /// - `TelefluxError::Locator` - Message missing or metadata call failed
    /// - `TelefluxError::Session` - Session to the file's datacenter unusable
    /// - `TelefluxError::Stream` - Range outside the file or reversed
    pub async fn open_stream(&self, request: RangeRequest) -> Result<OpenedStream, TelefluxError> {
        let RangeRequest {
            message,
            from,
            until,
            downstream,
            meta,
        } = request;

        let bot = self.pool.select_primary().ok_or(TelefluxError::NoBots)?;
        let locator = bot.resolve(message).await?;
        if locator.file_size > 0 && until >= locator.file_size {
            return Err(StreamError::InvalidRange { from, until }.into());
        }
        bot.sessions().session_for(locator.dc_id).await?;

        let chunk_size = self.pool.chunk_size_for(bot.index());
        let plan = RangePlan::new(from, until, chunk_size)?;
        debug!(
            %message,
            bot = %bot.index(),
            chunk_size,
            parts = plan.part_count,
            "Opening stream"
        );

        Ok(self.pipeline.open_stream(StreamRequest {
            message,
            locator,
            bot,
            plan,
            look_ahead: self.config.streaming.look_ahead,
            parallelism: self.config.streaming.parallelism,
            downstream,
            meta,
        }))
    }

    /// Opens a stream from a fully specified request, bypassing selection.
    pub fn open_planned_stream(&self, request: StreamRequest) -> OpenedStream {
        self.pipeline.open_stream(request)
    }

    pub fn bot_snapshot(&self) -> Vec<BotSnapshot> {
        self.pool.snapshot()
    }

    pub fn stream_snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// Purges every bot's locator cache, returning the number of entries dropped.
    pub fn clear_locator_caches(&self) -> usize {
        self.pool.clear_locator_caches()
    }

    /// # Errors
    /// - `TelefluxError::SpeedTest` - The pool is empty
    pub async fn benchmark_all(
        &self,
        message: MessageRef,
    ) -> Result<Vec<BotBenchmark>, TelefluxError> {
        Ok(self.speed_tester.benchmark_all(message).await?)
    }

    /// # Errors
    /// - `TelefluxError::SpeedTest` - The pool is empty
    pub fn benchmark_all_with_events(
        &self,
        message: MessageRef,
    ) -> Result<mpsc::Receiver<SpeedTestEvent>, TelefluxError> {
        Ok(self.speed_tester.benchmark_all_with_events(message)?)
    }

    /// Stops every stream and background task and waits for them to exit.
    pub async fn shutdown(&self) {
        info!("Shutting down streaming engine");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
