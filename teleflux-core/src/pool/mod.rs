//! The bot pool: every authenticated protocol client and its live health.
//!
//! The pool is built once at startup and never shrinks. Bots that misbehave
//! accumulate failures and drift to the back of selection order, but they are
//! never removed.

pub mod health;

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

pub use health::{
    BotHealth, BotSnapshot, HealthStatus, WorkloadGuard, chunk_size_for_throughput,
};

use crate::config::TelefluxConfig;
use crate::locator::{FileLocatorCache, LocatorError};
use crate::protocol::{BotIndex, FileLocator, MessageRef, ProtocolClient};
use crate::session::MediaSessionManager;

/// One authenticated client together with its caches and counters.
pub struct Bot {
    index: BotIndex,
    client: Arc<dyn ProtocolClient>,
    locators: FileLocatorCache,
    sessions: MediaSessionManager,
    health: Arc<BotHealth>,
}

impl Bot {
    pub fn new(index: BotIndex, client: Arc<dyn ProtocolClient>, config: &TelefluxConfig) -> Self {
        Self {
            index,
            locators: FileLocatorCache::new(index),
            sessions: MediaSessionManager::new(
                index,
                Arc::clone(&client),
                config.session.clone(),
            ),
            client,
            health: Arc::new(BotHealth::default()),
        }
    }

    pub fn index(&self) -> BotIndex {
        self.index
    }

    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }

    pub fn locators(&self) -> &FileLocatorCache {
        &self.locators
    }

    pub fn sessions(&self) -> &MediaSessionManager {
        &self.sessions
    }

    pub fn health(&self) -> &Arc<BotHealth> {
        &self.health
    }

    /// Resolves `message` through this bot's locator cache.
    ///
    /// # Errors
    /// - `LocatorError::NotFound` - Message missing or without media
    /// - `LocatorError::Protocol` - Metadata call failed
    pub async fn resolve(&self, message: MessageRef) -> Result<FileLocator, LocatorError> {
        self.locators.resolve(self.client.as_ref(), message).await
    }

    /// Resolves `message` bypassing the cache.
    ///
    /// # Errors
    /// - `LocatorError::NotFound` - Message missing or without media
    /// - `LocatorError::Protocol` - Metadata call failed
    pub async fn resolve_fresh(&self, message: MessageRef) -> Result<FileLocator, LocatorError> {
        self.client
            .resolve_message(message)
            .await?
            .ok_or(LocatorError::NotFound { message })
    }
}

/// Fixed set of bots shared by every stream in the process.
pub struct ClientPool {
    bots: Vec<Arc<Bot>>,
}

impl ClientPool {
    /// Builds the pool, assigning indices in the order clients are given.
    pub fn new(clients: Vec<Arc<dyn ProtocolClient>>, config: &TelefluxConfig) -> Self {
        let bots = clients
            .into_iter()
            .enumerate()
            .map(|(index, client)| Arc::new(Bot::new(BotIndex(index), client, config)))
            .collect();
        Self { bots }
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }

    pub fn bot(&self, index: BotIndex) -> Option<&Arc<Bot>> {
        self.bots.get(index.0)
    }

    pub fn bots(&self) -> &[Arc<Bot>] {
        &self.bots
    }

    /// Best bot for a new stream: lowest `workload + 3 × failures`.
    pub fn select_primary(&self) -> Option<Arc<Bot>> {
        self.bots.iter().min_by_key(|bot| bot.health.score()).cloned()
    }

    /// Best bot other than `primary`, ties broken by pool order.
    pub fn select_fallback(&self, primary: BotIndex) -> Option<Arc<Bot>> {
        self.bots
            .iter()
            .filter(|bot| bot.index != primary)
            .min_by_key(|bot| bot.health.score())
            .cloned()
    }

    /// Adaptive chunk size for streams served by `bot`.
    pub fn chunk_size_for(&self, bot: BotIndex) -> usize {
        let avg_mbps = self.bot(bot).map_or(0.0, |bot| bot.health.avg_mbps());
        chunk_size_for_throughput(avg_mbps)
    }

    pub fn snapshot(&self) -> Vec<BotSnapshot> {
        self.bots
            .iter()
            .map(|bot| BotSnapshot::capture(bot.index, &bot.health))
            .collect()
    }

    /// Total locators cached across all bots.
    pub fn cached_locator_count(&self) -> usize {
        self.bots.iter().map(|bot| bot.locators.len()).sum()
    }

    /// Purges every bot's locator cache, returning the number of entries dropped.
    pub fn clear_locator_caches(&self) -> usize {
        let purged = self.bots.iter().map(|bot| bot.locators.clear()).sum();
        info!(purged, bots = self.bots.len(), "Cleared file locator caches");
        purged
    }

    /// Pre-warms media sessions for every bot concurrently.
    pub async fn prewarm_all(&self) -> usize {
        join_all(self.bots.iter().map(|bot| bot.sessions.prewarm()))
            .await
            .into_iter()
            .sum()
    }

    /// Starts per-bot background work: session pre-warm and periodic cache clearing.
    pub fn spawn_maintenance(
        &self,
        config: &TelefluxConfig,
        tasks: &TaskTracker,
        shutdown: &CancellationToken,
    ) {
        for bot in &self.bots {
            let prewarm_bot = Arc::clone(bot);
            tasks.spawn(async move {
                prewarm_bot.sessions.prewarm().await;
            });

            let clearing_bot = Arc::clone(bot);
            let interval = config.cache.clear_interval;
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                clearing_bot
                    .locators
                    .clear_periodically(interval, shutdown)
                    .await;
            });
        }
    }
}
