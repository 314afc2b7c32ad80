//! Per-bot cache of resolved file locators.
//!
//! Resolving a message to a locator costs a metadata round-trip, so each bot
//! keeps what it resolved. Locators carry a session-bound reference token and
//! therefore live in exactly one bot's cache. The whole cache is dropped on a
//! fixed interval so rotated reference tokens are picked up again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{BotIndex, FileLocator, MessageRef, ProtocolClient, ProtocolError};

/// Errors that can occur while resolving a message to a locator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocatorError {
    #[error("Message {message} not found or has no media")]
    NotFound { message: MessageRef },

    #[error("Protocol error while resolving message: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocatorCacheStatistics {
    pub entries: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
}

/// Unbounded message-to-locator map owned by a single bot.
#[derive(Debug)]
pub struct FileLocatorCache {
    bot: BotIndex,
    entries: RwLock<HashMap<MessageRef, FileLocator>>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl FileLocatorCache {
    pub fn new(bot: BotIndex) -> Self {
        Self {
            bot,
            entries: RwLock::new(HashMap::new()),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    /// Returns the cached locator or resolves it through `client`.
    ///
    /// # Errors
    /// - `LocatorError::NotFound` - Message missing or without media payload
    /// - `LocatorError::Protocol` - Metadata call failed
    pub async fn resolve(
        &self,
        client: &dyn ProtocolClient,
        message: MessageRef,
    ) -> Result<FileLocator, LocatorError> {
        if let Some(locator) = self.entries.read().get(&message).cloned() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            return Ok(locator);
        }
        self.miss_count.fetch_add(1, Ordering::Relaxed);

        let Some(locator) = client.resolve_message(message).await? else {
            warn!(bot = %self.bot, %message, "Message not found");
            return Err(LocatorError::NotFound { message });
        };

        debug!(bot = %self.bot, %message, dc = %locator.dc_id, "Cached file locator");
        self.entries.write().insert(message, locator.clone());
        Ok(locator)
    }

    /// Cached locator for `message`, without resolving.
    pub fn cached(&self, message: &MessageRef) -> Option<FileLocator> {
        self.entries.read().get(message).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops every entry and returns how many were purged.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let purged = entries.len();
        entries.clear();
        purged
    }

    pub fn statistics(&self) -> LocatorCacheStatistics {
        let hit_count = self.hit_count.load(Ordering::Relaxed);
        let miss_count = self.miss_count.load(Ordering::Relaxed);
        let lookups = hit_count + miss_count;

        LocatorCacheStatistics {
            entries: self.len(),
            hit_count,
            miss_count,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hit_count as f64 / lookups as f64
            },
        }
    }

    /// Clears the cache every `interval` until `shutdown` fires.
    pub async fn clear_periodically(&self, interval: Duration, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = self.clear();
                    debug!(bot = %self.bot, purged, "Cleared file locator cache");
                }
            }
        }
    }
}
