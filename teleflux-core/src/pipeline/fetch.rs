//! Single-chunk fetching with timeout, backoff, and bot failover.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::StreamingConfig;
use crate::pool::{Bot, ClientPool};
use crate::protocol::{FileLocator, MediaSession, MessageRef, ProtocolError};

/// Why a chunk could not be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// Every attempt failed.
    Exhausted { attempts: u32 },
    /// The stream was stopped before the chunk arrived.
    Cancelled,
}

/// Outcome of fetching one chunk, tagged with its position in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    pub sequence: u64,
    pub outcome: Result<Bytes, FetchFailure>,
}

/// Bot, locator, and session used for one attempt.
struct Target {
    bot: Arc<Bot>,
    locator: FileLocator,
    session: Arc<dyn MediaSession>,
}

/// Fetches the chunks of one stream on behalf of its owning bot.
pub(crate) struct ChunkFetcher {
    pool: Arc<ClientPool>,
    primary: Arc<Bot>,
    message: MessageRef,
    locator: FileLocator,
    chunk_size: usize,
    config: StreamingConfig,
    stop: CancellationToken,
}

impl ChunkFetcher {
    pub(crate) fn new(
        pool: Arc<ClientPool>,
        primary: Arc<Bot>,
        message: MessageRef,
        locator: FileLocator,
        chunk_size: usize,
        config: StreamingConfig,
        stop: CancellationToken,
    ) -> Self {
        Self {
            pool,
            primary,
            message,
            locator,
            chunk_size,
            config,
            stop,
        }
    }

    /// Fetches chunk `sequence` at `offset`, retrying and failing over.
    ///
    /// The first attempts go to the owning bot. Once `fallback_after`
    /// attempts have failed and the pool has other bots, each further
    /// attempt goes to the best-scoring other bot. When a fallback bot
    /// serves the chunk the owning bot is penalized as well.
    pub(crate) async fn fetch(&self, sequence: u64, offset: u64) -> ChunkResult {
        let max_attempts = self.config.max_attempts;
        let mut attempts = 0;

        while attempts < max_attempts {
            if self.stop.is_cancelled() {
                return self.result(sequence, Err(FetchFailure::Cancelled));
            }

            let outcome = match self.target(attempts).await {
                Ok(target) => self.attempt(&target, offset).await.map(|bytes| (target, bytes)),
                Err(e) => Err(e),
            };

            match outcome {
                Ok((target, bytes)) => {
                    if target.bot.index() != self.primary.index() {
                        self.primary.health().record_failure();
                        self.primary.health().record_bypass();
                        debug!(
                            sequence,
                            primary = %self.primary.index(),
                            fallback = %target.bot.index(),
                            "Chunk served by fallback bot"
                        );
                    }
                    return self.result(sequence, Ok(bytes));
                }
                Err((bot, e)) => {
                    attempts += 1;
                    if e.is_transient() {
                        bot.health().record_failure();
                        warn!(
                            sequence,
                            offset,
                            attempt = attempts,
                            bot = %bot.index(),
                            error = %e,
                            "Chunk fetch failed"
                        );
                    } else {
                        debug!(
                            sequence,
                            offset,
                            attempt = attempts,
                            bot = %bot.index(),
                            error = %e,
                            "Chunk fetch error"
                        );
                    }
                }
            }

            if attempts >= max_attempts {
                break;
            }

            let delay = self.config.backoff_delay(attempts);
            tokio::select! {
                _ = self.stop.cancelled() => {
                    return self.result(sequence, Err(FetchFailure::Cancelled));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        error!(
            sequence,
            offset,
            attempts,
            bot = %self.primary.index(),
            "Giving up on chunk"
        );
        self.result(sequence, Err(FetchFailure::Exhausted { attempts }))
    }

    fn result(&self, sequence: u64, outcome: Result<Bytes, FetchFailure>) -> ChunkResult {
        ChunkResult { sequence, outcome }
    }

    /// Picks the bot for the next attempt, reverting to the owning bot when
    /// the fallback cannot be prepared.
    async fn target(&self, attempts: u32) -> Result<Target, (Arc<Bot>, ProtocolError)> {
        if attempts >= self.config.fallback_after && self.pool.len() > 1 {
            if let Some(fallback) = self.pool.select_fallback(self.primary.index()) {
                match self.prepare(&fallback).await {
                    Ok(target) => {
                        debug!(
                            attempt = attempts,
                            primary = %self.primary.index(),
                            fallback = %fallback.index(),
                            "Switching chunk to fallback bot"
                        );
                        return Ok(target);
                    }
                    Err(e) => {
                        debug!(fallback = %fallback.index(), error = %e, "Fallback bot unusable");
                    }
                }
            }
        }

        let session = self
            .primary
            .sessions()
            .session_for(self.locator.dc_id)
            .await
            .map_err(|e| (Arc::clone(&self.primary), e.protocol_error().clone()))?;

        Ok(Target {
            bot: Arc::clone(&self.primary),
            locator: self.locator.clone(),
            session,
        })
    }

    /// Resolves the file for `bot` and opens its session to the file's DC.
    async fn prepare(&self, bot: &Arc<Bot>) -> Result<Target, String> {
        let locator = bot.resolve(self.message).await.map_err(|e| e.to_string())?;
        let session = bot
            .sessions()
            .session_for(locator.dc_id)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Target {
            bot: Arc::clone(bot),
            locator,
            session,
        })
    }

    async fn attempt(
        &self,
        target: &Target,
        offset: u64,
    ) -> Result<Bytes, (Arc<Bot>, ProtocolError)> {
        let fetch = target
            .session
            .fetch_range(&target.locator, offset, self.chunk_size);

        match tokio::time::timeout(self.config.fetch_timeout, fetch).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err((Arc::clone(&target.bot), e)),
            Err(_) => Err((Arc::clone(&target.bot), ProtocolError::Timeout)),
        }
    }
}
