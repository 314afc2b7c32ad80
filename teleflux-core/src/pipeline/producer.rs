//! Bounded-parallel chunk scheduling with in-order delivery.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::fetch::{ChunkFetcher, ChunkResult, FetchFailure};
use super::range::RangePlan;

/// Item on the delivery queue between producer and consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Delivery {
    Chunk { sequence: u64, bytes: Bytes },
    /// Every part was delivered.
    Finished,
    /// A chunk could not be fetched; nothing after it will arrive.
    Failed { sequence: u64, attempts: u32 },
}

/// Schedules chunk fetches for one stream and feeds them, in order, into a
/// bounded queue.
pub(crate) struct Producer {
    fetcher: Arc<ChunkFetcher>,
    plan: RangePlan,
    parallelism: usize,
    queue: mpsc::Sender<Delivery>,
    stop: CancellationToken,
}

impl Producer {
    pub(crate) fn new(
        fetcher: Arc<ChunkFetcher>,
        plan: RangePlan,
        parallelism: usize,
        queue: mpsc::Sender<Delivery>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            plan,
            parallelism: parallelism.max(1),
            queue,
            stop,
        }
    }

    /// Runs until every part is queued, a chunk fails, or `stop` fires.
    ///
    /// Completions may arrive in any order; they are parked in a buffer and
    /// released strictly by sequence number. Sending blocks while the queue
    /// is full, which stops further scheduling until the consumer drains it.
    pub(crate) async fn run(self) {
        let mut in_flight = JoinSet::new();
        self.drive(&mut in_flight).await;
        // Abandoned fetches are gone before the producer counts as finished.
        in_flight.shutdown().await;
    }

    async fn drive(&self, in_flight: &mut JoinSet<ChunkResult>) {
        let part_count = self.plan.part_count;
        let mut buffer = BTreeMap::new();
        let mut next_to_schedule = 0;
        let mut next_to_deliver = 0;

        while next_to_schedule < part_count && in_flight.len() < self.parallelism {
            self.schedule(in_flight, next_to_schedule);
            next_to_schedule += 1;
        }

        while next_to_deliver < part_count {
            let joined = tokio::select! {
                _ = self.stop.cancelled() => {
                    debug!("Producer stopped");
                    return;
                }
                joined = in_flight.join_next() => joined,
            };

            let Some(joined) = joined else {
                error!(next_to_deliver, "Producer ran out of fetches before finishing");
                self.deliver(Delivery::Failed {
                    sequence: next_to_deliver,
                    attempts: 0,
                })
                .await;
                return;
            };

            let ChunkResult { sequence, outcome } = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Chunk fetch task failed");
                    self.deliver(Delivery::Failed {
                        sequence: next_to_deliver,
                        attempts: 0,
                    })
                    .await;
                    return;
                }
            };

            match outcome {
                Ok(bytes) => {
                    buffer.insert(sequence, bytes);
                }
                Err(FetchFailure::Cancelled) => return,
                Err(FetchFailure::Exhausted { attempts }) => {
                    error!(sequence, attempts, "Chunk exhausted its attempts; aborting stream");
                    self.deliver(Delivery::Failed { sequence, attempts }).await;
                    return;
                }
            }

            if next_to_schedule < part_count {
                self.schedule(in_flight, next_to_schedule);
                next_to_schedule += 1;
            }

            while let Some(bytes) = buffer.remove(&next_to_deliver) {
                if !self
                    .deliver(Delivery::Chunk {
                        sequence: next_to_deliver,
                        bytes,
                    })
                    .await
                {
                    return;
                }
                next_to_deliver += 1;
            }
        }

        self.deliver(Delivery::Finished).await;
    }

    fn schedule(&self, in_flight: &mut JoinSet<ChunkResult>, sequence: u64) {
        let fetcher = Arc::clone(&self.fetcher);
        let offset = self.plan.chunk_offset(sequence);
        in_flight.spawn(async move { fetcher.fetch(sequence, offset).await });
    }

    /// Queues `delivery`, returning false once the consumer is gone or the
    /// stream was stopped.
    async fn deliver(&self, delivery: Delivery) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            sent = self.queue.send(delivery) => sent.is_ok(),
        }
    }
}
