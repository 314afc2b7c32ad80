//! Ordered delivery of fetched chunks as a byte stream.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::producer::Delivery;
use super::range::RangePlan;
use super::{ByteStream, StreamError};
use crate::registry::{StreamId, StreamRegistry, StreamStatus, StreamTicket};

/// Tears a stream down exactly once, whichever way it ends.
///
/// The producer is stopped and given `grace` to exit before it is aborted.
/// Only then is the registry entry closed, so the bot's workload slot is
/// held for as long as fetches may still be in flight.
pub(crate) struct Closer {
    ticket: Option<StreamTicket>,
    registry: Arc<StreamRegistry>,
    producer_stop: CancellationToken,
    producer: Option<JoinHandle<()>>,
    grace: Duration,
    tasks: TaskTracker,
}

impl Closer {
    pub(crate) fn new(
        ticket: StreamTicket,
        registry: Arc<StreamRegistry>,
        producer_stop: CancellationToken,
        producer: JoinHandle<()>,
        grace: Duration,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            ticket: Some(ticket),
            registry,
            producer_stop,
            producer: Some(producer),
            grace,
            tasks,
        }
    }

    /// Stops and joins the producer, then closes the registry entry.
    pub(crate) async fn close(mut self) {
        self.producer_stop.cancel();
        if let Some(producer) = self.producer.take() {
            join_within(producer, self.grace).await;
        }
        if let Some(ticket) = self.ticket.take() {
            self.registry.close(ticket);
        }
    }
}

async fn join_within(mut producer: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut producer).await.is_err() {
        debug!("Producer missed its grace period; aborting");
        producer.abort();
    }
}

impl Drop for Closer {
    fn drop(&mut self) {
        self.producer_stop.cancel();

        let (Some(producer), Some(ticket)) = (self.producer.take(), self.ticket.take()) else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            let registry = Arc::clone(&self.registry);
            let grace = self.grace;
            self.tasks.spawn(async move {
                join_within(producer, grace).await;
                registry.close(ticket);
            });
        } else {
            producer.abort();
            self.registry.close(ticket);
        }
    }
}

/// Consumer half of a stream: drains the delivery queue in order.
pub(crate) struct Consumer {
    id: StreamId,
    queue: mpsc::Receiver<Delivery>,
    plan: RangePlan,
    registry: Arc<StreamRegistry>,
    downstream: CancellationToken,
    closer: Option<Closer>,
}

impl Consumer {
    pub(crate) fn new(
        id: StreamId,
        queue: mpsc::Receiver<Delivery>,
        plan: RangePlan,
        registry: Arc<StreamRegistry>,
        downstream: CancellationToken,
        closer: Closer,
    ) -> Self {
        Self {
            id,
            queue,
            plan,
            registry,
            downstream,
            closer: Some(closer),
        }
    }

    pub(crate) fn into_stream(self) -> ByteStream {
        Box::pin(stream::unfold(self, |mut consumer| async move {
            let item = consumer.next_piece().await?;
            Some((item, consumer))
        }))
    }

    async fn next_piece(&mut self) -> Option<Result<Bytes, StreamError>> {
        if self.closer.is_none() {
            return None;
        }

        let delivery = tokio::select! {
            biased;
            _ = self.downstream.cancelled() => {
                debug!(stream = %self.id, "Downstream disconnected; cancelling stream");
                self.finish(StreamStatus::Cancelled).await;
                return None;
            }
            delivery = self.queue.recv() => delivery,
        };

        match delivery {
            Some(Delivery::Chunk { sequence, bytes }) => {
                self.registry.record_chunk(&self.id, bytes.len() as u64);
                Some(Ok(self.plan.trim(sequence, bytes)))
            }
            Some(Delivery::Finished) => {
                self.finish(StreamStatus::Finished).await;
                None
            }
            Some(Delivery::Failed { sequence, attempts }) => {
                self.finish(StreamStatus::Error).await;
                Some(Err(StreamError::ChunkExhausted { sequence, attempts }))
            }
            None => {
                self.finish(StreamStatus::Error).await;
                Some(Err(StreamError::ProducerFailed))
            }
        }
    }

    async fn finish(&mut self, status: StreamStatus) {
        if status != StreamStatus::Finished {
            self.registry.mark(&self.id, status);
        }
        if let Some(closer) = self.closer.take() {
            closer.close().await;
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if self.closer.is_some() {
            debug!(stream = %self.id, "Stream dropped before completion");
            self.registry.mark(&self.id, StreamStatus::Cancelled);
            self.closer = None;
        }
    }
}
