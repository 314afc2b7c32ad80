//! Chunk Fetch Pipeline: turns a planned byte range into an ordered stream.
//!
//! Each stream runs one producer task that keeps a bounded number of chunk
//! fetches in flight and hands finished chunks, in order, to a bounded
//! delivery queue. The consumer side is the returned [`ByteStream`]: it drains
//! the queue, trims the outer chunks to the requested range, and reports every
//! delivered chunk to the [`StreamRegistry`].
//!
//! ```text
//! fetch tasks (≤ parallelism) ──▶ reorder buffer ──▶ queue (≤ look_ahead) ──▶ ByteStream
//! ```

mod consumer;
mod fetch;
mod producer;
pub mod range;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use fetch::{ChunkResult, FetchFailure};
pub use range::RangePlan;

use crate::config::StreamingConfig;
use crate::pool::{Bot, ClientPool};
use crate::protocol::{FileLocator, MessageRef};
use crate::registry::{StreamId, StreamParams, StreamRegistry};
use consumer::{Closer, Consumer};
use fetch::ChunkFetcher;
use producer::Producer;

/// Errors surfaced to whoever consumes a stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Chunk {sequence} could not be fetched after {attempts} attempts")]
    ChunkExhausted { sequence: u64, attempts: u32 },

    #[error("Chunk producer stopped before the stream was complete")]
    ProducerFailed,

    #[error("Invalid byte range: {from}-{until}")]
    InvalidRange { from: u64, until: u64 },

    #[error("Chunk size must be greater than zero")]
    InvalidChunkSize,
}

/// Lazy, finite, non-restartable sequence of response bytes.
///
/// A stream that ends with an `Err` item was truncated; bytes yielded before
/// it are not retracted.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// Everything needed to serve one range request.
pub struct StreamRequest {
    pub message: MessageRef,
    /// Locator resolved by `bot` itself
    pub locator: FileLocator,
    pub bot: Arc<Bot>,
    pub plan: RangePlan,
    /// Capacity of the delivery queue
    pub look_ahead: usize,
    /// Chunk fetches kept in flight
    pub parallelism: usize,
    /// Fires when the downstream client goes away
    pub downstream: CancellationToken,
    pub meta: BTreeMap<String, String>,
}

/// A registered stream and its bytes.
pub struct OpenedStream {
    pub id: StreamId,
    pub bytes: ByteStream,
}

/// Opens streams against a shared pool and registry.
pub struct StreamPipeline {
    pool: Arc<ClientPool>,
    registry: Arc<StreamRegistry>,
    config: StreamingConfig,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl StreamPipeline {
    pub fn new(
        pool: Arc<ClientPool>,
        registry: Arc<StreamRegistry>,
        config: StreamingConfig,
        tasks: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            registry,
            config,
            tasks,
            shutdown,
        }
    }

    /// Registers the stream and starts its producer.
    ///
    /// Must be called from within a Tokio runtime. Fetching starts right
    /// away; at most `look_ahead` chunks wait in the queue for the consumer.
    pub fn open_stream(&self, request: StreamRequest) -> OpenedStream {
        let StreamRequest {
            message,
            locator,
            bot,
            plan,
            look_ahead,
            parallelism,
            downstream,
            meta,
        } = request;

        let look_ahead = look_ahead.max(1);
        let params = StreamParams {
            plan,
            look_ahead,
            parallelism,
        };
        let ticket = self
            .registry
            .open(bot.index(), bot.health(), locator.dc_id, params, meta);
        let id = ticket.id().clone();

        let stop = self.shutdown.child_token();
        let fetcher = Arc::new(ChunkFetcher::new(
            Arc::clone(&self.pool),
            bot,
            message,
            locator,
            plan.chunk_size,
            self.config.clone(),
            stop.clone(),
        ));

        let (sender, receiver) = mpsc::channel(look_ahead);
        let producer = Producer::new(fetcher, plan, parallelism, sender, stop.clone());
        let handle = self.tasks.spawn(producer.run());

        let closer = Closer::new(
            ticket,
            Arc::clone(&self.registry),
            stop,
            handle,
            self.config.producer_grace,
            self.tasks.clone(),
        );
        let consumer = Consumer::new(
            id.clone(),
            receiver,
            plan,
            Arc::clone(&self.registry),
            downstream,
            closer,
        );

        OpenedStream {
            id,
            bytes: consumer.into_stream(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::StreamExt;

    use super::*;
    use crate::config::TelefluxConfig;
    use crate::protocol::{
        AuthKey, DcId, ExportedAuthorization, FileKind, MediaSession, ProtocolClient,
        ProtocolError, SessionOptions,
    };
    use crate::registry::{StreamStatus, TracingStatsSink};

    const HOME: DcId = DcId(2);

    struct MemorySession {
        data: Bytes,
        stall: bool,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MediaSession for MemorySession {
        fn dc_id(&self) -> DcId {
            HOME
        }

        async fn import_authorization(
            &self,
            _exported: ExportedAuthorization,
        ) -> Result<(), ProtocolError> {
            Ok(())
        }

        async fn fetch_range(
            &self,
            _locator: &FileLocator,
            offset: u64,
            limit: usize,
        ) -> Result<Bytes, ProtocolError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.stall {
                std::future::pending::<()>().await;
            }
            let start = (offset as usize).min(self.data.len());
            let end = (start + limit).min(self.data.len());
            Ok(self.data.slice(start..end))
        }
    }

    struct MemoryClient {
        data: Bytes,
        stall: bool,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProtocolClient for MemoryClient {
        async fn home_dc(&self) -> Result<DcId, ProtocolError> {
            Ok(HOME)
        }

        async fn resolve_message(
            &self,
            _message: MessageRef,
        ) -> Result<Option<FileLocator>, ProtocolError> {
            Ok(Some(locator(self.data.len() as u64)))
        }

        async fn home_auth_key(&self) -> Result<AuthKey, ProtocolError> {
            Ok(AuthKey(Bytes::from_static(b"home")))
        }

        async fn create_auth_key(&self, _dc: DcId) -> Result<AuthKey, ProtocolError> {
            Ok(AuthKey(Bytes::from_static(b"fresh")))
        }

        async fn export_authorization(
            &self,
            _dc: DcId,
        ) -> Result<ExportedAuthorization, ProtocolError> {
            Ok(ExportedAuthorization {
                id: 1,
                bytes: Bytes::new(),
            })
        }

        async fn start_session(
            &self,
            _dc: DcId,
            _auth_key: AuthKey,
            _options: SessionOptions,
        ) -> Result<Arc<dyn MediaSession>, ProtocolError> {
            Ok(Arc::new(MemorySession {
                data: self.data.clone(),
                stall: self.stall,
                fetches: Arc::clone(&self.fetches),
            }))
        }
    }

    fn locator(size: u64) -> FileLocator {
        FileLocator {
            kind: FileKind::Document,
            media_id: 1,
            access_hash: 2,
            file_reference: Bytes::from_static(b"ref"),
            thumb_size: String::new(),
            dc_id: HOME,
            file_size: size,
        }
    }

    struct Fixture {
        pipeline: StreamPipeline,
        pool: Arc<ClientPool>,
        registry: Arc<StreamRegistry>,
        fetches: Arc<AtomicUsize>,
    }

    fn fixture(data: Bytes, stall: bool) -> Fixture {
        let config = TelefluxConfig::for_testing();
        let fetches = Arc::new(AtomicUsize::new(0));
        let client: Arc<dyn ProtocolClient> = Arc::new(MemoryClient {
            data,
            stall,
            fetches: Arc::clone(&fetches),
        });
        let pool = Arc::new(ClientPool::new(vec![client], &config));
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let registry = Arc::new(StreamRegistry::new(
            config.streaming.clone(),
            Arc::new(TracingStatsSink),
            tasks.clone(),
            shutdown.clone(),
        ));
        let pipeline = StreamPipeline::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            config.streaming,
            tasks,
            shutdown,
        );
        Fixture {
            pipeline,
            pool,
            registry,
            fetches,
        }
    }

    fn request(fixture: &Fixture, plan: RangePlan, downstream: CancellationToken) -> StreamRequest {
        let bot = Arc::clone(&fixture.pool.bots()[0]);
        StreamRequest {
            message: MessageRef::new(-100, 1),
            locator: locator(0),
            bot,
            plan,
            look_ahead: 3,
            parallelism: 2,
            downstream,
            meta: BTreeMap::new(),
        }
    }

    async fn collect(mut bytes: ByteStream) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::new();
        while let Some(piece) = bytes.next().await {
            out.extend_from_slice(&piece?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_stream_returns_exact_range() {
        let data: Bytes = (0..10_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
        let fixture = fixture(data.clone(), false);
        let plan = RangePlan::new(700, 8_123, 1_024).unwrap();

        let opened = fixture
            .pipeline
            .open_stream(request(&fixture, plan, CancellationToken::new()));
        let body = collect(opened.bytes).await.unwrap();

        assert_eq!(body.as_slice(), &data[700..=8_123]);
        let state = fixture.registry.stream(&opened.id).unwrap();
        assert_eq!(state.status, StreamStatus::Finished);
        assert_eq!(fixture.pool.bots()[0].health().workload(), 0);
    }

    #[tokio::test]
    async fn test_zero_part_stream_ends_immediately() {
        let fixture = fixture(Bytes::from_static(b"unused"), false);

        let opened = fixture.pipeline.open_stream(request(
            &fixture,
            RangePlan::empty(1_024),
            CancellationToken::new(),
        ));
        let body = collect(opened.bytes).await.unwrap();

        assert!(body.is_empty());
        assert_eq!(fixture.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stalled_chunk_exhausts_attempts() {
        let fixture = fixture(Bytes::from_static(&[0u8; 4096]), true);
        let plan = RangePlan::new(0, 4095, 1_024).unwrap();

        let opened = fixture
            .pipeline
            .open_stream(request(&fixture, plan, CancellationToken::new()));
        let result = collect(opened.bytes).await;

        assert!(matches!(
            result,
            Err(StreamError::ChunkExhausted { attempts: 6, .. })
        ));
        let state = fixture.registry.stream(&opened.id).unwrap();
        assert_eq!(state.status, StreamStatus::Error);
        assert!(fixture.pool.bots()[0].health().failures() >= 6);
    }

    #[tokio::test]
    async fn test_cancelled_downstream_marks_stream_cancelled() {
        let data = Bytes::from(vec![5u8; 64 * 1024]);
        let fixture = fixture(data, false);
        let plan = RangePlan::new(0, 64 * 1024 - 1, 1_024).unwrap();
        let downstream = CancellationToken::new();

        let mut opened = fixture
            .pipeline
            .open_stream(request(&fixture, plan, downstream.clone()));
        let first = opened.bytes.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1_024);

        downstream.cancel();
        assert!(opened.bytes.next().await.is_none());

        let state = fixture.registry.stream(&opened.id).unwrap();
        assert_eq!(state.status, StreamStatus::Cancelled);
        assert_eq!(state.total_bytes, 1_024);
    }
}
