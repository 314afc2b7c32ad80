//! Mock bot client and media sessions over a [`MediaStore`].
//!
//! Each mock bot hands out locators whose reference token is bound to that
//! bot, and its sessions reject tokens minted by another bot, so sharing a
//! locator across bots fails the same way it does against the real network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use teleflux_core::protocol::{
    AuthKey, DcId, ExportedAuthorization, FileKind, FileLocator, MediaSession, MessageRef,
    ProtocolClient, ProtocolError, SessionOptions,
};
use tracing::trace;

use crate::store::MediaStore;

/// How a mock bot answers range fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchBehavior {
    /// Every fetch succeeds after the configured delay.
    Healthy,
    /// Fetches never complete; callers must time out.
    Hang,
    /// Every fetch fails with a transport error.
    TransportErrors,
    /// The first `n` fetches fail with a transport error.
    FailFirst(usize),
}

/// Call counters for one mock bot.
#[derive(Debug, Default)]
pub struct BotStats {
    fetches: AtomicUsize,
    failed_fetches: AtomicUsize,
    resolves: AtomicUsize,
    sessions_started: AtomicUsize,
    imports: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    completed: Mutex<Vec<u64>>,
}

impl BotStats {
    /// Range fetches issued, including failed ones.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn failed_fetches(&self) -> usize {
        self.failed_fetches.load(Ordering::SeqCst)
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn sessions_started(&self) -> usize {
        self.sessions_started.load(Ordering::SeqCst)
    }

    pub fn imports(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    /// Offsets of successful fetches, in the order they completed.
    pub fn completion_order(&self) -> Vec<u64> {
        self.completed.lock().clone()
    }

    /// Fetches running right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of fetches that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter when a fetch finishes or is dropped.
struct InFlight<'a>(&'a BotStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a BotStats) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct BotInner {
    name: String,
    home_dc: DcId,
    store: Arc<MediaStore>,
    latency: Duration,
    jitter: Duration,
    bytes_per_sec: Option<u64>,
    slow_offsets: HashMap<u64, Duration>,
    fetch: FetchBehavior,
    fail_resolve: bool,
    auth_bytes_failures: usize,
    rng: Mutex<ChaCha8Rng>,
    stats: Arc<BotStats>,
}

impl BotInner {
    fn reference_token(&self, media_id: i64) -> Bytes {
        Bytes::from(format!("{}:{media_id}", self.name))
    }

    fn fetch_delay(&self, offset: u64, len: usize) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.lock().random_range(0..=jitter_ms))
        };
        let transfer = self.bytes_per_sec.map_or(Duration::ZERO, |rate| {
            Duration::from_secs_f64(len as f64 / rate.max(1) as f64)
        });
        let slowdown = self.slow_offsets.get(&offset).copied().unwrap_or_default();
        self.latency + jitter + transfer + slowdown
    }
}

/// Simulated bot implementing [`ProtocolClient`].
#[derive(Clone)]
pub struct MockBot {
    inner: Arc<BotInner>,
}

impl MockBot {
    pub fn builder(name: impl Into<String>) -> MockBotBuilder {
        MockBotBuilder::new(name.into())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn stats(&self) -> &Arc<BotStats> {
        &self.inner.stats
    }
}

#[async_trait]
impl ProtocolClient for MockBot {
    async fn home_dc(&self) -> Result<DcId, ProtocolError> {
        Ok(self.inner.home_dc)
    }

    async fn resolve_message(
        &self,
        message: MessageRef,
    ) -> Result<Option<FileLocator>, ProtocolError> {
        self.inner.stats.resolves.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_resolve {
            return Err(ProtocolError::Rpc {
                code: 400,
                message: "CHANNEL_PRIVATE".to_string(),
            });
        }

        Ok(self.inner.store.file(&message).map(|file| FileLocator {
            kind: FileKind::Document,
            media_id: file.media_id,
            access_hash: file.access_hash,
            file_reference: self.inner.reference_token(file.media_id),
            thumb_size: String::new(),
            dc_id: file.dc_id,
            file_size: file.data.len() as u64,
        }))
    }

    async fn home_auth_key(&self) -> Result<AuthKey, ProtocolError> {
        Ok(AuthKey(Bytes::from(format!("{}:home", self.inner.name))))
    }

    async fn create_auth_key(&self, dc: DcId) -> Result<AuthKey, ProtocolError> {
        Ok(AuthKey(Bytes::from(format!("{}:{}", self.inner.name, dc.0))))
    }

    async fn export_authorization(
        &self,
        dc: DcId,
    ) -> Result<ExportedAuthorization, ProtocolError> {
        Ok(ExportedAuthorization {
            id: i64::from(dc.0),
            bytes: Bytes::from_static(b"exported"),
        })
    }

    async fn start_session(
        &self,
        dc: DcId,
        _auth_key: AuthKey,
        _options: SessionOptions,
    ) -> Result<Arc<dyn MediaSession>, ProtocolError> {
        self.inner.stats.sessions_started.fetch_add(1, Ordering::SeqCst);
        trace!(bot = %self.inner.name, %dc, "Mock session started");
        Ok(Arc::new(MockSession {
            bot: Arc::clone(&self.inner),
            dc,
            authorized: AtomicBool::new(dc == self.inner.home_dc),
        }))
    }
}

/// Simulated media session of one [`MockBot`].
pub struct MockSession {
    bot: Arc<BotInner>,
    dc: DcId,
    authorized: AtomicBool,
}

#[async_trait]
impl MediaSession for MockSession {
    fn dc_id(&self) -> DcId {
        self.dc
    }

    async fn import_authorization(
        &self,
        _exported: ExportedAuthorization,
    ) -> Result<(), ProtocolError> {
        let previous = self.bot.stats.imports.fetch_add(1, Ordering::SeqCst);
        if previous < self.bot.auth_bytes_failures {
            return Err(ProtocolError::AuthBytesInvalid);
        }
        self.authorized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_range(
        &self,
        locator: &FileLocator,
        offset: u64,
        limit: usize,
    ) -> Result<Bytes, ProtocolError> {
        let stats = &self.bot.stats;
        let attempt = stats.fetches.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(stats);

        let failure = match self.bot.fetch {
            FetchBehavior::Healthy => None,
            FetchBehavior::Hang => {
                std::future::pending::<()>().await;
                None
            }
            FetchBehavior::TransportErrors => Some("connection reset"),
            FetchBehavior::FailFirst(n) => (attempt < n).then_some("connection reset"),
        };
        if let Some(reason) = failure {
            stats.failed_fetches.fetch_add(1, Ordering::SeqCst);
            return Err(ProtocolError::Transport {
                reason: reason.to_string(),
            });
        }

        if locator.dc_id != self.dc {
            return Err(rpc(303, "FILE_MIGRATE"));
        }
        if !self.authorized.load(Ordering::SeqCst) {
            return Err(rpc(401, "AUTH_KEY_UNREGISTERED"));
        }
        if locator.file_reference != self.bot.reference_token(locator.media_id) {
            return Err(rpc(400, "FILE_REFERENCE_EXPIRED"));
        }

        tokio::time::sleep(self.bot.fetch_delay(offset, limit)).await;

        let bytes = self
            .bot
            .store
            .read(locator.media_id, offset, limit)
            .ok_or_else(|| rpc(400, "MEDIA_EMPTY"))?;
        stats.completed.lock().push(offset);
        Ok(bytes)
    }
}

fn rpc(code: i32, message: &str) -> ProtocolError {
    ProtocolError::Rpc {
        code,
        message: message.to_string(),
    }
}

/// Builder for configuring mock bot behavior.
pub struct MockBotBuilder {
    name: String,
    home_dc: DcId,
    latency: Duration,
    jitter: Duration,
    seed: u64,
    bytes_per_sec: Option<u64>,
    slow_offsets: HashMap<u64, Duration>,
    fetch: FetchBehavior,
    fail_resolve: bool,
    auth_bytes_failures: usize,
}

impl MockBotBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            home_dc: DcId(2),
            latency: Duration::from_millis(1),
            jitter: Duration::ZERO,
            seed: 0,
            bytes_per_sec: None,
            slow_offsets: HashMap::new(),
            fetch: FetchBehavior::Healthy,
            fail_resolve: false,
            auth_bytes_failures: 0,
        }
    }

    pub fn home_dc(mut self, dc: DcId) -> Self {
        self.home_dc = dc;
        self
    }

    /// Fixed delay added to every successful fetch.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Random extra delay up to `jitter`, drawn from a seeded generator so
    /// completion order is shuffled reproducibly.
    pub fn jitter(mut self, jitter: Duration, seed: u64) -> Self {
        self.jitter = jitter;
        self.seed = seed;
        self
    }

    /// Caps simulated transfer speed.
    pub fn bandwidth(mut self, bytes_per_sec: u64) -> Self {
        self.bytes_per_sec = Some(bytes_per_sec);
        self
    }

    /// Adds `delay` to every fetch starting at `offset`.
    pub fn slow_offset(mut self, offset: u64, delay: Duration) -> Self {
        self.slow_offsets.insert(offset, delay);
        self
    }

    pub fn fetch_behavior(mut self, behavior: FetchBehavior) -> Self {
        self.fetch = behavior;
        self
    }

    /// Makes every message lookup fail with an RPC error.
    pub fn fail_resolve(mut self) -> Self {
        self.fail_resolve = true;
        self
    }

    /// Rejects the first `n` authorization imports as invalid bytes.
    pub fn auth_bytes_failures(mut self, n: usize) -> Self {
        self.auth_bytes_failures = n;
        self
    }

    pub fn build(self, store: Arc<MediaStore>) -> MockBot {
        MockBot {
            inner: Arc::new(BotInner {
                name: self.name,
                home_dc: self.home_dc,
                store,
                latency: self.latency,
                jitter: self.jitter,
                bytes_per_sec: self.bytes_per_sec,
                slow_offsets: self.slow_offsets,
                fetch: self.fetch,
                fail_resolve: self.fail_resolve,
                auth_bytes_failures: self.auth_bytes_failures,
                rng: Mutex::new(ChaCha8Rng::seed_from_u64(self.seed)),
                stats: Arc::new(BotStats::default()),
            }),
        }
    }
}
