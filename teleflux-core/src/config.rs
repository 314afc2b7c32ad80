//! Centralized configuration for Teleflux.
//!
//! Every timeout, retry bound, and pipeline depth used by the engine lives
//! here so that tests can scale the whole system down to milliseconds.

use std::time::Duration;

use crate::protocol::DcId;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Central configuration for all Teleflux components.
#[derive(Debug, Clone, Default)]
pub struct TelefluxConfig {
    pub streaming: StreamingConfig,
    pub session: SessionConfig,
    pub cache: CacheConfig,
    pub speed_test: SpeedTestConfig,
}

/// Chunk fetch pipeline and stream registry settings.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Chunks allowed to wait in the delivery queue
    pub look_ahead: usize,
    /// Concurrently in-flight chunk fetches per stream
    pub parallelism: usize,
    /// Hard timeout for a single range fetch
    pub fetch_timeout: Duration,
    /// Total attempts per chunk before the stream is aborted
    pub max_attempts: u32,
    /// Failed attempts on the owning bot before switching to a fallback bot
    pub fallback_after: u32,
    /// First backoff delay, doubled on each further attempt
    pub backoff_base: Duration,
    /// Upper bound on the backoff delay
    pub backoff_cap: Duration,
    /// Time given to the producer to wind down after the consumer stops
    pub producer_grace: Duration,
    /// Delay before a finished stream leaves the live table
    pub eviction_delay: Duration,
    /// Capacity of the recent-history ring
    pub recent_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            look_ahead: 3,
            parallelism: 2,
            fetch_timeout: Duration::from_secs(15),
            max_attempts: 6,
            fallback_after: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(10),
            producer_grace: Duration::from_secs(2),
            eviction_delay: Duration::from_secs(3),
            recent_capacity: 3,
        }
    }
}

impl StreamingConfig {
    /// Backoff before the next attempt, `base * 2^(attempt - 1)` capped.
    ///
    /// `attempt` is the number of attempts made so far (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_cap, |delay| delay.min(self.backoff_cap))
    }
}

/// Media session establishment settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Export/import attempts for cross-datacenter authorization
    pub handshake_attempts: u32,
    /// Wait after an invalid-auth-bytes rejection
    pub auth_bytes_retry: Duration,
    /// Wait after a transport error during the handshake
    pub transport_retry: Duration,
    /// Per-call timeout configured on new sessions
    pub call_timeout: Duration,
    /// Idle threshold configured on new sessions
    pub sleep_threshold: Duration,
    /// Datacenters opened opportunistically at bot startup
    pub prewarm_dcs: Vec<DcId>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_attempts: 6,
            auth_bytes_retry: Duration::from_millis(500),
            transport_retry: Duration::from_secs(1),
            call_timeout: Duration::from_secs(30),
            sleep_threshold: Duration::from_secs(60),
            prewarm_dcs: vec![DcId(1), DcId(2), DcId(4), DcId(5)],
        }
    }
}

/// File locator cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Interval at which every bot's locator cache is fully cleared
    pub clear_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            clear_interval: Duration::from_secs(30 * 60),
        }
    }
}

/// On-demand benchmark settings.
#[derive(Debug, Clone)]
pub struct SpeedTestConfig {
    /// Bytes downloaded per bot
    pub window_bytes: u64,
    /// Size of each benchmark request
    pub chunk_size: usize,
    /// Concurrent workers per bot
    pub workers: usize,
    /// Size of the time-to-first-byte probe
    pub probe_size: usize,
    /// Minimum spacing between progress events
    pub progress_interval: Duration,
    /// Timeout for a single benchmark request
    pub fetch_timeout: Duration,
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        Self {
            window_bytes: 100 * MIB as u64,
            chunk_size: 512 * KIB,
            workers: 8,
            probe_size: 4 * KIB,
            progress_interval: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(15),
        }
    }
}

impl TelefluxConfig {
    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(look_ahead) = env_parse::<usize>("TELEFLUX_LOOK_AHEAD") {
            config.streaming.look_ahead = look_ahead.max(1);
        }

        if let Some(parallelism) = env_parse::<usize>("TELEFLUX_PARALLELISM") {
            config.streaming.parallelism = parallelism.max(1);
        }

        if let Some(seconds) = env_parse::<u64>("TELEFLUX_FETCH_TIMEOUT") {
            config.streaming.fetch_timeout = Duration::from_secs(seconds);
        }

        if let Some(minutes) = env_parse::<u64>("TELEFLUX_CACHE_CLEAR_MINUTES") {
            config.cache.clear_interval = Duration::from_secs(minutes * 60);
        }

        if let Ok(dcs) = std::env::var("TELEFLUX_PREWARM_DCS") {
            config.session.prewarm_dcs = parse_dc_list(&dcs);
        }

        config
    }

    /// Creates a configuration with every delay scaled down for tests.
    pub fn for_testing() -> Self {
        Self {
            streaming: StreamingConfig {
                fetch_timeout: Duration::from_millis(50),
                backoff_base: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(10),
                producer_grace: Duration::from_millis(50),
                eviction_delay: Duration::from_millis(20),
                ..StreamingConfig::default()
            },
            session: SessionConfig {
                auth_bytes_retry: Duration::from_millis(1),
                transport_retry: Duration::from_millis(2),
                ..SessionConfig::default()
            },
            cache: CacheConfig::default(),
            speed_test: SpeedTestConfig {
                window_bytes: 4 * MIB as u64,
                chunk_size: 64 * KIB,
                workers: 4,
                probe_size: 4 * KIB,
                progress_interval: Duration::from_millis(5),
                fetch_timeout: Duration::from_millis(50),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn parse_dc_list(raw: &str) -> Vec<DcId> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<i32>().ok())
        .map(DcId)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = TelefluxConfig::default();

        assert_eq!(config.streaming.look_ahead, 3);
        assert_eq!(config.streaming.parallelism, 2);
        assert_eq!(config.streaming.fetch_timeout, Duration::from_secs(15));
        assert_eq!(config.streaming.max_attempts, 6);
        assert_eq!(config.session.handshake_attempts, 6);
        assert_eq!(config.cache.clear_interval, Duration::from_secs(1800));
        assert_eq!(config.speed_test.window_bytes, 100 * 1024 * 1024);
        assert_eq!(config.speed_test.workers, 8);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let streaming = StreamingConfig::default();

        assert_eq!(streaming.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(streaming.backoff_delay(2), Duration::from_secs(1));
        assert_eq!(streaming.backoff_delay(4), Duration::from_secs(4));
        assert_eq!(streaming.backoff_delay(5), Duration::from_secs(8));
        assert_eq!(streaming.backoff_delay(6), Duration::from_secs(10));
        assert_eq!(streaming.backoff_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_dc_list_skips_garbage() {
        assert_eq!(parse_dc_list("1, 2,x,5"), vec![DcId(1), DcId(2), DcId(5)]);
        assert!(parse_dc_list("").is_empty());
    }

    #[test]
    fn test_testing_preset_keeps_retry_counts() {
        let config = TelefluxConfig::for_testing();
        assert_eq!(config.streaming.max_attempts, 6);
        assert_eq!(config.streaming.fallback_after, 3);
        assert!(config.streaming.fetch_timeout < Duration::from_secs(1));
    }
}
