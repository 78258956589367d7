//! Configuration surface for the relay core.
//!
//! [`RelayConfig`] groups one config struct per subsystem. Every struct has
//! a `Default` carrying the documented production defaults and `with_*`
//! builder methods for selective overrides.

use crate::keypool::KeyStrategy;
use crate::retry::RetryPolicy;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Health checker settings. See the `health` module for semantics.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// How often the full channel sweep runs. Default: 5 minutes.
    pub interval: Duration,
    /// Per-probe HTTP timeout. Default: 10 seconds.
    pub timeout: Duration,
    /// Probe attempts per check before the check counts as failed.
    /// Default: 2.
    pub max_retries: u32,
    /// Success rate at or above which a channel is HEALTHY. Default: 0.95.
    pub healthy_threshold: f64,
    /// Success rate at or above which a channel is DEGRADED. Default: 0.50.
    pub degraded_threshold: f64,
    /// Consecutive failed checks that force UNAVAILABLE and enter
    /// recovery mode. Default: 3.
    pub max_consecutive_failures: u32,
    /// Check interval while a channel is in recovery mode. Default: 1 minute.
    pub recovery_interval: Duration,
    /// Probe path appended to the channel base URL (e.g. `"/v1/models"`).
    /// When unset, health derives from the running success rate alone.
    pub endpoint: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            timeout: Duration::from_secs(10),
            max_retries: 2,
            healthy_threshold: 0.95,
            degraded_threshold: 0.50,
            max_consecutive_failures: 3,
            recovery_interval: Duration::from_secs(60),
            endpoint: None,
        }
    }
}

impl HealthCheckConfig {
    /// Set the sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the probe endpoint path.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the per-probe timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Load balancer and circuit breaker settings.
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    /// Selection strategy name; parsed by the balancer. Default:
    /// `"round_robin"`.
    pub strategy: String,
    /// Consider channel status when filtering candidates. Default: true.
    pub enable_health_check: bool,
    /// Exclude channels whose breaker denies traffic. Default: true.
    pub enable_circuit_breaker: bool,
    /// Failures in CLOSED before the breaker opens. Default: 5.
    pub breaker_failure_threshold: u32,
    /// Successes in HALF_OPEN before the breaker closes. Default: 2.
    pub breaker_success_threshold: u32,
    /// How long an OPEN breaker refuses traffic before admitting a
    /// trial request. Default: 30 seconds.
    pub breaker_timeout: Duration,
    /// Selection retries the request client performs. Default: 3.
    pub max_retries: u32,
    /// Base delay between selection retries. Default: 1 second.
    pub retry_interval: Duration,
    /// Run the periodic weight adjustment loop. Default: false.
    pub enable_adaptive_weight: bool,
    /// How often adaptive weights are recomputed. Default: 1 minute.
    pub weight_adjust_interval: Duration,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: "round_robin".to_string(),
            enable_health_check: true,
            enable_circuit_breaker: true,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            enable_adaptive_weight: false,
            weight_adjust_interval: Duration::from_secs(60),
        }
    }
}

impl LoadBalancerConfig {
    /// Set the strategy name.
    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    /// Enable the adaptive weight loop.
    pub fn with_adaptive_weight(mut self, interval: Duration) -> Self {
        self.enable_adaptive_weight = true;
        self.weight_adjust_interval = interval;
        self
    }
}

/// Storage tier for the body cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Everything in memory.
    Memory,
    /// Everything on disk.
    Disk,
    /// Memory below [`BodyCacheConfig::memory_threshold`], disk above.
    Hybrid,
}

/// Body cache settings.
#[derive(Debug, Clone)]
pub struct BodyCacheConfig {
    /// Storage tier. Default: hybrid.
    pub mode: CacheMode,
    /// Bodies up to this many bytes stay in memory under hybrid mode.
    /// Default: 256 KiB.
    pub memory_threshold: u64,
    /// Directory for disk entries. Default: `./body-cache`.
    pub disk_path: PathBuf,
    /// Ceiling on total cached bytes across both tiers. Default: 512 MiB.
    pub max_cache_size: u64,
    /// Entry time-to-live. Default: 24 hours.
    pub max_cache_duration: Duration,
    /// How often the background cleaner runs. Default: 5 minutes.
    pub cleanup_interval: Duration,
}

impl Default for BodyCacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Hybrid,
            memory_threshold: 256 * 1024,
            disk_path: PathBuf::from("./body-cache"),
            max_cache_size: 512 * 1024 * 1024,
            max_cache_duration: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl BodyCacheConfig {
    /// Use memory-only storage.
    pub fn memory_only() -> Self {
        Self {
            mode: CacheMode::Memory,
            ..Self::default()
        }
    }

    /// Set the storage mode.
    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the disk directory.
    pub fn with_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_path = path.into();
        self
    }

    /// Set the hybrid memory/disk byte threshold.
    pub fn with_memory_threshold(mut self, bytes: u64) -> Self {
        self.memory_threshold = bytes;
        self
    }

    /// Set the total size ceiling.
    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    /// Set the entry TTL.
    pub fn with_max_cache_duration(mut self, ttl: Duration) -> Self {
        self.max_cache_duration = ttl;
        self
    }
}

/// SSE fan-out settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Close a client that received nothing for this long. Default: 5 minutes.
    pub client_timeout: Duration,
    /// Close a session idle for this long. Default: 10 minutes.
    pub session_timeout: Duration,
    /// Interval between `: heartbeat` comment frames. Default: 15 seconds.
    pub heartbeat_interval: Duration,
    /// Maximum clients per session. Default: 64.
    pub max_clients: usize,
    /// Bounded per-client message buffer. Default: 64.
    pub buffer_size: usize,
    /// How often the idle sweeper runs. Default: 30 seconds.
    pub sweep_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            client_timeout: Duration::from_secs(300),
            session_timeout: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(15),
            max_clients: 64,
            buffer_size: 64,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl StreamConfig {
    /// Set the client idle timeout.
    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    /// Set the session idle timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the per-client buffer capacity.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

/// Key pool settings: one selection strategy per channel type, with a
/// fallback default.
#[derive(Debug, Clone)]
pub struct KeyPoolConfig {
    /// Strategy used when a channel type has no explicit entry.
    pub default_strategy: KeyStrategy,
    /// Per-channel-type strategy overrides.
    pub per_type: HashMap<String, KeyStrategy>,
}

impl Default for KeyPoolConfig {
    fn default() -> Self {
        Self {
            default_strategy: KeyStrategy::RoundRobin,
            per_type: HashMap::new(),
        }
    }
}

impl KeyPoolConfig {
    /// Set the fallback strategy.
    pub fn with_default_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Set the strategy for one channel type.
    pub fn with_type_strategy(mut self, channel_type: impl Into<String>, strategy: KeyStrategy) -> Self {
        self.per_type.insert(channel_type.into(), strategy);
        self
    }

    /// The strategy to use for `channel_type`.
    pub fn strategy_for(&self, channel_type: &str) -> KeyStrategy {
        self.per_type
            .get(channel_type)
            .copied()
            .unwrap_or(self.default_strategy)
    }
}

/// Top-level configuration for the relay core.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How often the channel set is re-pulled from the configured
    /// source. Default: 5 minutes.
    pub channel_refresh_interval: Duration,
    /// Health checker settings.
    pub health_check: HealthCheckConfig,
    /// Load balancer and breaker settings.
    pub load_balancer: LoadBalancerConfig,
    /// Body cache settings.
    pub body_cache: BodyCacheConfig,
    /// SSE fan-out settings.
    pub stream: StreamConfig,
    /// Retry policy for the request client.
    pub retry: RetryPolicy,
    /// Key pool settings.
    pub key_pool: KeyPoolConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_refresh_interval: Duration::from_secs(300),
            health_check: HealthCheckConfig::default(),
            load_balancer: LoadBalancerConfig::default(),
            body_cache: BodyCacheConfig::default(),
            stream: StreamConfig::default(),
            retry: RetryPolicy::default(),
            key_pool: KeyPoolConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Set the channel refresh cadence.
    pub fn with_channel_refresh_interval(mut self, interval: Duration) -> Self {
        self.channel_refresh_interval = interval;
        self
    }

    /// Replace the health checker settings.
    pub fn with_health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = config;
        self
    }

    /// Replace the load balancer settings.
    pub fn with_load_balancer(mut self, config: LoadBalancerConfig) -> Self {
        self.load_balancer = config;
        self
    }

    /// Replace the body cache settings.
    pub fn with_body_cache(mut self, config: BodyCacheConfig) -> Self {
        self.body_cache = config;
        self
    }

    /// Replace the stream settings.
    pub fn with_stream(mut self, config: StreamConfig) -> Self {
        self.stream = config;
        self
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Replace the key pool settings.
    pub fn with_key_pool(mut self, config: KeyPoolConfig) -> Self {
        self.key_pool = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_defaults() {
        let config = HealthCheckConfig::default();
        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.healthy_threshold, 0.95);
        assert_eq!(config.degraded_threshold, 0.50);
        assert!(config.endpoint.is_none());
    }

    #[test]
    fn test_body_cache_defaults() {
        let config = BodyCacheConfig::default();
        assert_eq!(config.mode, CacheMode::Hybrid);
        assert_eq!(config.max_cache_duration, Duration::from_secs(86400));
        assert_eq!(config.memory_threshold, 256 * 1024);
    }

    #[test]
    fn test_stream_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.buffer_size, 64);
    }

    #[test]
    fn test_key_pool_per_type_override() {
        let config = KeyPoolConfig::default()
            .with_default_strategy(KeyStrategy::Random)
            .with_type_strategy("openai", KeyStrategy::FailureAwareWeighted);

        assert_eq!(config.strategy_for("openai"), KeyStrategy::FailureAwareWeighted);
        assert_eq!(config.strategy_for("anthropic"), KeyStrategy::Random);
    }

    #[test]
    fn test_relay_config_builders() {
        let config = RelayConfig::default()
            .with_body_cache(BodyCacheConfig::memory_only())
            .with_stream(StreamConfig::default().with_buffer_size(8));

        assert_eq!(config.body_cache.mode, CacheMode::Memory);
        assert_eq!(config.stream.buffer_size, 8);
    }
}
