//! Channel model: identity, routing attributes, keys, abilities, and
//! lock-free metrics.
//!
//! A [`Channel`] is one upstream provider endpoint. Identity and routing
//! attributes are immutable after construction; metrics, status, weight,
//! and the enabled flag are mutated concurrently by the request path and
//! therefore live in atomics. Channels are always shared as
//! `Arc<Channel>` and never cloned.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Health status of a channel.
///
/// `Disabled` is derived from the enabled flag and wins over the stored
/// value; the other three are stored atomically and swapped by the health
/// checker and the request client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// Success rate at or above the healthy threshold.
    Healthy,
    /// Success rate between the degraded and healthy thresholds.
    Degraded,
    /// Success rate below the degraded threshold, or forced by
    /// consecutive failures.
    Unavailable,
    /// The channel's enabled flag is off.
    Disabled,
}

impl ChannelStatus {
    /// Short label for logs and stats output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Healthy => "healthy",
            ChannelStatus::Degraded => "degraded",
            ChannelStatus::Unavailable => "unavailable",
            ChannelStatus::Disabled => "disabled",
        }
    }

    fn from_u8(v: u8) -> ChannelStatus {
        match v {
            1 => ChannelStatus::Degraded,
            2 => ChannelStatus::Unavailable,
            _ => ChannelStatus::Healthy,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ChannelStatus::Healthy => 0,
            ChannelStatus::Degraded => 1,
            ChannelStatus::Unavailable => 2,
            // Never stored; derived from the enabled flag.
            ChannelStatus::Disabled => 0,
        }
    }
}

/// One API key attached to a channel.
///
/// A key is *valid* iff it is enabled, not expired, and under its quota
/// limit (when one is set). Invalid keys stay in the collection and are
/// filtered at selection time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelKey {
    /// Stable key identifier (not the secret).
    pub id: String,
    /// The credential sent as a bearer token.
    pub secret: String,
    /// Key class (mirrors the channel type, e.g. `"openai"`).
    pub key_type: String,
    /// Whether the key participates in rotation.
    pub enabled: bool,
    /// Creation timestamp.
    pub created_at: SystemTime,
    /// Optional hard expiry.
    pub expires_at: Option<SystemTime>,
    /// Requests issued with this key.
    pub usage_count: u64,
    /// Optional quota ceiling in provider units.
    pub quota_limit: Option<u64>,
    /// Consumed quota in provider units.
    pub current_usage: u64,
}

impl ChannelKey {
    /// Create an enabled key with no expiry or quota limit.
    pub fn new(id: impl Into<String>, secret: impl Into<String>, key_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            key_type: key_type.into(),
            enabled: true,
            created_at: SystemTime::now(),
            expires_at: None,
            usage_count: 0,
            quota_limit: None,
            current_usage: 0,
        }
    }

    /// Whether the key may be used right now.
    pub fn is_valid(&self) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(expires) = self.expires_at {
            if SystemTime::now() >= expires {
                return false;
            }
        }
        match self.quota_limit {
            Some(limit) => self.current_usage < limit,
            None => true,
        }
    }
}

/// Named feature flags a channel supports, stamped with a version.
///
/// A channel may register several versions; the latest registered one is
/// the default answer of [`Channel::abilities`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAbilities {
    /// Version string this ability set describes (e.g. `"2024-06-01"`).
    pub version: String,
    /// Server-sent event streaming.
    pub streaming: bool,
    /// Tool / function calling.
    pub function_calling: bool,
    /// Image inputs.
    pub vision: bool,
    /// File upload endpoints.
    pub file_upload: bool,
    /// Structured JSON output mode.
    pub json_mode: bool,
    /// Dedicated system-prompt slot.
    pub system_prompt: bool,
    /// Temperature parameter.
    pub temperature: bool,
    /// Max-tokens parameter.
    pub max_tokens: bool,
    /// Context window in tokens.
    pub context_window: u32,
    /// Parallel function calls.
    pub parallel_functions: bool,
}

impl Default for ChannelAbilities {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            streaming: true,
            function_calling: false,
            vision: false,
            file_upload: false,
            json_mode: false,
            system_prompt: true,
            temperature: true,
            max_tokens: true,
            context_window: 8192,
            parallel_functions: false,
        }
    }
}

/// Lock-free per-channel counters.
///
/// All counters are monotonic under atomic add/load. The running mean
/// latency is a CAS loop over f64 bits; readers may observe a slightly
/// stale value, which is acceptable for a monitoring-only figure.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    consecutive_failures: AtomicU32,
    current_concurrency: AtomicI64,
    last_success_ms: AtomicU64,
    last_failure_ms: AtomicU64,
    avg_latency_bits: AtomicU64,
}

pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl ChannelMetrics {
    /// Count a request entering flight: bumps the total and concurrency.
    pub fn begin_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.current_concurrency.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo [`begin_request`](Self::begin_request) for a request that was
    /// aborted before reaching the upstream (cancellation mid-connect).
    pub fn abort_request(&self) {
        self.total_requests.fetch_sub(1, Ordering::Relaxed);
        self.current_concurrency.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a successful terminal outcome and fold the latency sample
    /// into the running mean.
    pub fn record_success(&self, latency: Duration) {
        let n = self.successful_requests.fetch_add(1, Ordering::Relaxed) + 1;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.current_concurrency.fetch_sub(1, Ordering::Relaxed);
        self.last_success_ms.store(unix_ms(), Ordering::Relaxed);

        let sample = latency.as_secs_f64() * 1000.0;
        loop {
            let bits = self.avg_latency_bits.load(Ordering::Relaxed);
            let old = f64::from_bits(bits);
            let new = old + (sample - old) / n as f64;
            if self
                .avg_latency_bits
                .compare_exchange_weak(bits, new.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Record a failed terminal outcome. Returns the new consecutive
    /// failure count so callers can apply status thresholds.
    pub fn record_failure(&self) -> u32 {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.current_concurrency.fetch_sub(1, Ordering::Relaxed);
        self.last_failure_ms.store(unix_ms(), Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Clear the consecutive-failure counter (operator reset).
    pub fn reset_consecutive_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Requests that have entered flight.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Requests that completed successfully.
    pub fn successful_requests(&self) -> u64 {
        self.successful_requests.load(Ordering::Relaxed)
    }

    /// Requests that completed with a failure.
    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Requests currently in flight.
    pub fn current_concurrency(&self) -> i64 {
        self.current_concurrency.load(Ordering::Relaxed)
    }

    /// Unix-ms timestamp of the last success (0 if none).
    pub fn last_success_ms(&self) -> u64 {
        self.last_success_ms.load(Ordering::Relaxed)
    }

    /// Unix-ms timestamp of the last failure (0 if none).
    pub fn last_failure_ms(&self) -> u64 {
        self.last_failure_ms.load(Ordering::Relaxed)
    }

    /// Running mean latency over successful requests, in milliseconds.
    pub fn avg_latency_ms(&self) -> f64 {
        f64::from_bits(self.avg_latency_bits.load(Ordering::Relaxed))
    }

    /// Fraction of completed requests that succeeded, in `[0, 1]`.
    /// Returns 1.0 before any request has completed.
    pub fn success_rate(&self) -> f64 {
        let ok = self.successful_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let completed = ok + failed;
        if completed == 0 {
            1.0
        } else {
            ok as f64 / completed as f64
        }
    }
}

/// One upstream provider endpoint.
pub struct Channel {
    /// Unique channel id.
    pub id: u64,
    /// Operator-facing name.
    pub name: String,
    /// Upstream base URL; request paths are appended to it.
    pub base_url: String,
    /// Provider class (e.g. `"openai"`, `"anthropic"`, `"gemini"`).
    pub channel_type: String,
    /// Deployment region; empty when unspecified.
    pub region: String,
    /// Selection priority; lower is preferred.
    pub priority: u32,
    /// Models this channel serves; `"*"` matches any model.
    pub supported_models: Vec<String>,
    weight: AtomicU32,
    enabled: AtomicBool,
    status: AtomicU8,
    abilities: RwLock<Vec<ChannelAbilities>>,
    keys: RwLock<Vec<ChannelKey>>,
    /// Request counters for this channel.
    pub metrics: ChannelMetrics,
}

impl Channel {
    /// Create an enabled channel with weight 1, healthy status, default
    /// abilities, and no keys.
    pub fn new(
        id: u64,
        name: impl Into<String>,
        base_url: impl Into<String>,
        channel_type: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            base_url: base_url.into(),
            channel_type: channel_type.into(),
            region: String::new(),
            priority: 0,
            supported_models: Vec::new(),
            weight: AtomicU32::new(1),
            enabled: AtomicBool::new(true),
            status: AtomicU8::new(ChannelStatus::Healthy.as_u8()),
            abilities: RwLock::new(vec![ChannelAbilities::default()]),
            keys: RwLock::new(Vec::new()),
            metrics: ChannelMetrics::default(),
        }
    }

    /// Set the region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Set the selection priority (lower = preferred).
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the load-balancing weight (clamped to at least 1).
    pub fn with_weight(self, weight: u32) -> Self {
        self.weight.store(weight.max(1), Ordering::Relaxed);
        self
    }

    /// Set the supported model list.
    pub fn with_models(mut self, models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.supported_models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Attach a key.
    pub fn with_key(self, key: ChannelKey) -> Self {
        self.keys.write().push(key);
        self
    }

    /// Set the enabled flag at construction.
    pub fn with_enabled(self, enabled: bool) -> Self {
        self.enabled.store(enabled, Ordering::Relaxed);
        self
    }

    /// Current load-balancing weight.
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Replace the weight (adaptive adjustment); clamped to at least 1.
    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight.max(1), Ordering::Relaxed);
    }

    /// Whether the channel participates in selection at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Flip the enabled flag.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Reported status. `Disabled` wins whenever the enabled flag is off,
    /// regardless of the stored value.
    pub fn status(&self) -> ChannelStatus {
        if !self.is_enabled() {
            return ChannelStatus::Disabled;
        }
        ChannelStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    /// Store a new status. `Disabled` is derived, not stored; passing it
    /// here is a no-op.
    pub fn set_status(&self, status: ChannelStatus) {
        if status == ChannelStatus::Disabled {
            return;
        }
        self.status.store(status.as_u8(), Ordering::Relaxed);
    }

    /// Enabled and not marked unavailable.
    pub fn is_available(&self) -> bool {
        self.is_enabled() && self.status() != ChannelStatus::Unavailable
    }

    /// Whether this channel serves `model` (via the wildcard entry or an
    /// exact match).
    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models
            .iter()
            .any(|m| m == "*" || m == model)
    }

    /// Register a version-stamped ability set. The most recently
    /// registered version becomes the default.
    pub fn register_abilities(&self, abilities: ChannelAbilities) {
        let mut guard = self.abilities.write();
        guard.retain(|a| a.version != abilities.version);
        guard.push(abilities);
    }

    /// The latest registered ability set.
    pub fn abilities(&self) -> ChannelAbilities {
        self.abilities
            .read()
            .last()
            .cloned()
            .unwrap_or_default()
    }

    /// The ability set for a specific version, if registered.
    pub fn abilities_for(&self, version: &str) -> Option<ChannelAbilities> {
        self.abilities
            .read()
            .iter()
            .find(|a| a.version == version)
            .cloned()
    }

    /// Snapshot of the attached keys.
    pub fn keys(&self) -> Vec<ChannelKey> {
        self.keys.read().clone()
    }

    /// Add a key at runtime.
    pub fn add_key(&self, key: ChannelKey) {
        self.keys.write().push(key);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.channel_type)
            .field("base_url", &self.base_url)
            .field("status", &self.status())
            .field("weight", &self.weight())
            .finish()
    }
}

/// Predicate used when querying the channel cache.
///
/// A channel matches iff every set field matches and, when
/// `min_availability` is set, its success rate is at or above it.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    /// Restrict to one provider class.
    pub channel_type: Option<String>,
    /// Restrict to channels serving this model.
    pub model: Option<String>,
    /// Restrict to one region.
    pub region: Option<String>,
    /// Restrict to one reported status.
    pub status: Option<ChannelStatus>,
    /// Minimum success rate in `[0, 1]`.
    pub min_availability: Option<f64>,
    /// Skip channels whose enabled flag is off.
    pub only_enabled: bool,
}

impl ChannelFilter {
    /// A filter that matches enabled channels only.
    pub fn enabled() -> Self {
        Self {
            only_enabled: true,
            ..Self::default()
        }
    }

    /// Restrict to one provider class.
    pub fn with_type(mut self, channel_type: impl Into<String>) -> Self {
        self.channel_type = Some(channel_type.into());
        self
    }

    /// Restrict to channels serving `model`.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Restrict to one region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Restrict to one reported status.
    pub fn with_status(mut self, status: ChannelStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Require a minimum success rate in `[0, 1]`.
    pub fn with_min_availability(mut self, rate: f64) -> Self {
        self.min_availability = Some(rate);
        self
    }

    /// Whether `channel` satisfies every set field.
    pub fn matches(&self, channel: &Channel) -> bool {
        if self.only_enabled && !channel.is_enabled() {
            return false;
        }
        if let Some(ref t) = self.channel_type {
            if &channel.channel_type != t {
                return false;
            }
        }
        if let Some(ref m) = self.model {
            if !channel.supports_model(m) {
                return false;
            }
        }
        if let Some(ref r) = self.region {
            if &channel.region != r {
                return false;
            }
        }
        if let Some(status) = self.status {
            if channel.status() != status {
                return false;
            }
        }
        if let Some(min) = self.min_availability {
            if channel.metrics.success_rate() < min {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel() -> Channel {
        Channel::new(1, "primary", "https://api.example.com", "openai")
            .with_region("us-east")
            .with_models(["gpt-4o", "gpt-4o-mini"])
            .with_weight(3)
    }

    #[test]
    fn test_metrics_invariant_holds() {
        let m = ChannelMetrics::default();
        m.begin_request();
        m.begin_request();
        m.record_success(Duration::from_millis(100));
        m.record_failure();

        assert_eq!(m.total_requests(), 2);
        assert_eq!(m.successful_requests(), 1);
        assert_eq!(m.failed_requests(), 1);
        assert!(m.successful_requests() + m.failed_requests() <= m.total_requests());
        assert_eq!(m.current_concurrency(), 0);
    }

    #[test]
    fn test_consecutive_failures_reset_on_success() {
        let m = ChannelMetrics::default();
        m.begin_request();
        assert_eq!(m.record_failure(), 1);
        m.begin_request();
        assert_eq!(m.record_failure(), 2);
        m.begin_request();
        m.record_success(Duration::from_millis(50));
        assert_eq!(m.consecutive_failures(), 0);
    }

    #[test]
    fn test_running_mean_latency() {
        let m = ChannelMetrics::default();
        m.begin_request();
        m.record_success(Duration::from_millis(100));
        m.begin_request();
        m.record_success(Duration::from_millis(200));

        let avg = m.avg_latency_ms();
        assert!((avg - 150.0).abs() < 1e-6, "avg was {}", avg);
    }

    #[test]
    fn test_success_rate_before_traffic_is_one() {
        let m = ChannelMetrics::default();
        assert_eq!(m.success_rate(), 1.0);
    }

    #[test]
    fn test_disabled_status_derived() {
        let ch = test_channel();
        ch.set_status(ChannelStatus::Degraded);
        assert_eq!(ch.status(), ChannelStatus::Degraded);

        ch.set_enabled(false);
        assert_eq!(ch.status(), ChannelStatus::Disabled);

        ch.set_enabled(true);
        assert_eq!(ch.status(), ChannelStatus::Degraded);
    }

    #[test]
    fn test_set_status_ignores_disabled() {
        let ch = test_channel();
        ch.set_status(ChannelStatus::Disabled);
        assert_eq!(ch.status(), ChannelStatus::Healthy);
    }

    #[test]
    fn test_supports_model_wildcard() {
        let ch = Channel::new(2, "any", "https://x", "openai").with_models(["*"]);
        assert!(ch.supports_model("gpt-4o"));
        assert!(ch.supports_model("claude-3-opus"));

        let ch = test_channel();
        assert!(ch.supports_model("gpt-4o"));
        assert!(!ch.supports_model("claude-3-opus"));
    }

    #[test]
    fn test_key_validity() {
        let mut key = ChannelKey::new("k1", "sk-test", "openai");
        assert!(key.is_valid());

        key.enabled = false;
        assert!(!key.is_valid());
        key.enabled = true;

        key.expires_at = Some(SystemTime::now() - Duration::from_secs(1));
        assert!(!key.is_valid());
        key.expires_at = None;

        key.quota_limit = Some(100);
        key.current_usage = 99;
        assert!(key.is_valid());
        key.current_usage = 100;
        assert!(!key.is_valid());
    }

    #[test]
    fn test_abilities_latest_version_wins() {
        let ch = test_channel();
        ch.register_abilities(ChannelAbilities {
            version: "2024-01".into(),
            vision: false,
            ..ChannelAbilities::default()
        });
        ch.register_abilities(ChannelAbilities {
            version: "2024-06".into(),
            vision: true,
            ..ChannelAbilities::default()
        });

        assert!(ch.abilities().vision);
        assert_eq!(ch.abilities().version, "2024-06");
        let older = ch.abilities_for("2024-01").expect("registered version");
        assert!(!older.vision);
    }

    #[test]
    fn test_filter_matching() {
        let ch = test_channel();

        assert!(ChannelFilter::enabled().with_type("openai").matches(&ch));
        assert!(!ChannelFilter::enabled().with_type("anthropic").matches(&ch));
        assert!(ChannelFilter::enabled().with_model("gpt-4o").matches(&ch));
        assert!(!ChannelFilter::enabled().with_model("claude-3").matches(&ch));
        assert!(ChannelFilter::enabled().with_region("us-east").matches(&ch));
        assert!(!ChannelFilter::enabled().with_region("eu-west").matches(&ch));

        ch.set_enabled(false);
        assert!(!ChannelFilter::enabled().matches(&ch));
        // Without only_enabled the disabled channel still matches.
        assert!(ChannelFilter::default().matches(&ch));
    }

    #[test]
    fn test_filter_min_availability() {
        let ch = test_channel();
        ch.metrics.begin_request();
        ch.metrics.begin_request();
        ch.metrics.record_success(Duration::from_millis(10));
        ch.metrics.record_failure();

        // Success rate is 0.5.
        assert!(ChannelFilter::enabled().with_min_availability(0.5).matches(&ch));
        assert!(!ChannelFilter::enabled().with_min_availability(0.9).matches(&ch));
    }

    #[test]
    fn test_weight_floor() {
        let ch = test_channel();
        ch.set_weight(0);
        assert_eq!(ch.weight(), 1);
    }
}
