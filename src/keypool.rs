//! API-key rotation pool, partitioned by channel type.
//!
//! Each channel type owns an ordered list of [`ApiKey`]s. Selection
//! filters to valid keys and applies one of three strategies; usage
//! recording updates counters atomically. Keys with growing consecutive
//! failures stay in the pool at a halved score, draining traffic
//! naturally instead of being hard-removed.

use crate::config::KeyPoolConfig;
use crate::error::{RelayError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Key selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Uniform among valid keys.
    Random,
    /// Global atomic counter, modulo pool size.
    RoundRobin,
    /// Proportional-random over `success_rate * weight`, halved for keys
    /// with consecutive failures.
    FailureAwareWeighted,
}

/// One key in the rotation pool.
///
/// Mirrors the channel-attached key but carries its own selection
/// counters, updated lock-free from the request path.
pub struct ApiKey {
    /// Stable key identifier.
    pub id: String,
    /// The credential sent as a bearer token.
    pub secret: String,
    /// Whether the key participates in rotation.
    pub enabled: bool,
    /// Optional hard expiry.
    pub expires_at: Option<SystemTime>,
    /// Selection weight (at least 1).
    pub weight: u32,
    /// Operator priority; lower is preferred. Informational.
    pub priority: u32,
    /// Optional quota ceiling in provider units.
    pub quota_limit: Option<u64>,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    consecutive_failures: AtomicU32,
    usage_count: AtomicU64,
    current_usage: AtomicU64,
}

impl ApiKey {
    /// An enabled key with weight 1 and no expiry or quota limit.
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            enabled: true,
            expires_at: None,
            weight: 1,
            priority: 0,
            quota_limit: None,
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            usage_count: AtomicU64::new(0),
            current_usage: AtomicU64::new(0),
        }
    }

    /// Set the selection weight (clamped to at least 1).
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Set the operator priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set a quota ceiling.
    pub fn with_quota_limit(mut self, limit: u64) -> Self {
        self.quota_limit = Some(limit);
        self
    }

    /// Set a hard expiry.
    pub fn with_expiry(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Set the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether the key may be used right now: enabled, unexpired, and
    /// under its quota limit.
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
            Some(limit) => self.current_usage.load(Ordering::Relaxed) < limit,
            None => true,
        }
    }

    /// Record one request outcome. `quota_delta` is added to the key's
    /// consumed quota (token-based callers pass the metered amount,
    /// request-based callers pass 0).
    pub fn record_usage(&self, success: bool, quota_delta: u64) {
        self.usage_count.fetch_add(1, Ordering::Relaxed);
        self.current_usage.fetch_add(quota_delta, Ordering::Relaxed);
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Successful requests recorded.
    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    /// Failed requests recorded.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Requests issued with this key.
    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::Relaxed)
    }

    /// Consumed quota in provider units.
    pub fn current_usage(&self) -> u64 {
        self.current_usage.load(Ordering::Relaxed)
    }

    /// Fraction of recorded outcomes that succeeded, 1.0 before traffic.
    pub fn success_rate(&self) -> f64 {
        let ok = self.success_count.load(Ordering::Relaxed);
        let failed = self.failure_count.load(Ordering::Relaxed);
        let total = ok + failed;
        if total == 0 {
            1.0
        } else {
            ok as f64 / total as f64
        }
    }

    /// Selection score: `success_rate * weight`, halved while the key
    /// has consecutive failures.
    pub fn score(&self) -> f64 {
        let mut score = self.success_rate() * f64::from(self.weight);
        if self.consecutive_failures.load(Ordering::Relaxed) > 0 {
            score /= 2.0;
        }
        score
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("weight", &self.weight)
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

/// Key pool partitioned by channel type.
pub struct KeyPool {
    groups: RwLock<HashMap<String, Vec<Arc<ApiKey>>>>,
    strategies: KeyPoolConfig,
    counter: AtomicUsize,
}

impl KeyPool {
    /// An empty pool using `config` to resolve per-type strategies.
    pub fn new(config: KeyPoolConfig) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            strategies: config,
            counter: AtomicUsize::new(0),
        }
    }

    /// Add a key under `channel_type`.
    pub fn add_key(&self, channel_type: impl Into<String>, key: ApiKey) {
        self.groups
            .write()
            .entry(channel_type.into())
            .or_default()
            .push(Arc::new(key));
    }

    /// Remove a key by id. Returns whether a key was removed.
    pub fn remove_key(&self, channel_type: &str, key_id: &str) -> bool {
        let mut groups = self.groups.write();
        match groups.get_mut(channel_type) {
            Some(keys) => {
                let before = keys.len();
                keys.retain(|k| k.id != key_id);
                keys.len() != before
            }
            None => false,
        }
    }

    /// Pick a valid key for `channel_type` using the configured strategy.
    ///
    /// Returns a no-candidate error when the type has no valid keys;
    /// invalid keys stay registered but never win selection.
    pub fn select_key(&self, channel_type: &str) -> Result<Arc<ApiKey>> {
        let groups = self.groups.read();
        let keys = groups
            .get(channel_type)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let valid: Vec<&Arc<ApiKey>> = keys.iter().filter(|k| k.is_valid()).collect();
        if valid.is_empty() {
            return Err(RelayError::no_candidate(
                "keys",
                format!("channel type {}", channel_type),
            ));
        }

        let picked = match self.strategies.strategy_for(channel_type) {
            KeyStrategy::Random => valid[fastrand::usize(..valid.len())],
            KeyStrategy::RoundRobin => {
                let n = self.counter.fetch_add(1, Ordering::Relaxed);
                valid[n % valid.len()]
            }
            KeyStrategy::FailureAwareWeighted => Self::pick_weighted(&valid),
        };

        Ok((*picked).clone())
    }

    /// Proportional-random over scores; all-zero scores fall back to a
    /// uniform pick.
    fn pick_weighted<'a>(valid: &[&'a Arc<ApiKey>]) -> &'a Arc<ApiKey> {
        let scores: Vec<f64> = valid.iter().map(|k| k.score()).collect();
        let total: f64 = scores.iter().sum();
        if total <= 0.0 {
            return valid[fastrand::usize(..valid.len())];
        }

        let mut target = fastrand::f64() * total;
        for (key, score) in valid.iter().zip(&scores) {
            if target < *score {
                return key;
            }
            target -= score;
        }
        valid[valid.len() - 1]
    }

    /// Snapshot of the keys registered under `channel_type`.
    pub fn keys_for(&self, channel_type: &str) -> Vec<Arc<ApiKey>> {
        self.groups
            .read()
            .get(channel_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Total keys across every type, valid or not.
    pub fn len(&self) -> usize {
        self.groups.read().values().map(Vec::len).sum()
    }

    /// Whether the pool holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool")
            .field("keys", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyPoolConfig;
    use std::time::Duration;

    fn pool_with(strategy: KeyStrategy) -> KeyPool {
        KeyPool::new(KeyPoolConfig::default().with_default_strategy(strategy))
    }

    #[test]
    fn test_select_empty_pool_fails() {
        let pool = pool_with(KeyStrategy::Random);
        let err = pool.select_key("openai").unwrap_err();
        assert!(matches!(err, RelayError::NoCandidate { resource: "keys", .. }));
    }

    #[test]
    fn test_invalid_keys_filtered() {
        let pool = pool_with(KeyStrategy::Random);
        pool.add_key("openai", ApiKey::new("k1", "sk-1").with_enabled(false));
        pool.add_key(
            "openai",
            ApiKey::new("k2", "sk-2").with_expiry(SystemTime::now() - Duration::from_secs(1)),
        );
        pool.add_key("openai", ApiKey::new("k3", "sk-3"));

        for _ in 0..20 {
            let key = pool.select_key("openai").expect("one valid key");
            assert_eq!(key.id, "k3");
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let pool = pool_with(KeyStrategy::RoundRobin);
        pool.add_key("openai", ApiKey::new("k1", "sk-1"));
        pool.add_key("openai", ApiKey::new("k2", "sk-2"));
        pool.add_key("openai", ApiKey::new("k3", "sk-3"));

        let picks: Vec<String> = (0..6)
            .map(|_| pool.select_key("openai").expect("keys").id.clone())
            .collect();
        assert_eq!(picks, ["k1", "k2", "k3", "k1", "k2", "k3"]);
    }

    #[test]
    fn test_groups_are_independent() {
        let pool = pool_with(KeyStrategy::RoundRobin);
        pool.add_key("openai", ApiKey::new("o1", "sk-o"));
        pool.add_key("anthropic", ApiKey::new("a1", "sk-a"));

        assert_eq!(pool.select_key("openai").expect("key").id, "o1");
        assert_eq!(pool.select_key("anthropic").expect("key").id, "a1");
    }

    #[test]
    fn test_record_usage_updates_counters() {
        let key = ApiKey::new("k1", "sk-1");
        key.record_usage(true, 10);
        key.record_usage(false, 0);
        key.record_usage(false, 0);

        assert_eq!(key.success_count(), 1);
        assert_eq!(key.failure_count(), 2);
        assert_eq!(key.consecutive_failures(), 2);
        assert_eq!(key.usage_count(), 3);
        assert_eq!(key.current_usage(), 10);

        key.record_usage(true, 5);
        assert_eq!(key.consecutive_failures(), 0);
        assert_eq!(key.current_usage(), 15);
    }

    #[test]
    fn test_quota_limit_invalidates_key() {
        let key = ApiKey::new("k1", "sk-1").with_quota_limit(10);
        assert!(key.is_valid());
        key.record_usage(true, 10);
        assert!(!key.is_valid());
    }

    #[test]
    fn test_failure_halves_score() {
        let key = ApiKey::new("k1", "sk-1").with_weight(4);
        assert_eq!(key.score(), 4.0);

        key.record_usage(false, 0);
        // success_rate 0.0 -> score 0; seed one success to see the halving.
        let key = ApiKey::new("k2", "sk-2").with_weight(4);
        key.record_usage(true, 0);
        key.record_usage(false, 0);
        // rate 0.5, weight 4 -> 2.0, halved for consecutive failure -> 1.0
        assert!((key.score() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_prefers_healthy_key() {
        let pool = pool_with(KeyStrategy::FailureAwareWeighted);
        pool.add_key("openai", ApiKey::new("healthy", "sk-1").with_weight(1));
        pool.add_key("openai", ApiKey::new("failing", "sk-2").with_weight(1));

        // Drive the failing key's rate to zero.
        let failing = pool
            .keys_for("openai")
            .into_iter()
            .find(|k| k.id == "failing")
            .expect("registered");
        for _ in 0..10 {
            failing.record_usage(false, 0);
        }

        // Score(healthy)=1.0, score(failing)=0.0: every pick is healthy.
        for _ in 0..50 {
            assert_eq!(pool.select_key("openai").expect("keys").id, "healthy");
        }
    }

    #[test]
    fn test_weighted_all_zero_falls_back_to_random() {
        let pool = pool_with(KeyStrategy::FailureAwareWeighted);
        pool.add_key("openai", ApiKey::new("k1", "sk-1"));
        pool.add_key("openai", ApiKey::new("k2", "sk-2"));
        for key in pool.keys_for("openai") {
            for _ in 0..5 {
                key.record_usage(false, 0);
            }
        }

        // Both scores are zero; selection still succeeds.
        let key = pool.select_key("openai").expect("fallback");
        assert!(key.id == "k1" || key.id == "k2");
    }

    #[test]
    fn test_remove_key() {
        let pool = pool_with(KeyStrategy::Random);
        pool.add_key("openai", ApiKey::new("k1", "sk-1"));
        assert!(pool.remove_key("openai", "k1"));
        assert!(!pool.remove_key("openai", "k1"));
        assert!(pool.is_empty());
    }
}
