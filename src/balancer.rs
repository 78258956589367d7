//! Channel selector / load balancer.
//!
//! Given per-request constraints, the balancer first consults the
//! wildcard rule set: the highest-weight enabled rule whose glob matches
//! the model pins the request to that rule's preferred channels when any
//! of them is currently available. Otherwise the channel cache is
//! filtered with the same constraints. Circuit breakers then remove
//! channels refusing traffic, and one of six strategies picks the winner.
//!
//! The optional adaptive-weight loop periodically scales channel weights
//! by their observed success rate.

use crate::breaker::BreakerRegistry;
use crate::cache::ChannelCache;
use crate::channel::{Channel, ChannelFilter};
use crate::config::LoadBalancerConfig;
use crate::error::{RelayError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::wildcard::{RuleSet, WildcardRule};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Uniform random.
    Random,
    /// Atomic counter modulo candidate count.
    RoundRobin,
    /// Random draw over the weight prefix sums.
    WeightedRoundRobin,
    /// Minimum in-flight requests.
    LeastConnection,
    /// Minimum running-mean latency.
    LowestLatency,
    /// `(1 - latency/max_latency) * weight`, proportional-random.
    WeightedLatency,
    /// Stable hash of the routing key modulo candidate count.
    ConsistentHash,
}

impl Strategy {
    /// Parse a strategy name from configuration. Unknown names fall back
    /// to round-robin.
    pub fn parse(name: &str) -> Strategy {
        match name {
            "random" => Strategy::Random,
            "weighted_round_robin" => Strategy::WeightedRoundRobin,
            "least_connection" => Strategy::LeastConnection,
            "lowest_latency" => Strategy::LowestLatency,
            "weighted_latency" => Strategy::WeightedLatency,
            "consistent_hash" => Strategy::ConsistentHash,
            _ => Strategy::RoundRobin,
        }
    }
}

/// Per-request selection constraints.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Restrict to one provider class.
    pub channel_type: Option<String>,
    /// The requested model; also drives wildcard rule matching.
    pub model: Option<String>,
    /// Restrict to one region.
    pub region: Option<String>,
    /// Minimum success rate in `[0, 1]`.
    pub min_availability: Option<f64>,
    /// Return this channel when it survives filtering.
    pub preferred_id: Option<u64>,
    /// Channels to skip (e.g. already failed this request).
    pub excluded_ids: Vec<u64>,
    /// Key for consistent hashing; the model is used when unset.
    pub routing_key: Option<String>,
}

impl SelectOptions {
    /// Constraints for one model.
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::default()
        }
    }

    /// Restrict to one provider class.
    pub fn with_type(mut self, channel_type: impl Into<String>) -> Self {
        self.channel_type = Some(channel_type.into());
        self
    }

    /// Restrict to one region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Require a minimum success rate.
    pub fn with_min_availability(mut self, rate: f64) -> Self {
        self.min_availability = Some(rate);
        self
    }

    /// Prefer one channel when it is eligible.
    pub fn with_preferred(mut self, id: u64) -> Self {
        self.preferred_id = Some(id);
        self
    }

    /// Exclude a channel.
    pub fn excluding(mut self, id: u64) -> Self {
        self.excluded_ids.push(id);
        self
    }

    /// Set the consistent-hash routing key.
    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    fn to_filter(&self) -> ChannelFilter {
        ChannelFilter {
            channel_type: self.channel_type.clone(),
            model: self.model.clone(),
            region: self.region.clone(),
            status: None,
            min_availability: self.min_availability,
            only_enabled: true,
        }
    }
}

/// The channel selector.
pub struct LoadBalancer {
    cache: Arc<ChannelCache>,
    breakers: Arc<BreakerRegistry>,
    rules: RwLock<RuleSet>,
    config: LoadBalancerConfig,
    strategy: Strategy,
    rr_counter: AtomicUsize,
    events: Option<Arc<dyn EventHandler>>,
    weight_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<CancellationToken>,
}

impl LoadBalancer {
    /// A balancer over `cache` with breaker gating from `breakers`.
    pub fn new(
        cache: Arc<ChannelCache>,
        breakers: Arc<BreakerRegistry>,
        config: LoadBalancerConfig,
    ) -> Self {
        let strategy = Strategy::parse(&config.strategy);
        Self {
            cache,
            breakers,
            rules: RwLock::new(RuleSet::new()),
            config,
            strategy,
            rr_counter: AtomicUsize::new(0),
            events: None,
            weight_task: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    /// Attach an event handler for selection decisions.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the parsed strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// The active strategy.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Install a wildcard rule.
    pub fn add_rule(&self, rule: WildcardRule) {
        self.rules.write().add(rule);
    }

    /// Remove a wildcard rule by id.
    pub fn remove_rule(&self, id: u64) -> bool {
        self.rules.write().remove(id)
    }

    /// Pick a channel satisfying `opts`.
    ///
    /// Returns [`RelayError::NoCandidate`] when nothing matches the
    /// constraints and [`RelayError::CircuitOpen`] when candidates exist
    /// but every breaker refuses traffic.
    pub fn select(&self, opts: &SelectOptions) -> Result<Arc<Channel>> {
        let candidates = self.candidates(opts)?;

        if let Some(preferred) = opts.preferred_id {
            if let Some(channel) = candidates.iter().find(|c| c.id == preferred) {
                let channel = channel.clone();
                self.emit_selected(&channel, opts);
                return Ok(channel);
            }
        }

        let channel = self.apply_strategy(&candidates, opts);
        self.emit_selected(&channel, opts);
        Ok(channel)
    }

    /// The breaker-filtered candidate set for `opts`.
    pub fn candidates(&self, opts: &SelectOptions) -> Result<Vec<Arc<Channel>>> {
        // Wildcard rules pin the candidate set when any preferred
        // channel is currently usable.
        if let Some(ref model) = opts.model {
            let rules = self.rules.read();
            if let Some(rule) = rules.best_match(model) {
                let pinned = self.resolve_rule(rule, opts);
                if !pinned.is_empty() {
                    return Ok(pinned);
                }
            }
        }

        let filter = opts.to_filter();
        let mut base: Vec<Arc<Channel>> = self
            .cache
            .filter(&filter)
            .into_iter()
            .filter(|c| !opts.excluded_ids.contains(&c.id))
            .collect();

        if self.config.enable_health_check {
            base.retain(|c| c.is_available());
        }

        if base.is_empty() {
            return Err(RelayError::no_candidate(
                "channels",
                opts.model.clone().unwrap_or_else(|| "any".to_string()),
            ));
        }

        if !self.config.enable_circuit_breaker {
            return Ok(base);
        }

        let total = base.len();
        let open: Vec<Arc<Channel>> = base
            .into_iter()
            .filter(|c| self.breakers.is_available(c.id))
            .collect();
        if open.is_empty() {
            return Err(RelayError::CircuitOpen { candidates: total });
        }
        Ok(open)
    }

    /// Resolve a rule's preferred channel ids against the cache and the
    /// request constraints, preserving the rule's preference order.
    fn resolve_rule(&self, rule: &WildcardRule, opts: &SelectOptions) -> Vec<Arc<Channel>> {
        let filter = opts.to_filter();
        rule.channel_ids
            .iter()
            .filter(|id| !opts.excluded_ids.contains(id))
            .filter_map(|id| self.cache.get(*id).ok())
            .filter(|c| filter.matches(c))
            .filter(|c| !self.config.enable_health_check || c.is_available())
            .filter(|c| !self.config.enable_circuit_breaker || self.breakers.is_available(c.id))
            .collect()
    }

    fn apply_strategy(&self, candidates: &[Arc<Channel>], opts: &SelectOptions) -> Arc<Channel> {
        debug_assert!(!candidates.is_empty());
        if candidates.len() == 1 {
            return candidates[0].clone();
        }

        match self.strategy {
            Strategy::Random => candidates[fastrand::usize(..candidates.len())].clone(),
            Strategy::RoundRobin => {
                let n = self.rr_counter.fetch_add(1, Ordering::Relaxed);
                candidates[n % candidates.len()].clone()
            }
            Strategy::WeightedRoundRobin => {
                let total: u64 = candidates.iter().map(|c| u64::from(c.weight())).sum();
                let mut target = fastrand::u64(..total);
                for channel in candidates {
                    let weight = u64::from(channel.weight());
                    if target < weight {
                        return channel.clone();
                    }
                    target -= weight;
                }
                candidates[candidates.len() - 1].clone()
            }
            Strategy::LeastConnection => candidates
                .iter()
                .min_by_key(|c| c.metrics.current_concurrency())
                .cloned()
                .unwrap_or_else(|| candidates[0].clone()),
            Strategy::LowestLatency => {
                let mut best = &candidates[0];
                for channel in &candidates[1..] {
                    if channel.metrics.avg_latency_ms() < best.metrics.avg_latency_ms() {
                        best = channel;
                    }
                }
                best.clone()
            }
            Strategy::WeightedLatency => self.pick_weighted_latency(candidates),
            Strategy::ConsistentHash => {
                let key = opts
                    .routing_key
                    .as_deref()
                    .or(opts.model.as_deref())
                    .unwrap_or_default();
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                let index = (hasher.finish() % candidates.len() as u64) as usize;
                candidates[index].clone()
            }
        }
    }

    fn pick_weighted_latency(&self, candidates: &[Arc<Channel>]) -> Arc<Channel> {
        let latencies: Vec<f64> = candidates
            .iter()
            .map(|c| c.metrics.avg_latency_ms())
            .collect();
        let max_latency = latencies.iter().cloned().fold(0.0f64, f64::max);
        if max_latency <= 0.0 {
            // No latency data yet; fall back to plain weights.
            let total: u64 = candidates.iter().map(|c| u64::from(c.weight())).sum();
            let mut target = fastrand::u64(..total);
            for channel in candidates {
                let weight = u64::from(channel.weight());
                if target < weight {
                    return channel.clone();
                }
                target -= weight;
            }
            return candidates[candidates.len() - 1].clone();
        }

        let scores: Vec<f64> = candidates
            .iter()
            .zip(&latencies)
            .map(|(c, lat)| (1.0 - lat / max_latency) * f64::from(c.weight()))
            .collect();
        let total: f64 = scores.iter().sum();
        if total <= 0.0 {
            return candidates[fastrand::usize(..candidates.len())].clone();
        }

        let mut target = fastrand::f64() * total;
        for (channel, score) in candidates.iter().zip(&scores) {
            if target < *score {
                return channel.clone();
            }
            target -= score;
        }
        candidates[candidates.len() - 1].clone()
    }

    fn emit_selected(&self, channel: &Arc<Channel>, opts: &SelectOptions) {
        emit(
            &self.events,
            Event::ChannelSelected {
                channel_id: channel.id,
                channel_name: channel.name.clone(),
                model: opts.model.clone(),
            },
        );
    }

    /// One pass of adaptive weight adjustment over every cached channel.
    ///
    /// Channels without completed traffic are left alone. Factors by
    /// success rate: >= 95% grows by 1.1, >= 80% holds, >= 50% shrinks by
    /// 0.9, below that halves. Results round away from zero and floor
    /// at 1.
    pub fn adjust_weights(&self) {
        for channel in self.cache.all() {
            let metrics = &channel.metrics;
            if metrics.successful_requests() + metrics.failed_requests() == 0 {
                continue;
            }
            let rate = metrics.success_rate();
            let factor: f64 = if rate >= 0.95 {
                1.1
            } else if rate >= 0.80 {
                1.0
            } else if rate >= 0.50 {
                0.9
            } else {
                0.5
            };
            if (factor - 1.0).abs() < f64::EPSILON {
                continue;
            }
            let adjusted = (f64::from(channel.weight()) * factor).ceil() as u32;
            channel.set_weight(adjusted.max(1));
        }
    }

    /// Launch the adaptive-weight loop when enabled. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enable_adaptive_weight {
            return;
        }
        let mut task = self.weight_task.lock();
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();

        let balancer = self.clone();
        let interval = self.config.weight_adjust_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tracing::debug!("adaptive weight adjustment pass");
                        balancer.adjust_weights();
                    }
                }
            }
        }));
    }

    /// Stop the adaptive-weight loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.lock().cancel();
        let task = self.weight_task.lock().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy)
            .field("rules", &self.rules.read().len())
            .field("channels", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use std::time::Duration;

    fn channel(id: u64, weight: u32) -> Arc<Channel> {
        Arc::new(
            Channel::new(id, format!("ch-{}", id), "https://api.example.com", "openai")
                .with_models(["gpt-4o"])
                .with_weight(weight),
        )
    }

    fn balancer_with(channels: Vec<Arc<Channel>>, strategy: Strategy) -> Arc<LoadBalancer> {
        let cache = Arc::new(ChannelCache::new());
        for ch in channels {
            cache.add(ch);
        }
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        Arc::new(
            LoadBalancer::new(cache, breakers, LoadBalancerConfig::default())
                .with_strategy(strategy),
        )
    }

    #[test]
    fn test_select_empty_cache_is_no_candidate() {
        let balancer = balancer_with(vec![], Strategy::RoundRobin);
        let err = balancer.select(&SelectOptions::for_model("gpt-4o")).unwrap_err();
        assert!(matches!(err, RelayError::NoCandidate { resource: "channels", .. }));
    }

    #[test]
    fn test_selected_channel_always_in_candidate_set() {
        let balancer = balancer_with(vec![channel(1, 1), channel(2, 1), channel(3, 1)], Strategy::Random);
        let opts = SelectOptions::for_model("gpt-4o");
        for _ in 0..50 {
            let picked = balancer.select(&opts).expect("candidates exist");
            assert!([1, 2, 3].contains(&picked.id));
        }
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let balancer = balancer_with(vec![channel(1, 1), channel(2, 1)], Strategy::RoundRobin);
        let opts = SelectOptions::for_model("gpt-4o");

        let picks: Vec<u64> = (0..4)
            .map(|_| balancer.select(&opts).expect("candidates").id)
            .collect();
        // Alternates between the two candidates, starting anywhere.
        assert_ne!(picks[0], picks[1]);
        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
    }

    #[test]
    fn test_weighted_round_robin_distribution() {
        let balancer = balancer_with(
            vec![channel(1, 3), channel(2, 1)],
            Strategy::WeightedRoundRobin,
        );
        let opts = SelectOptions::for_model("gpt-4o");

        let mut heavy = 0;
        for _ in 0..400 {
            if balancer.select(&opts).expect("candidates").id == 1 {
                heavy += 1;
            }
        }
        assert!((250..=350).contains(&heavy), "weight-3 channel won {} of 400", heavy);
    }

    #[test]
    fn test_least_connection_picks_minimum() {
        let busy = channel(1, 1);
        for _ in 0..5 {
            busy.metrics.begin_request();
        }
        let quiet = channel(2, 1);
        for _ in 0..2 {
            quiet.metrics.begin_request();
        }

        let balancer = balancer_with(vec![busy, quiet], Strategy::LeastConnection);
        let opts = SelectOptions::for_model("gpt-4o");
        for _ in 0..10 {
            assert_eq!(balancer.select(&opts).expect("candidates").id, 2);
        }
    }

    #[test]
    fn test_lowest_latency_picks_minimum() {
        let slow = channel(1, 1);
        slow.metrics.begin_request();
        slow.metrics.record_success(Duration::from_millis(900));
        let fast = channel(2, 1);
        fast.metrics.begin_request();
        fast.metrics.record_success(Duration::from_millis(30));

        let balancer = balancer_with(vec![slow, fast], Strategy::LowestLatency);
        let picked = balancer.select(&SelectOptions::for_model("gpt-4o")).expect("candidates");
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn test_consistent_hash_is_stable() {
        let balancer = balancer_with(
            vec![channel(1, 1), channel(2, 1), channel(3, 1)],
            Strategy::ConsistentHash,
        );
        let opts = SelectOptions::for_model("gpt-4o").with_routing_key("user-42");

        let first = balancer.select(&opts).expect("candidates").id;
        for _ in 0..20 {
            assert_eq!(balancer.select(&opts).expect("candidates").id, first);
        }
    }

    #[test]
    fn test_excluded_ids_skipped() {
        let balancer = balancer_with(vec![channel(1, 1), channel(2, 1)], Strategy::RoundRobin);
        let opts = SelectOptions::for_model("gpt-4o").excluding(1);
        for _ in 0..5 {
            assert_eq!(balancer.select(&opts).expect("candidates").id, 2);
        }
    }

    #[test]
    fn test_preferred_id_wins_when_eligible() {
        let balancer = balancer_with(vec![channel(1, 1), channel(2, 1)], Strategy::RoundRobin);
        let opts = SelectOptions::for_model("gpt-4o").with_preferred(2);
        for _ in 0..5 {
            assert_eq!(balancer.select(&opts).expect("candidates").id, 2);
        }

        // A preferred channel outside the candidate set is ignored.
        let opts = SelectOptions::for_model("gpt-4o").with_preferred(99);
        assert!(balancer.select(&opts).is_ok());
    }

    #[test]
    fn test_breaker_open_yields_circuit_open() {
        let cache = Arc::new(ChannelCache::new());
        cache.add(channel(1, 1));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout: Duration::from_secs(60),
        }));
        breakers.on_failure(1);

        let balancer = LoadBalancer::new(cache, breakers, LoadBalancerConfig::default());
        let err = balancer.select(&SelectOptions::for_model("gpt-4o")).unwrap_err();
        assert!(matches!(err, RelayError::CircuitOpen { candidates: 1 }));
    }

    #[test]
    fn test_wildcard_rule_pins_candidates() {
        let balancer = balancer_with(vec![channel(1, 1), channel(2, 1)], Strategy::RoundRobin);
        balancer.add_rule(WildcardRule::new(1, "gpt-*", vec![2]).with_weight(5));

        let opts = SelectOptions::for_model("gpt-4o");
        for _ in 0..5 {
            assert_eq!(balancer.select(&opts).expect("pinned").id, 2);
        }
    }

    #[test]
    fn test_wildcard_rule_falls_back_when_pin_unavailable() {
        let pinned = channel(2, 1);
        pinned.set_enabled(false);
        let balancer = balancer_with(vec![channel(1, 1), pinned], Strategy::RoundRobin);
        balancer.add_rule(WildcardRule::new(1, "gpt-*", vec![2]).with_weight(5));

        let picked = balancer.select(&SelectOptions::for_model("gpt-4o")).expect("fallback");
        assert_eq!(picked.id, 1);
    }

    #[test]
    fn test_adjust_weights_by_success_rate() {
        let strong = channel(1, 10);
        for _ in 0..20 {
            strong.metrics.begin_request();
            strong.metrics.record_success(Duration::from_millis(10));
        }
        let weak = channel(2, 10);
        for _ in 0..20 {
            weak.metrics.begin_request();
            weak.metrics.record_failure();
        }
        let idle = channel(3, 10);

        let balancer = balancer_with(
            vec![strong.clone(), weak.clone(), idle.clone()],
            Strategy::RoundRobin,
        );
        balancer.adjust_weights();

        // 10 * 1.1 = 11.0, rounded away from zero stays 11.
        assert_eq!(strong.weight(), 11);
        // 10 * 0.5 = 5.
        assert_eq!(weak.weight(), 5);
        // No completed traffic: untouched.
        assert_eq!(idle.weight(), 10);
    }

    #[test]
    fn test_adjust_weights_floor_is_one() {
        let weak = channel(1, 1);
        for _ in 0..10 {
            weak.metrics.begin_request();
            weak.metrics.record_failure();
        }
        let balancer = balancer_with(vec![weak.clone()], Strategy::RoundRobin);
        balancer.adjust_weights();
        assert_eq!(weak.weight(), 1);
    }
}
