//! Periodic channel health checking.
//!
//! The checker sweeps every cached channel in parallel. A channel with a
//! configured probe endpoint gets an HTTP GET under a per-check timeout;
//! without one, health derives purely from the channel's running success
//! rate. Repeated check failures force UNAVAILABLE and put the channel in
//! recovery mode, where it is probed on a shorter interval until a
//! healthy check clears it.

use crate::breaker::BreakerRegistry;
use crate::cache::ChannelCache;
use crate::channel::{Channel, ChannelStatus};
use crate::config::HealthCheckConfig;
use crate::error::{RelayError, TimeoutKind};
use crate::events::{emit, Event, EventHandler};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of one channel check, passed to the result callback.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Checked channel.
    pub channel_id: u64,
    /// Status derived by this check.
    pub status: ChannelStatus,
    /// Probe round-trip, when a probe ran.
    pub latency: Option<Duration>,
    /// Probe error, when the check failed.
    pub error: Option<String>,
    /// Whether the channel is in recovery mode after this check.
    pub in_recovery: bool,
}

/// Callback fired after every individual channel check.
pub type ResultCallback = Arc<dyn Fn(&HealthCheckResult) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct CheckState {
    last_check: Option<Instant>,
    consecutive_failures: u32,
    in_recovery: bool,
}

impl Default for CheckState {
    fn default() -> Self {
        Self {
            last_check: None,
            consecutive_failures: 0,
            in_recovery: false,
        }
    }
}

/// The health checker.
pub struct HealthChecker {
    cache: Arc<ChannelCache>,
    breakers: Option<Arc<BreakerRegistry>>,
    http: reqwest::Client,
    config: HealthCheckConfig,
    states: RwLock<HashMap<u64, CheckState>>,
    callback: Option<ResultCallback>,
    events: Option<Arc<dyn EventHandler>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<CancellationToken>,
}

impl HealthChecker {
    /// A checker over `cache` with the given settings.
    pub fn new(cache: Arc<ChannelCache>, config: HealthCheckConfig) -> Self {
        Self {
            cache,
            breakers: None,
            http: reqwest::Client::new(),
            config,
            states: RwLock::new(HashMap::new()),
            callback: None,
            events: None,
            task: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    /// Feed probe outcomes into the breaker registry as well.
    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Use a shared HTTP client instead of a private one.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Fire `callback` after every individual channel check.
    pub fn with_result_callback(mut self, callback: ResultCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Attach an event handler.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Derive a status from a success rate using the configured
    /// thresholds.
    pub fn derive_status(&self, success_rate: f64) -> ChannelStatus {
        if success_rate >= self.config.healthy_threshold {
            ChannelStatus::Healthy
        } else if success_rate >= self.config.degraded_threshold {
            ChannelStatus::Degraded
        } else {
            ChannelStatus::Unavailable
        }
    }

    /// Whether a channel is due for a check, honoring the shorter
    /// recovery interval for channels in recovery mode.
    fn is_due(&self, channel_id: u64, now: Instant) -> bool {
        let states = self.states.read();
        match states.get(&channel_id) {
            None => true,
            Some(state) => {
                let interval = if state.in_recovery {
                    self.config.recovery_interval
                } else {
                    self.config.interval
                };
                match state.last_check {
                    None => true,
                    Some(last) => now.duration_since(last) >= interval,
                }
            }
        }
    }

    /// Sweep every cached channel in parallel, skipping channels whose
    /// interval has not elapsed.
    pub async fn run_once(&self) {
        let now = Instant::now();
        let due: Vec<Arc<Channel>> = self
            .cache
            .all()
            .into_iter()
            .filter(|c| c.is_enabled())
            .filter(|c| self.is_due(c.id, now))
            .collect();

        let checks = due.iter().map(|channel| self.check_channel(channel.clone()));
        futures::future::join_all(checks).await;
    }

    /// Check one channel: probe when an endpoint is configured, otherwise
    /// derive from the success rate. Updates the channel status, the
    /// per-channel check state, and fires the result callback.
    pub async fn check_channel(&self, channel: Arc<Channel>) -> HealthCheckResult {
        let probe = match self.config.endpoint {
            Some(ref endpoint) => Some(self.probe(&channel, endpoint).await),
            None => None,
        };

        let mut states = self.states.write();
        let state = states.entry(channel.id).or_default();
        state.last_check = Some(Instant::now());

        let result = match probe {
            Some(Ok(latency)) => {
                state.consecutive_failures = 0;
                if let Some(ref breakers) = self.breakers {
                    breakers.on_success(channel.id);
                }
                // The probe answered; rank the channel by its observed
                // traffic quality.
                let status = self.derive_status(channel.metrics.success_rate());
                if status == ChannelStatus::Healthy {
                    state.in_recovery = false;
                }
                HealthCheckResult {
                    channel_id: channel.id,
                    status,
                    latency: Some(latency),
                    error: None,
                    in_recovery: state.in_recovery,
                }
            }
            Some(Err(err)) => {
                state.consecutive_failures += 1;
                if let Some(ref breakers) = self.breakers {
                    breakers.on_failure(channel.id);
                }
                let status = if state.consecutive_failures >= self.config.max_consecutive_failures {
                    state.in_recovery = true;
                    ChannelStatus::Unavailable
                } else {
                    self.derive_status(channel.metrics.success_rate())
                };
                HealthCheckResult {
                    channel_id: channel.id,
                    status,
                    latency: None,
                    error: Some(err.to_string()),
                    in_recovery: state.in_recovery,
                }
            }
            None => {
                let status = self.derive_status(channel.metrics.success_rate());
                if status == ChannelStatus::Healthy {
                    state.consecutive_failures = 0;
                    state.in_recovery = false;
                } else if status == ChannelStatus::Unavailable {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.config.max_consecutive_failures {
                        state.in_recovery = true;
                    }
                }
                HealthCheckResult {
                    channel_id: channel.id,
                    status,
                    latency: None,
                    error: None,
                    in_recovery: state.in_recovery,
                }
            }
        };
        drop(states);

        channel.set_status(result.status);

        emit(
            &self.events,
            Event::HealthResult {
                channel_id: result.channel_id,
                status: result.status,
                latency_ms: result.latency.map(|d| d.as_millis() as u64),
                error: result.error.clone(),
            },
        );
        if let Some(ref callback) = self.callback {
            callback(&result);
        }

        result
    }

    /// Issue the HTTP probe, retrying within the check up to the
    /// configured attempt count.
    async fn probe(&self, channel: &Channel, endpoint: &str) -> crate::error::Result<Duration> {
        let url = format!("{}{}", channel.base_url.trim_end_matches('/'), endpoint);
        let mut last_error = RelayError::Timeout(TimeoutKind::HealthCheck);

        for _ in 0..self.config.max_retries.max(1) {
            let started = Instant::now();
            let outcome = tokio::time::timeout(self.config.timeout, self.http.get(&url).send()).await;

            match outcome {
                Err(_) => last_error = RelayError::Timeout(TimeoutKind::HealthCheck),
                Ok(Err(err)) => last_error = RelayError::Request(err),
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(started.elapsed());
                    }
                    last_error = RelayError::Upstream {
                        status: status.as_u16(),
                        body: String::new(),
                        retry_after: None,
                    };
                }
            }
        }

        Err(last_error)
    }

    /// Whether `channel_id` is currently in recovery mode.
    pub fn in_recovery(&self, channel_id: u64) -> bool {
        self.states
            .read()
            .get(&channel_id)
            .is_some_and(|s| s.in_recovery)
    }

    /// Launch the periodic sweep loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();

        let checker = self.clone();
        // Tick at the recovery interval so recovering channels are
        // re-checked promptly; is_due gates the rest.
        let tick = self.config.recovery_interval.min(self.config.interval);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tracing::debug!("health check sweep");
                        checker.run_once().await;
                    }
                }
            }
        }));
    }

    /// Stop the sweep loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.lock().cancel();
        let task = self.task.lock().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("channels", &self.cache.len())
            .field("tracked", &self.states.read().len())
            .field("endpoint", &self.config.endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::time::Duration;

    fn channel_with_rate(id: u64, successes: u32, failures: u32) -> Arc<Channel> {
        let channel = Arc::new(
            Channel::new(id, format!("ch-{}", id), "https://api.example.com", "openai")
                .with_models(["gpt-4o"]),
        );
        for _ in 0..successes {
            channel.metrics.begin_request();
            channel.metrics.record_success(Duration::from_millis(10));
        }
        for _ in 0..failures {
            channel.metrics.begin_request();
            channel.metrics.record_failure();
        }
        channel
    }

    fn checker(cache: Arc<ChannelCache>) -> HealthChecker {
        HealthChecker::new(cache, HealthCheckConfig::default())
    }

    #[test]
    fn test_derive_status_thresholds() {
        let c = checker(Arc::new(ChannelCache::new()));
        assert_eq!(c.derive_status(1.0), ChannelStatus::Healthy);
        assert_eq!(c.derive_status(0.95), ChannelStatus::Healthy);
        assert_eq!(c.derive_status(0.94), ChannelStatus::Degraded);
        assert_eq!(c.derive_status(0.50), ChannelStatus::Degraded);
        assert_eq!(c.derive_status(0.49), ChannelStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_rate_derived_check_sets_status() {
        let cache = Arc::new(ChannelCache::new());
        let healthy = channel_with_rate(1, 19, 1);
        let degraded = channel_with_rate(2, 6, 4);
        let bad = channel_with_rate(3, 1, 9);
        cache.add(healthy.clone());
        cache.add(degraded.clone());
        cache.add(bad.clone());

        let checker = checker(cache);
        checker.run_once().await;

        assert_eq!(healthy.status(), ChannelStatus::Healthy);
        assert_eq!(degraded.status(), ChannelStatus::Degraded);
        assert_eq!(bad.status(), ChannelStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_result_callback_fires_per_channel() {
        let cache = Arc::new(ChannelCache::new());
        cache.add(channel_with_rate(1, 10, 0));
        cache.add(channel_with_rate(2, 10, 0));

        let seen: Arc<PlMutex<Vec<u64>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        let checker = checker(cache).with_result_callback(Arc::new(move |result| {
            sink.lock().push(result.channel_id);
        }));

        checker.run_once().await;

        let mut ids = seen.lock().clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_repeated_unavailable_enters_recovery() {
        let cache = Arc::new(ChannelCache::new());
        let bad = channel_with_rate(1, 0, 10);
        cache.add(bad.clone());

        let config = HealthCheckConfig {
            interval: Duration::from_millis(0),
            max_consecutive_failures: 3,
            ..HealthCheckConfig::default()
        };
        let checker = HealthChecker::new(cache, config);

        for _ in 0..2 {
            checker.check_channel(bad.clone()).await;
            assert!(!checker.in_recovery(1));
        }
        let result = checker.check_channel(bad.clone()).await;
        assert!(result.in_recovery);
        assert!(checker.in_recovery(1));
        assert_eq!(bad.status(), ChannelStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_healthy_check_clears_recovery() {
        let cache = Arc::new(ChannelCache::new());
        let channel = channel_with_rate(1, 0, 10);
        cache.add(channel.clone());

        let config = HealthCheckConfig {
            interval: Duration::from_millis(0),
            max_consecutive_failures: 1,
            ..HealthCheckConfig::default()
        };
        let checker = HealthChecker::new(cache, config);
        checker.check_channel(channel.clone()).await;
        assert!(checker.in_recovery(1));

        // Traffic recovers; the next check sees a healthy rate.
        for _ in 0..200 {
            channel.metrics.begin_request();
            channel.metrics.record_success(Duration::from_millis(5));
        }
        let result = checker.check_channel(channel.clone()).await;
        assert_eq!(result.status, ChannelStatus::Healthy);
        assert!(!result.in_recovery);
        assert!(!checker.in_recovery(1));
    }

    #[tokio::test]
    async fn test_disabled_channels_skipped() {
        let cache = Arc::new(ChannelCache::new());
        let channel = channel_with_rate(1, 10, 0);
        channel.set_enabled(false);
        cache.add(channel);

        let seen: Arc<PlMutex<Vec<u64>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        let checker = checker(cache).with_result_callback(Arc::new(move |result| {
            sink.lock().push(result.channel_id);
        }));

        checker.run_once().await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_interval_gates_rechecks() {
        let cache = Arc::new(ChannelCache::new());
        cache.add(channel_with_rate(1, 10, 0));

        let seen: Arc<PlMutex<Vec<u64>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        let config = HealthCheckConfig {
            interval: Duration::from_secs(3600),
            ..HealthCheckConfig::default()
        };
        let checker = HealthChecker::new(cache, config).with_result_callback(Arc::new(move |r| {
            sink.lock().push(r.channel_id);
        }));

        checker.run_once().await;
        checker.run_once().await;
        assert_eq!(seen.lock().len(), 1, "second sweep skips the fresh check");
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let cache = Arc::new(ChannelCache::new());
        let checker = Arc::new(checker(cache));

        checker.start();
        checker.start();
        checker.stop().await;
        checker.stop().await;
    }
}
