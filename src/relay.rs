//! Top-level relay aggregate.
//!
//! [`Relay`] owns every process-wide resource -- channel cache, key pool,
//! breaker registry, load balancer, health checker, body cache, stream
//! manager, request client, handler manager -- constructed once at
//! startup from a [`RelayConfig`] and passed by `Arc` into whatever
//! transport embeds the crate. `start` launches the background workers;
//! `stop` is idempotent and joins them all.

use crate::balancer::LoadBalancer;
use crate::body_cache::BodyCache;
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::cache::{ChannelCache, ChannelSource};
use crate::client::RequestClient;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::events::EventHandler;
use crate::handler::{HandlerFactory, HandlerManager, HandlerRegistry};
use crate::health::HealthChecker;
use crate::keypool::KeyPool;
use crate::quota::{NoopQuota, QuotaService};
use crate::stream_manager::StreamManager;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The assembled relay core.
pub struct Relay {
    /// Channel registry and indices.
    pub cache: Arc<ChannelCache>,
    /// API-key rotation pool.
    pub keys: Arc<KeyPool>,
    /// Per-channel circuit breakers.
    pub breakers: Arc<BreakerRegistry>,
    /// Channel selector.
    pub balancer: Arc<LoadBalancer>,
    /// Periodic health checks.
    pub health: Arc<HealthChecker>,
    /// Request-body store for retry replay.
    pub body_cache: Arc<BodyCache>,
    /// SSE fan-out.
    pub streams: Arc<StreamManager>,
    /// Upstream dispatch.
    pub client: Arc<RequestClient>,
    /// Request-class routing.
    pub handlers: Arc<HandlerManager>,
    source: Option<Arc<dyn ChannelSource>>,
    refresh_interval: Duration,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<CancellationToken>,
    started: AtomicBool,
}

impl Relay {
    /// Start building a relay from `config`.
    pub fn builder(config: RelayConfig) -> RelayBuilder {
        RelayBuilder {
            config,
            quota: None,
            events: None,
            http: None,
            source: None,
        }
    }

    /// Launch every background worker: channel refresh (when a source is
    /// configured), health sweeps, body-cache cleanup, the SSE sweeper,
    /// and the adaptive-weight loop when enabled. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(ref source) = self.source {
            let token = CancellationToken::new();
            *self.shutdown.lock() = token.clone();

            let source = source.clone();
            let cache = self.cache.clone();
            let interval = self.refresh_interval;
            *self.refresh_task.lock() = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            match source.load_channels().await {
                                Ok(channels) => {
                                    tracing::debug!(count = channels.len(), "channel refresh");
                                    cache.refresh(channels);
                                }
                                // A failed load leaves the prior set intact.
                                Err(err) => {
                                    tracing::warn!(error = %err, "channel refresh failed");
                                }
                            }
                        }
                    }
                }
            }));
        }
        self.health.start();
        self.body_cache.start();
        self.streams.start();
        self.balancer.start();
        tracing::info!("relay workers started");
    }

    /// Stop every background worker and wait for them to exit.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.lock().cancel();
        let refresh = self.refresh_task.lock().take();
        if let Some(handle) = refresh {
            let _ = handle.await;
        }
        self.health.stop().await;
        self.body_cache.stop().await;
        self.streams.stop().await;
        self.balancer.stop().await;
        tracing::info!("relay workers stopped");
    }

    /// Pull the channel set from the configured source once, swapping it
    /// into the cache on success.
    pub async fn refresh_channels(&self) -> Result<()> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| crate::error::RelayError::validation("no channel source configured"))?;
        let channels = source.load_channels().await?;
        self.cache.refresh(channels);
        Ok(())
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("channels", &self.cache.len())
            .field("keys", &self.keys.len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

/// Builder for [`Relay`].
pub struct RelayBuilder {
    config: RelayConfig,
    quota: Option<Arc<dyn QuotaService>>,
    events: Option<Arc<dyn EventHandler>>,
    http: Option<reqwest::Client>,
    source: Option<Arc<dyn ChannelSource>>,
}

impl RelayBuilder {
    /// Use an external quota service. Default: [`NoopQuota`].
    pub fn quota(mut self, quota: Arc<dyn QuotaService>) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Pull channel definitions from `source` on the configured cadence.
    pub fn channel_source(mut self, source: Arc<dyn ChannelSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Observe lifecycle events.
    pub fn events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Use a shared HTTP client for dispatch and health probes.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Assemble the relay.
    pub fn build(self) -> Result<Relay> {
        let config = self.config;
        let quota = self.quota.unwrap_or_else(|| Arc::new(NoopQuota));
        let http = self.http.unwrap_or_default();

        let cache = Arc::new(ChannelCache::new());

        let breaker_config = BreakerConfig {
            failure_threshold: config.load_balancer.breaker_failure_threshold,
            success_threshold: config.load_balancer.breaker_success_threshold,
            timeout: config.load_balancer.breaker_timeout,
        };
        let mut breakers = BreakerRegistry::new(breaker_config);
        if let Some(ref events) = self.events {
            breakers = breakers.with_events(events.clone());
        }
        let breakers = Arc::new(breakers);

        let mut balancer = LoadBalancer::new(
            cache.clone(),
            breakers.clone(),
            config.load_balancer.clone(),
        );
        if let Some(ref events) = self.events {
            balancer = balancer.with_events(events.clone());
        }
        let balancer = Arc::new(balancer);

        let mut health = HealthChecker::new(cache.clone(), config.health_check.clone())
            .with_breakers(breakers.clone())
            .with_http_client(http.clone());
        if let Some(ref events) = self.events {
            health = health.with_events(events.clone());
        }
        let health = Arc::new(health);

        let mut body_cache = BodyCache::new(config.body_cache.clone());
        if let Some(ref events) = self.events {
            body_cache = body_cache.with_events(events.clone());
        }
        let body_cache = Arc::new(body_cache);

        let mut streams = StreamManager::new(config.stream.clone());
        if let Some(ref events) = self.events {
            streams = streams.with_events(events.clone());
        }
        let streams = Arc::new(streams);

        let keys = Arc::new(KeyPool::new(config.key_pool.clone()));

        let mut client = RequestClient::new(
            cache.clone(),
            balancer.clone(),
            keys.clone(),
            body_cache.clone(),
            breakers.clone(),
            config.retry.clone(),
        )
        .with_http_client(http);
        if let Some(ref events) = self.events {
            client = client.with_events(events.clone());
        }
        let client = Arc::new(client);

        let mut factory = HandlerFactory::new(client.clone(), quota);
        if let Some(ref events) = self.events {
            factory = factory.with_events(events.clone());
        }
        let registry = Arc::new(HandlerRegistry::new());
        factory.register_all(&registry)?;
        let handlers = Arc::new(HandlerManager::new(registry));

        Ok(Relay {
            cache,
            keys,
            breakers,
            balancer,
            health,
            body_cache,
            streams,
            client,
            handlers,
            source: self.source,
            refresh_interval: config.channel_refresh_interval,
            refresh_task: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
            started: AtomicBool::new(false),
        })
    }
}

impl std::fmt::Debug for RelayBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBuilder")
            .field("has_quota", &self.quota.is_some())
            .field("has_events", &self.events.is_some())
            .finish()
    }
}
