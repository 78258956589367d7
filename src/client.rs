//! Request client: retry loop, channel fail-over, key attachment, and
//! metric accounting.
//!
//! [`RequestClient::execute`] drains the request body into the body
//! cache once (so retries can replay it), then drives the retry policy
//! with a closure that selects a channel on attempt 0 and switches to the
//! next eligible channel on later attempts, picks a key for the channel's
//! type, issues a single HTTP call with the key as bearer credentials,
//! and updates channel, key, and breaker state from the outcome.
//! [`RequestClient::execute_stream`] does the same but hands back live
//! chunk and error channels fed by a pump task.

use crate::balancer::{LoadBalancer, SelectOptions};
use crate::body_cache::BodyCache;
use crate::breaker::BreakerRegistry;
use crate::cache::ChannelCache;
use crate::channel::{Channel, ChannelStatus};
use crate::error::{RelayError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::keypool::{ApiKey, KeyPool};
use crate::retry::RetryPolicy;
use crate::sse::{SseDecoder, SseEvent};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Consecutive failures at which a channel is marked DEGRADED.
const DEGRADED_AFTER: u32 = 5;
/// Consecutive failures at which a channel is marked UNAVAILABLE.
const UNAVAILABLE_AFTER: u32 = 10;

/// A completed non-streaming upstream response.
#[derive(Debug)]
pub struct RelayResponse {
    /// Upstream status code.
    pub status: u16,
    /// Upstream response headers.
    pub headers: HeaderMap,
    /// Upstream response body.
    pub body: Vec<u8>,
    /// Channel that served the request.
    pub channel_id: u64,
    /// Round-trip latency.
    pub latency: Duration,
}

/// A live streaming upstream response.
pub struct UpstreamStream {
    /// Channel serving the stream.
    pub channel_id: u64,
    /// Name of the serving channel.
    pub channel_name: String,
    /// Upstream status code (headers already received).
    pub status: u16,
    /// Decoded upstream chunks.
    pub chunks: mpsc::Receiver<Value>,
    /// Mid-stream failures.
    pub errors: mpsc::Receiver<RelayError>,
}

/// Point-in-time statistics for one channel.
#[derive(Debug, Clone)]
pub struct ChannelStatsSnapshot {
    /// Channel id.
    pub id: u64,
    /// Channel name.
    pub name: String,
    /// Requests that entered flight.
    pub total_requests: u64,
    /// Successful completions.
    pub successful_requests: u64,
    /// Failed completions.
    pub failed_requests: u64,
    /// Success rate in `[0, 1]`.
    pub success_rate: f64,
    /// Running mean latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Requests currently in flight.
    pub current_concurrency: i64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Reported status.
    pub status: ChannelStatus,
}

/// The request client.
pub struct RequestClient {
    http: reqwest::Client,
    cache: Arc<ChannelCache>,
    balancer: Arc<LoadBalancer>,
    keys: Arc<KeyPool>,
    body_cache: Arc<BodyCache>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    channel_switches: AtomicU64,
    events: Option<Arc<dyn EventHandler>>,
}

impl RequestClient {
    /// A client over the given shared resources.
    pub fn new(
        cache: Arc<ChannelCache>,
        balancer: Arc<LoadBalancer>,
        keys: Arc<KeyPool>,
        body_cache: Arc<BodyCache>,
        breakers: Arc<BreakerRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            cache,
            balancer,
            keys,
            body_cache,
            breakers,
            retry,
            channel_switches: AtomicU64::new(0),
            events: None,
        }
    }

    /// Use a shared HTTP client instead of a private one.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Attach an event handler.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// The active retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Total channel switches across the client's lifetime.
    pub fn channel_switches(&self) -> u64 {
        self.channel_switches.load(Ordering::Relaxed)
    }

    /// Issue a request with retry and channel fail-over.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
        headers: HeaderMap,
        opts: &SelectOptions,
    ) -> Result<RelayResponse> {
        let cache_id = match body {
            Some(bytes) => Some(self.body_cache.put(bytes).await?),
            None => None,
        };

        let failed_channels = Mutex::new(Vec::<u64>::new());
        let last_channel = Mutex::new(None::<u64>);
        let failed_ref = &failed_channels;
        let last_ref = &last_channel;
        let cache_id_ref = &cache_id;

        self.retry
            .run(cancel, |attempt| {
                let method = method.clone();
                let headers = headers.clone();
                let opts = opts.clone();
                async move {
                    let (channel, key) =
                        self.pick_route(&opts, attempt, failed_ref, last_ref)?;

                    let body = match cache_id_ref {
                        Some(id) => Some(self.body_cache.get(id).await?),
                        None => None,
                    };

                    let outcome = self
                        .send_once(cancel, &channel, &key, method, path, body, headers)
                        .await;
                    if outcome.is_err() {
                        failed_ref.lock().push(channel.id);
                    }
                    outcome
                }
            })
            .await
    }

    /// Issue a streaming request with retry and channel fail-over,
    /// handing back live chunk and error channels once the upstream
    /// accepts the request.
    pub async fn execute_stream(
        &self,
        cancel: &CancellationToken,
        path: &str,
        body: Option<&[u8]>,
        headers: HeaderMap,
        opts: &SelectOptions,
    ) -> Result<UpstreamStream> {
        let cache_id = match body {
            Some(bytes) => Some(self.body_cache.put(bytes).await?),
            None => None,
        };

        let failed_channels = Mutex::new(Vec::<u64>::new());
        let last_channel = Mutex::new(None::<u64>);
        let failed_ref = &failed_channels;
        let last_ref = &last_channel;
        let cache_id_ref = &cache_id;

        self.retry
            .run(cancel, |attempt| {
                let headers = headers.clone();
                let opts = opts.clone();
                async move {
                    let (channel, key) =
                        self.pick_route(&opts, attempt, failed_ref, last_ref)?;

                    let body = match cache_id_ref {
                        Some(id) => Some(self.body_cache.get(id).await?),
                        None => None,
                    };

                    let outcome = self
                        .open_stream(cancel, &channel, &key, path, body, headers)
                        .await;
                    if outcome.is_err() {
                        failed_ref.lock().push(channel.id);
                    }
                    outcome
                }
            })
            .await
    }

    /// Select the channel and key for one attempt, tracking fail-over.
    fn pick_route(
        &self,
        opts: &SelectOptions,
        attempt: u32,
        failed: &Mutex<Vec<u64>>,
        last: &Mutex<Option<u64>>,
    ) -> Result<(Arc<Channel>, Arc<ApiKey>)> {
        let mut select_opts = opts.clone();
        select_opts.excluded_ids.extend(failed.lock().iter().copied());

        let channel = match self.balancer.select(&select_opts) {
            Ok(channel) => channel,
            Err(err) => {
                // Every remaining channel failed this request already;
                // fall back to the full candidate set rather than give up.
                if attempt > 0 && !failed.lock().is_empty() {
                    failed.lock().clear();
                    self.balancer.select(opts)?
                } else {
                    return Err(err);
                }
            }
        };

        let mut last = last.lock();
        if attempt > 0 {
            if let Some(previous) = *last {
                if previous != channel.id {
                    self.channel_switches.fetch_add(1, Ordering::Relaxed);
                    emit(
                        &self.events,
                        Event::ChannelSwitch {
                            from: previous,
                            to: channel.id,
                            attempt,
                        },
                    );
                }
            }
        }
        *last = Some(channel.id);
        drop(last);

        let key = self.keys.select_key(&channel.channel_type)?;
        Ok((channel, key))
    }

    /// One HTTP attempt against one channel.
    async fn send_once(
        &self,
        cancel: &CancellationToken,
        channel: &Arc<Channel>,
        key: &Arc<ApiKey>,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        headers: HeaderMap,
    ) -> Result<RelayResponse> {
        let url = format!("{}{}", channel.base_url.trim_end_matches('/'), path);
        channel.metrics.begin_request();
        let started = Instant::now();

        let mut request = self
            .http
            .request(method, &url)
            .headers(headers)
            .bearer_auth(&key.secret);
        if let Some(bytes) = body {
            request = request.header(CONTENT_TYPE, "application/json").body(bytes);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                channel.metrics.abort_request();
                return Err(RelayError::Cancelled);
            }
            response = request.send() => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.record_failure(channel, key);
                return Err(RelayError::Request(err));
            }
        };

        let status = response.status().as_u16();
        if status >= 400 {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            self.record_failure(channel, key);
            return Err(RelayError::Upstream {
                status,
                body,
                retry_after,
            });
        }

        let response_headers = response.headers().clone();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.record_failure(channel, key);
                return Err(RelayError::Request(err));
            }
        };

        let latency = started.elapsed();
        self.record_success(channel, key, latency);

        Ok(RelayResponse {
            status,
            headers: response_headers,
            body: bytes.to_vec(),
            channel_id: channel.id,
            latency,
        })
    }

    /// One streaming HTTP attempt: send, classify the status, then spawn
    /// the pump feeding decoded chunks into bounded channels.
    async fn open_stream(
        &self,
        cancel: &CancellationToken,
        channel: &Arc<Channel>,
        key: &Arc<ApiKey>,
        path: &str,
        body: Option<Vec<u8>>,
        headers: HeaderMap,
    ) -> Result<UpstreamStream> {
        let url = format!("{}{}", channel.base_url.trim_end_matches('/'), path);
        channel.metrics.begin_request();
        let started = Instant::now();

        let mut request = self
            .http
            .post(&url)
            .headers(headers)
            .bearer_auth(&key.secret);
        if let Some(bytes) = body {
            request = request.header(CONTENT_TYPE, "application/json").body(bytes);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                channel.metrics.abort_request();
                return Err(RelayError::Cancelled);
            }
            response = request.send() => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.record_failure(channel, key);
                return Err(RelayError::Request(err));
            }
        };

        let status = response.status().as_u16();
        if status >= 400 {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            self.record_failure(channel, key);
            return Err(RelayError::Upstream {
                status,
                body,
                retry_after,
            });
        }

        let latency = started.elapsed();
        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        let (error_tx, error_rx) = mpsc::channel(4);

        let pump_channel = channel.clone();
        let pump_key = key.clone();
        let pump_breakers = self.breakers.clone();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            loop {
                let item = tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    item = stream.next() => item,
                };
                let Some(item) = item else {
                    // Upstream closed without [DONE]; flush what remains.
                    if let Some(SseEvent::Message { data, .. }) = decoder.flush() {
                        if let Ok(value) = serde_json::from_str::<Value>(&data) {
                            let _ = chunk_tx.send(value).await;
                        }
                    }
                    record_stream_success(&pump_channel, &pump_key, &pump_breakers, latency);
                    return;
                };

                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        record_stream_failure(&pump_channel, &pump_key, &pump_breakers);
                        let _ = error_tx.send(RelayError::Request(err)).await;
                        return;
                    }
                };

                for event in decoder.decode(&bytes) {
                    match event {
                        SseEvent::Done => {
                            record_stream_success(&pump_channel, &pump_key, &pump_breakers, latency);
                            return;
                        }
                        SseEvent::Message { event, data } => {
                            if event.as_deref() == Some("error") {
                                record_stream_failure(&pump_channel, &pump_key, &pump_breakers);
                                let _ = error_tx.send(RelayError::Other(data)).await;
                                return;
                            }
                            if let Ok(value) = serde_json::from_str::<Value>(&data) {
                                if chunk_tx.send(value).await.is_err() {
                                    // Consumer went away; count the work done.
                                    record_stream_success(
                                        &pump_channel,
                                        &pump_key,
                                        &pump_breakers,
                                        latency,
                                    );
                                    return;
                                }
                            }
                        }
                    }
                }
            }
            // Cancelled mid-stream.
            pump_channel.metrics.abort_request();
        });

        Ok(UpstreamStream {
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            status,
            chunks: chunk_rx,
            errors: error_rx,
        })
    }

    fn record_success(&self, channel: &Arc<Channel>, key: &Arc<ApiKey>, latency: Duration) {
        channel.metrics.record_success(latency);
        key.record_usage(true, 0);
        self.breakers.on_success(channel.id);
    }

    fn record_failure(&self, channel: &Arc<Channel>, key: &Arc<ApiKey>) {
        let consecutive = channel.metrics.record_failure();
        apply_failure_thresholds(channel, consecutive);
        key.record_usage(false, 0);
        self.breakers.on_failure(channel.id);
    }

    /// Per-channel statistics for operators.
    pub fn channel_stats(&self, channel_id: u64) -> Result<ChannelStatsSnapshot> {
        let channel = self.cache.get(channel_id)?;
        Ok(snapshot(&channel))
    }

    /// Statistics for every registered channel.
    pub fn all_channel_stats(&self) -> Vec<ChannelStatsSnapshot> {
        self.cache.all().iter().map(|c| snapshot(c)).collect()
    }

    /// Operator reset: clear a channel's consecutive-failure counter and
    /// its breaker.
    pub fn reset_channel_failures(&self, channel_id: u64) -> Result<()> {
        let channel = self.cache.get(channel_id)?;
        channel.metrics.reset_consecutive_failures();
        self.breakers.reset(channel_id);
        Ok(())
    }
}

impl std::fmt::Debug for RequestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestClient")
            .field("channels", &self.cache.len())
            .field("channel_switches", &self.channel_switches())
            .finish()
    }
}

fn snapshot(channel: &Arc<Channel>) -> ChannelStatsSnapshot {
    let metrics = &channel.metrics;
    ChannelStatsSnapshot {
        id: channel.id,
        name: channel.name.clone(),
        total_requests: metrics.total_requests(),
        successful_requests: metrics.successful_requests(),
        failed_requests: metrics.failed_requests(),
        success_rate: metrics.success_rate(),
        avg_latency_ms: metrics.avg_latency_ms(),
        current_concurrency: metrics.current_concurrency(),
        consecutive_failures: metrics.consecutive_failures(),
        status: channel.status(),
    }
}

/// Escalate channel status as consecutive failures accumulate.
fn apply_failure_thresholds(channel: &Arc<Channel>, consecutive: u32) {
    if consecutive >= UNAVAILABLE_AFTER {
        channel.set_status(ChannelStatus::Unavailable);
    } else if consecutive >= DEGRADED_AFTER {
        channel.set_status(ChannelStatus::Degraded);
    }
}

fn record_stream_success(
    channel: &Arc<Channel>,
    key: &Arc<ApiKey>,
    breakers: &Arc<BreakerRegistry>,
    latency: Duration,
) {
    channel.metrics.record_success(latency);
    key.record_usage(true, 0);
    breakers.on_success(channel.id);
}

fn record_stream_failure(channel: &Arc<Channel>, key: &Arc<ApiKey>, breakers: &Arc<BreakerRegistry>) {
    let consecutive = channel.metrics.record_failure();
    apply_failure_thresholds(channel, consecutive);
    key.record_usage(false, 0);
    breakers.on_failure(channel.id);
}

/// Parse a `Retry-After` header as integer seconds.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::config::{BodyCacheConfig, KeyPoolConfig, LoadBalancerConfig};

    fn unreachable_channel(id: u64) -> Arc<Channel> {
        // Port 1 refuses connections immediately.
        Arc::new(
            Channel::new(id, format!("ch-{}", id), "http://127.0.0.1:1", "openai")
                .with_models(["gpt-4o"]),
        )
    }

    fn client_with(channels: Vec<Arc<Channel>>, retry: RetryPolicy) -> RequestClient {
        let cache = Arc::new(ChannelCache::new());
        for channel in channels {
            cache.add(channel);
        }
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 100,
            ..BreakerConfig::default()
        }));
        let balancer = Arc::new(LoadBalancer::new(
            cache.clone(),
            breakers.clone(),
            LoadBalancerConfig::default(),
        ));
        let keys = Arc::new(KeyPool::new(KeyPoolConfig::default()));
        keys.add_key("openai", ApiKey::new("k1", "sk-test"));
        let body_cache = Arc::new(BodyCache::new(BodyCacheConfig::memory_only()));

        RequestClient::new(cache, balancer, keys, body_cache, breakers, retry)
    }

    #[tokio::test]
    async fn test_execute_no_channels_is_no_candidate() {
        let client = client_with(vec![], RetryPolicy::none());
        let cancel = CancellationToken::new();

        let err = client
            .execute(
                &cancel,
                Method::POST,
                "/v1/chat/completions",
                None,
                HeaderMap::new(),
                &SelectOptions::for_model("gpt-4o"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoCandidate { resource: "channels", .. }));
    }

    #[tokio::test]
    async fn test_execute_no_keys_is_no_candidate() {
        let cache = Arc::new(ChannelCache::new());
        cache.add(unreachable_channel(1));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let balancer = Arc::new(LoadBalancer::new(
            cache.clone(),
            breakers.clone(),
            LoadBalancerConfig::default(),
        ));
        let keys = Arc::new(KeyPool::new(KeyPoolConfig::default()));
        let body_cache = Arc::new(BodyCache::new(BodyCacheConfig::memory_only()));
        let client = RequestClient::new(
            cache,
            balancer,
            keys,
            body_cache,
            breakers,
            RetryPolicy::none(),
        );
        let cancel = CancellationToken::new();

        let err = client
            .execute(
                &cancel,
                Method::POST,
                "/v1/chat/completions",
                None,
                HeaderMap::new(),
                &SelectOptions::for_model("gpt-4o"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoCandidate { resource: "keys", .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let client = client_with(vec![unreachable_channel(1)], RetryPolicy::none());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .execute(
                &cancel,
                Method::POST,
                "/v1/chat/completions",
                None,
                HeaderMap::new(),
                &SelectOptions::for_model("gpt-4o"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
    }

    #[tokio::test]
    async fn test_transport_failure_records_metrics() {
        let channel = unreachable_channel(1);
        let client = client_with(vec![channel.clone()], RetryPolicy::none());
        let cancel = CancellationToken::new();

        let err = client
            .execute(
                &cancel,
                Method::POST,
                "/v1/chat/completions",
                Some(b"{\"model\":\"gpt-4o\"}"),
                HeaderMap::new(),
                &SelectOptions::for_model("gpt-4o"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Request(_)));

        assert_eq!(channel.metrics.total_requests(), 1);
        assert_eq!(channel.metrics.failed_requests(), 1);
        assert_eq!(channel.metrics.consecutive_failures(), 1);

        // The key recorded the failure too.
        let key = client.keys.keys_for("openai").remove(0);
        assert_eq!(key.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_thresholds_escalate_status() {
        let channel = unreachable_channel(1);
        let client = client_with(vec![channel.clone()], RetryPolicy::none());
        let cancel = CancellationToken::new();
        let opts = SelectOptions::for_model("gpt-4o");

        for _ in 0..DEGRADED_AFTER {
            let _ = client
                .execute(&cancel, Method::POST, "/x", None, HeaderMap::new(), &opts)
                .await;
        }
        assert_eq!(channel.status(), ChannelStatus::Degraded);

        // Selection now requires ignoring the degraded status, so drive
        // the remaining failures directly through the accounting path.
        let key = client.keys.keys_for("openai").remove(0);
        for _ in 0..(UNAVAILABLE_AFTER - DEGRADED_AFTER) {
            channel.metrics.begin_request();
            record_stream_failure(&channel, &key, &client.breakers);
        }
        assert_eq!(channel.status(), ChannelStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_fail_over_switches_channels() {
        let first = unreachable_channel(1);
        let second = unreachable_channel(2);
        let retry = RetryPolicy::none()
            .with_max_retries(1)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        let client = client_with(vec![first, second], retry);
        let cancel = CancellationToken::new();

        let _ = client
            .execute(
                &cancel,
                Method::POST,
                "/v1/chat/completions",
                None,
                HeaderMap::new(),
                &SelectOptions::for_model("gpt-4o"),
            )
            .await;

        assert_eq!(client.channel_switches(), 1, "attempt 2 moved to the other channel");
    }

    #[tokio::test]
    async fn test_reset_channel_failures() {
        let channel = unreachable_channel(1);
        let client = client_with(vec![channel.clone()], RetryPolicy::none());
        let cancel = CancellationToken::new();

        let _ = client
            .execute(
                &cancel,
                Method::POST,
                "/x",
                None,
                HeaderMap::new(),
                &SelectOptions::for_model("gpt-4o"),
            )
            .await;
        assert_eq!(channel.metrics.consecutive_failures(), 1);

        client.reset_channel_failures(1).expect("channel exists");
        assert_eq!(channel.metrics.consecutive_failures(), 0);
        assert!(client.reset_channel_failures(99).is_err());
    }

    #[tokio::test]
    async fn test_channel_stats_snapshot() {
        let channel = unreachable_channel(1);
        channel.metrics.begin_request();
        channel.metrics.record_success(Duration::from_millis(120));
        let client = client_with(vec![channel], RetryPolicy::none());

        let stats = client.channel_stats(1).expect("registered");
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.successful_requests, 1);
        assert!((stats.avg_latency_ms - 120.0).abs() < 1.0);
        assert_eq!(stats.status, ChannelStatus::Healthy);

        assert_eq!(client.all_channel_stats().len(), 1);
        assert!(client.channel_stats(42).is_err());
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "30".parse().expect("header value"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(30)));

        let mut headers = HeaderMap::new();
        headers.insert(
            "retry-after",
            "Wed, 21 Oct 2026 07:28:00 GMT".parse().expect("header value"),
        );
        assert_eq!(parse_retry_after(&headers), None);

        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }
}
