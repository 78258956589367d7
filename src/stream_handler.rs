//! Streaming pipeline: upstream chunks to SSE frames, token counting,
//! timeout enforcement, and quota reconciliation.
//!
//! [`StreamHandler::handle`] drives one SSE response with a four-way
//! select over the upstream chunk channel, the upstream error channel,
//! an idle timer re-armed per chunk, and caller cancellation wrapped in a
//! total timeout. Whatever way the loop exits, the finalizer runs: the
//! token counter settles and the quota service receives a post-consume
//! record so unused reservation is refunded.

use crate::error::{RelayError, Result, TimeoutKind};
use crate::events::{emit, Event, EventHandler};
use crate::quota::{PostConsumeRequest, QuotaService};
use crate::retry::RetryPolicy;
use crate::sse::SseFrame;
use crate::tokens::StreamTokenCounter;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Destination for outgoing SSE frames.
///
/// The HTTP layer implements this over its response writer; tests and
/// the fan-out use the [`ChannelSink`] adapter.
#[async_trait]
pub trait SseSink: Send + Sync {
    /// Deliver one frame to the client.
    async fn send(&self, frame: SseFrame) -> Result<()>;
}

/// An [`SseSink`] writing into a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink(pub mpsc::Sender<SseFrame>);

#[async_trait]
impl SseSink for ChannelSink {
    async fn send(&self, frame: SseFrame) -> Result<()> {
        self.0
            .send(frame)
            .await
            .map_err(|_| RelayError::Other("SSE sink closed".into()))
    }
}

/// Options for one streaming response.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Relay-assigned request id.
    pub request_id: String,
    /// Owning session id.
    pub session_id: String,
    /// Requesting user.
    pub user_id: String,
    /// API token the user authenticated with.
    pub token_id: String,
    /// Model serving the stream.
    pub model: String,
    /// Prompt text, for the prompt-token estimate.
    pub prompt: String,
    /// Idle window between chunks. Default: 30 seconds.
    pub idle_timeout: Duration,
    /// Ceiling on the whole stream. Default: 5 minutes.
    pub total_timeout: Duration,
}

impl StreamOptions {
    /// Options with default timeouts.
    pub fn new(
        request_id: impl Into<String>,
        session_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            session_id: session_id.into(),
            user_id: String::new(),
            token_id: String::new(),
            model: model.into(),
            prompt: String::new(),
            idle_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(300),
        }
    }

    /// Set the requesting user.
    pub fn with_user(mut self, user_id: impl Into<String>, token_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.token_id = token_id.into();
        self
    }

    /// Set the prompt text for token estimation.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the total timeout.
    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = timeout;
        self
    }
}

/// Summary of one completed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamResult {
    /// Estimated prompt tokens.
    pub prompt_tokens: u64,
    /// Estimated completion tokens.
    pub completion_tokens: u64,
    /// Sum of both.
    pub total_tokens: u64,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Chunks forwarded to the sink.
    pub chunk_count: u64,
}

/// Extract the text delta from an upstream chunk.
///
/// Understands the OpenAI chat shape (`choices[0].delta.content`), the
/// message shape (`message.content`), and the bare `response` field.
pub fn extract_delta(chunk: &Value) -> Option<&str> {
    if let Some(content) = chunk
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
    {
        return Some(content);
    }
    if let Some(content) = chunk
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
    {
        return Some(content);
    }
    chunk.get("response").and_then(Value::as_str)
}

/// Drives streaming responses and settles quota for them.
pub struct StreamHandler {
    quota: Arc<dyn QuotaService>,
    events: Option<Arc<dyn EventHandler>>,
}

impl StreamHandler {
    /// A handler settling usage against `quota`.
    pub fn new(quota: Arc<dyn QuotaService>) -> Self {
        Self {
            quota,
            events: None,
        }
    }

    /// Attach an event handler.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Pump one upstream stream to `sink`.
    ///
    /// Loops over four sources: upstream chunks (forwarded as data
    /// frames and token-counted), upstream errors (forwarded as a
    /// sanitized `error` event, then returned), the idle timer, and the
    /// caller's cancellation under a total timeout. The quota finalizer
    /// runs on every exit path.
    pub async fn handle(
        &self,
        cancel: &CancellationToken,
        sink: &dyn SseSink,
        mut chunks: mpsc::Receiver<Value>,
        mut errors: mpsc::Receiver<RelayError>,
        opts: &StreamOptions,
    ) -> Result<StreamResult> {
        let started = Instant::now();
        let mut counter = StreamTokenCounter::new(&opts.model, &opts.prompt);
        let mut chunk_count = 0u64;

        emit(
            &self.events,
            Event::StreamStarted {
                session_id: opts.session_id.clone(),
                model: opts.model.clone(),
            },
        );

        let total_deadline = tokio::time::sleep(opts.total_timeout);
        tokio::pin!(total_deadline);
        let idle = tokio::time::sleep(opts.idle_timeout);
        tokio::pin!(idle);

        let mut errors_open = true;
        let outcome: Result<()> = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break Err(RelayError::Cancelled);
                }
                _ = &mut total_deadline => {
                    break Err(RelayError::Timeout(TimeoutKind::Total));
                }
                _ = &mut idle => {
                    break Err(RelayError::Timeout(TimeoutKind::Idle));
                }
                upstream_error = errors.recv(), if errors_open => {
                    match upstream_error {
                        Some(err) => break Err(err),
                        None => errors_open = false,
                    }
                }
                chunk = chunks.recv() => {
                    match chunk {
                        Some(value) => {
                            if let Some(delta) = extract_delta(&value) {
                                counter.feed(delta);
                            }
                            let frame = SseFrame::data(value.to_string())
                                .with_id(format!("{}-{}", opts.request_id, chunk_count));
                            if let Err(err) = sink.send(frame).await {
                                break Err(err);
                            }
                            chunk_count += 1;
                            idle.as_mut().reset(tokio::time::Instant::now() + opts.idle_timeout);
                        }
                        None => break Ok(()),
                    }
                }
            }
        };

        // Surface stream errors to the client before closing. The
        // finalizer below must run regardless, so sink failures are
        // folded into the outcome instead of returned early.
        let outcome = match outcome {
            Ok(()) => sink.send(SseFrame::done()).await,
            Err(err) => {
                let _ = sink.send(SseFrame::error(&err.public_message())).await;
                Err(err)
            }
        };

        self.finalize(&counter, started, chunk_count, &outcome, opts).await;

        let usage = counter.finalize();
        outcome.map(|()| StreamResult {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            duration: started.elapsed(),
            chunk_count,
        })
    }

    /// Run a stream with retry: `producer` is invoked per attempt and
    /// must return fresh chunk and error channels. Retryable failures
    /// reset the token counter and reuse the same sink; the quota
    /// finalizer inside [`handle`](Self::handle) runs per attempt.
    pub async fn handle_with_retry<F, Fut>(
        &self,
        cancel: &CancellationToken,
        sink: &dyn SseSink,
        opts: &StreamOptions,
        policy: &RetryPolicy,
        mut producer: F,
    ) -> Result<StreamResult>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(mpsc::Receiver<Value>, mpsc::Receiver<RelayError>)>>,
    {
        let mut last_error: Option<RelayError> = None;

        for attempt in 0..=policy.max_retries {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            if attempt > 0 {
                let delay = policy.delay_for_attempt(attempt - 1);
                emit(
                    &self.events,
                    Event::RetryScheduled {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        reason: last_error
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default(),
                    },
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let (chunks, errors) = match producer(attempt).await {
                Ok(channels) => channels,
                Err(err) => {
                    if attempt < policy.max_retries && policy.is_retryable(&err) {
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            };

            match self.handle(cancel, sink, chunks, errors, opts).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if attempt < policy.max_retries && policy.is_retryable(&err) {
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RelayError::Other("stream retry loop exited unexpectedly".into())))
    }

    /// The always-run finalizer: settle the counter against the quota
    /// service and report the stream outcome.
    async fn finalize(
        &self,
        counter: &StreamTokenCounter,
        started: Instant,
        chunk_count: u64,
        outcome: &Result<()>,
        opts: &StreamOptions,
    ) {
        let usage = counter.finalize();
        let success = outcome.is_ok();

        let record = PostConsumeRequest {
            request_id: opts.request_id.clone(),
            user_id: opts.user_id.clone(),
            token_id: opts.token_id.clone(),
            model: opts.model.clone(),
            usage,
            duration: started.elapsed(),
            success,
        };
        if let Err(err) = self.quota.post_consume(&record).await {
            tracing::warn!(request_id = %opts.request_id, error = %err, "quota post-consume failed");
        }

        emit(
            &self.events,
            Event::QuotaReconciled {
                request_id: opts.request_id.clone(),
                total_tokens: usage.total_tokens,
                refunded: !success,
            },
        );
        emit(
            &self.events,
            Event::StreamFinished {
                session_id: opts.session_id.clone(),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                chunk_count,
                duration_ms: started.elapsed().as_millis() as u64,
                ok: success,
            },
        );
    }
}

impl std::fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandler")
            .field("has_events", &self.events.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{NoopQuota, PreConsumeRequest, QuotaReservation};
    use parking_lot::Mutex;
    use serde_json::json;

    /// Records post-consume calls for assertions.
    #[derive(Default)]
    struct RecordingQuota {
        records: Mutex<Vec<PostConsumeRequest>>,
    }

    #[async_trait]
    impl QuotaService for RecordingQuota {
        async fn pre_consume(&self, req: &PreConsumeRequest) -> Result<QuotaReservation> {
            Ok(QuotaReservation {
                request_id: req.request_id.clone(),
                reserved_tokens: req.estimated_tokens,
            })
        }

        async fn return_pre_consumed(&self, _request_id: &str, _user_id: &str) -> Result<()> {
            Ok(())
        }

        async fn post_consume(&self, req: &PostConsumeRequest) -> Result<()> {
            self.records.lock().push(req.clone());
            Ok(())
        }
    }

    fn sink_pair(capacity: usize) -> (ChannelSink, mpsc::Receiver<SseFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ChannelSink(tx), rx)
    }

    fn opts() -> StreamOptions {
        StreamOptions::new("req-1", "sess-1", "gpt-4o")
            .with_user("user-1", "token-1")
            .with_prompt("testing!")
    }

    fn chunk(text: &str) -> Value {
        json!({"choices": [{"delta": {"content": text}}]})
    }

    #[test]
    fn test_extract_delta_shapes() {
        assert_eq!(extract_delta(&chunk("hi")), Some("hi"));
        assert_eq!(
            extract_delta(&json!({"message": {"content": "msg"}})),
            Some("msg")
        );
        assert_eq!(extract_delta(&json!({"response": "raw"})), Some("raw"));
        assert_eq!(extract_delta(&json!({"done": true})), None);
    }

    #[tokio::test]
    async fn test_clean_stream_produces_result() {
        let handler = StreamHandler::new(Arc::new(NoopQuota));
        let (sink, mut frames) = sink_pair(16);
        let (chunk_tx, chunk_rx) = mpsc::channel(16);
        let (_err_tx, err_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        chunk_tx.send(chunk("Hello")).await.expect("queued");
        chunk_tx.send(chunk(" world!!")).await.expect("queued");
        drop(chunk_tx);

        let result = handler
            .handle(&cancel, &sink, chunk_rx, err_rx, &opts())
            .await
            .expect("clean stream");

        assert_eq!(result.chunk_count, 2);
        // "testing!" -> 2 prompt tokens; "Hello world!!" (13 ascii) -> 4.
        assert_eq!(result.prompt_tokens, 2);
        assert_eq!(result.completion_tokens, 4);
        assert_eq!(result.total_tokens, 6);

        // Two data frames then [DONE].
        let first = frames.recv().await.expect("frame");
        assert!(first.data.contains("Hello"));
        let second = frames.recv().await.expect("frame");
        assert!(second.data.contains("world"));
        let done = frames.recv().await.expect("frame");
        assert!(done.is_done());
    }

    #[tokio::test]
    async fn test_upstream_error_becomes_error_event() {
        let handler = StreamHandler::new(Arc::new(NoopQuota));
        let (sink, mut frames) = sink_pair(16);
        let (chunk_tx, chunk_rx) = mpsc::channel(16);
        let (err_tx, err_rx) = mpsc::channel::<RelayError>(16);
        let cancel = CancellationToken::new();

        chunk_tx.send(chunk("partial")).await.expect("queued");
        err_tx
            .send(RelayError::Upstream {
                status: 502,
                body: "internal detail".into(),
                retry_after: None,
            })
            .await
            .expect("queued");

        let err = handler
            .handle(&cancel, &sink, chunk_rx, err_rx, &opts())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Upstream { status: 502, .. }));

        // The last frame is a sanitized error event.
        let mut last = None;
        while let Ok(frame) = frames.try_recv() {
            last = Some(frame);
        }
        let last = last.expect("frames sent");
        assert_eq!(last.event.as_deref(), Some("error"));
        assert!(last.data.contains("stream_error"));
        assert!(!last.data.contains("internal detail"));
    }

    #[tokio::test]
    async fn test_idle_timeout_fires() {
        let handler = StreamHandler::new(Arc::new(NoopQuota));
        let (sink, _frames) = sink_pair(16);
        let (_chunk_tx, chunk_rx) = mpsc::channel::<Value>(16);
        let (_err_tx, err_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let opts = opts().with_idle_timeout(Duration::from_millis(30));
        let err = handler
            .handle(&cancel, &sink, chunk_rx, err_rx, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout(TimeoutKind::Idle)));
    }

    #[tokio::test]
    async fn test_total_timeout_fires_despite_activity() {
        let handler = StreamHandler::new(Arc::new(NoopQuota));
        let (sink, mut frames) = sink_pair(256);
        let (chunk_tx, chunk_rx) = mpsc::channel(16);
        let (_err_tx, err_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        // A producer that keeps chunks flowing faster than the idle
        // window.
        tokio::spawn(async move {
            loop {
                if chunk_tx.send(chunk("x")).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        tokio::spawn(async move { while frames.recv().await.is_some() {} });

        let opts = opts()
            .with_idle_timeout(Duration::from_secs(5))
            .with_total_timeout(Duration::from_millis(80));
        let err = handler
            .handle(&cancel, &sink, chunk_rx, err_rx, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout(TimeoutKind::Total)));
    }

    #[tokio::test]
    async fn test_cancellation_stops_stream() {
        let handler = StreamHandler::new(Arc::new(NoopQuota));
        let (sink, _frames) = sink_pair(16);
        let (_chunk_tx, chunk_rx) = mpsc::channel::<Value>(16);
        let (_err_tx, err_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = handler
            .handle(&cancel, &sink, chunk_rx, err_rx, &opts())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
    }

    #[tokio::test]
    async fn test_finalizer_runs_on_error_path() {
        let quota = Arc::new(RecordingQuota::default());
        let handler = StreamHandler::new(quota.clone());
        let (sink, _frames) = sink_pair(16);
        let (_chunk_tx, chunk_rx) = mpsc::channel::<Value>(16);
        let (_err_tx, err_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let opts = opts().with_idle_timeout(Duration::from_millis(20));
        let _ = handler.handle(&cancel, &sink, chunk_rx, err_rx, &opts).await;

        let records = quota.records.lock();
        assert_eq!(records.len(), 1, "post-consume runs despite the timeout");
        assert!(!records[0].success);
        assert_eq!(records[0].request_id, "req-1");
    }

    #[tokio::test]
    async fn test_finalizer_reports_usage_on_success() {
        let quota = Arc::new(RecordingQuota::default());
        let handler = StreamHandler::new(quota.clone());
        let (sink, mut frames) = sink_pair(16);
        let (chunk_tx, chunk_rx) = mpsc::channel(16);
        let (_err_tx, err_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        chunk_tx.send(chunk("abcdefgh")).await.expect("queued");
        drop(chunk_tx);
        tokio::spawn(async move { while frames.recv().await.is_some() {} });

        handler
            .handle(&cancel, &sink, chunk_rx, err_rx, &opts())
            .await
            .expect("clean stream");

        let records = quota.records.lock();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].usage.completion_tokens, 2);
    }

    #[tokio::test]
    async fn test_retry_reuses_sink_and_resets_counter() {
        let handler = StreamHandler::new(Arc::new(NoopQuota));
        let (sink, mut frames) = sink_pair(64);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::default()
            .with_max_retries(2)
            .with_initial_delay(Duration::from_millis(5))
            .with_jitter(false);

        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempt_counter = attempts.clone();

        let result = handler
            .handle_with_retry(&cancel, &sink, &opts(), &policy, move |_| {
                let n = attempt_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    let (chunk_tx, chunk_rx) = mpsc::channel(16);
                    let (err_tx, err_rx) = mpsc::channel(16);
                    if n == 0 {
                        // First attempt dies mid-stream with a retryable
                        // error.
                        chunk_tx.send(chunk("doomed")).await.ok();
                        err_tx
                            .send(RelayError::Upstream {
                                status: 503,
                                body: "unavailable".into(),
                                retry_after: None,
                            })
                            .await
                            .ok();
                    } else {
                        chunk_tx.send(chunk("recovered")).await.ok();
                        drop(chunk_tx);
                    }
                    Ok((chunk_rx, err_rx))
                }
            })
            .await
            .expect("second attempt succeeds");

        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
        // Counter reset: only the second attempt's text is counted.
        // "recovered" -> 9 ascii chars -> 3 tokens.
        assert_eq!(result.completion_tokens, 3);
        assert_eq!(result.chunk_count, 1);

        // The same sink carried frames from both attempts.
        let mut texts = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            texts.push(frame.data);
        }
        assert!(texts.iter().any(|t| t.contains("doomed")));
        assert!(texts.iter().any(|t| t.contains("recovered")));
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_non_retryable() {
        let handler = StreamHandler::new(Arc::new(NoopQuota));
        let (sink, _frames) = sink_pair(16);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::default().with_max_retries(3);

        let err = handler
            .handle_with_retry(&cancel, &sink, &opts(), &policy, |_| async {
                Err(RelayError::validation("bad request"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }
}
