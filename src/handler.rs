//! Typed request handlers: one per request class, behind a registry.
//!
//! A [`RelayHandler`] validates, dispatches, and (for chat) streams one
//! class of request over the shared [`RequestClient`]. The
//! [`HandlerRegistry`] maps classes to handlers and rejects duplicate
//! registration; [`HandlerManager`] adds a lookup cache and routes
//! envelopes; [`HandlerFactory`] manufactures the full set over one
//! client. Every streaming call walks the
//! `VALIDATING -> ACQUIRING_CHANNEL -> SENDING -> STREAMING -> FINALIZING
//! -> DONE` phase machine, with FINALIZING guaranteed on error paths so
//! quota and metrics always settle.

use crate::balancer::SelectOptions;
use crate::client::{RequestClient, RelayResponse};
use crate::error::{RelayError, Result};
use crate::events::EventHandler;
use crate::quota::{PreConsumeRequest, PostConsumeRequest, QuotaService};
use crate::stream_handler::{SseSink, StreamHandler, StreamOptions, StreamResult};
use crate::tokens::{estimate_tokens, TokenUsage};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Request class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Chat completions.
    Chat,
    /// Embeddings.
    Embedding,
    /// Image generation.
    Image,
    /// Audio transcription / generation.
    Audio,
}

impl RequestKind {
    /// Short label for logs and routing.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Chat => "chat",
            RequestKind::Embedding => "embedding",
            RequestKind::Image => "image",
            RequestKind::Audio => "audio",
        }
    }
}

/// Uniform request envelope handed to a handler.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    /// Request class.
    pub kind: RequestKind,
    /// Relay-assigned request id.
    pub id: String,
    /// Requesting user.
    pub user_id: String,
    /// API token the user authenticated with.
    pub token_id: String,
    /// Requested model.
    pub model: String,
    /// Upstream path (e.g. `/v1/chat/completions`).
    pub endpoint: String,
    /// Caller headers forwarded upstream.
    pub headers: HeaderMap,
    /// Raw body bytes, kept for replay across retries.
    pub body: Vec<u8>,
    /// Body-cache id when the body was already stored.
    pub body_cache_id: Option<String>,
    /// Caller cancellation signal.
    pub cancel: CancellationToken,
    /// Free-form extras (session id, region hints).
    pub metadata: HashMap<String, Value>,
}

impl HandlerRequest {
    /// An envelope with a fresh request id and empty metadata.
    pub fn new(kind: RequestKind, model: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            id: Uuid::new_v4().to_string(),
            user_id: String::new(),
            token_id: String::new(),
            model: model.into(),
            endpoint: endpoint.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            body_cache_id: None,
            cancel: CancellationToken::new(),
            metadata: HashMap::new(),
        }
    }

    /// Set the requesting user.
    pub fn with_user(mut self, user_id: impl Into<String>, token_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.token_id = token_id.into();
        self
    }

    /// Set the raw body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Parse the body as JSON.
    pub fn body_json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The session id from metadata, falling back to the request id.
    pub fn session_id(&self) -> String {
        self.metadata
            .get("session_id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| self.id.clone())
    }
}

/// Uniform response envelope.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    /// Upstream status code.
    pub status: u16,
    /// Upstream response headers.
    pub headers: HeaderMap,
    /// Upstream response body.
    pub body: Vec<u8>,
    /// Channel that served the request, when known.
    pub channel_id: Option<u64>,
}

impl From<RelayResponse> for HandlerResponse {
    fn from(response: RelayResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            channel_id: Some(response.channel_id),
        }
    }
}

/// Phases of one streaming handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerPhase {
    /// Checking the envelope.
    Validating,
    /// Selecting a channel and key.
    AcquiringChannel,
    /// Issuing the upstream request.
    Sending,
    /// Pumping chunks.
    Streaming,
    /// Settling quota and metrics. Always reached, even after ERROR.
    Finalizing,
    /// Clean terminal state.
    Done,
    /// Failure terminal state (before finalization).
    Error,
}

impl HandlerPhase {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance(self, next: HandlerPhase) -> bool {
        use HandlerPhase::*;
        match (self, next) {
            (Validating, AcquiringChannel)
            | (AcquiringChannel, Sending)
            | (Sending, Streaming)
            | (Streaming, Finalizing)
            | (Finalizing, Done)
            | (Error, Finalizing) => true,
            // ERROR is reachable from any non-terminal phase.
            (Validating | AcquiringChannel | Sending | Streaming, Error) => true,
            _ => false,
        }
    }
}

/// Tracks the phase machine for one call.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: HandlerPhase,
}

impl PhaseTracker {
    /// Starts in VALIDATING.
    pub fn new() -> Self {
        Self {
            phase: HandlerPhase::Validating,
        }
    }

    /// The current phase.
    pub fn phase(&self) -> HandlerPhase {
        self.phase
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn advance(&mut self, next: HandlerPhase) -> Result<()> {
        if !self.phase.can_advance(next) {
            return Err(RelayError::Other(format!(
                "illegal handler phase transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free per-handler counters.
#[derive(Debug, Default)]
pub struct HandlerStats {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    streamed: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl HandlerStats {
    fn record(&self, success: bool, streamed: bool, latency_ms: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        if streamed {
            self.streamed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HandlerStatsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);
        HandlerStatsSnapshot {
            requests,
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            streamed: self.streamed.load(Ordering::Relaxed),
            avg_latency_ms: if requests == 0 {
                0.0
            } else {
                total_latency as f64 / requests as f64
            },
        }
    }
}

/// Point-in-time handler statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandlerStatsSnapshot {
    /// Requests handled.
    pub requests: u64,
    /// Successful completions.
    pub successes: u64,
    /// Failed completions.
    pub failures: u64,
    /// Streaming calls.
    pub streamed: u64,
    /// Mean handling latency in milliseconds.
    pub avg_latency_ms: f64,
}

/// One request class's handler.
#[async_trait]
pub trait RelayHandler: Send + Sync {
    /// The class this handler serves.
    fn kind(&self) -> RequestKind;

    /// Instance name for logs and stats.
    fn name(&self) -> &str;

    /// Whether [`handle_stream`](Self::handle_stream) is supported.
    fn supports_streaming(&self) -> bool;

    /// Dispatch a non-streaming request.
    async fn handle(&self, req: &HandlerRequest) -> Result<HandlerResponse>;

    /// Dispatch a streaming request, pumping frames into `sink`.
    async fn handle_stream(&self, req: &HandlerRequest, sink: Arc<dyn SseSink>)
        -> Result<StreamResult>;

    /// Reject malformed envelopes before any side effect.
    fn validate_request(&self, req: &HandlerRequest) -> Result<()>;

    /// Reject malformed upstream responses.
    fn validate_response(&self, resp: &HandlerResponse) -> Result<()> {
        if resp.status >= 600 {
            return Err(RelayError::validation(format!(
                "response status {} out of range",
                resp.status
            )));
        }
        Ok(())
    }

    /// Current counters.
    fn stats(&self) -> HandlerStatsSnapshot;
}

/// Envelope checks shared by every class.
fn validate_common(kind: RequestKind, req: &HandlerRequest) -> Result<()> {
    if req.kind != kind {
        return Err(RelayError::validation(format!(
            "request kind {} does not match handler {}",
            req.kind.as_str(),
            kind.as_str()
        )));
    }
    if req.model.is_empty() {
        return Err(RelayError::validation("model is required"));
    }
    if req.endpoint.is_empty() {
        return Err(RelayError::validation("endpoint is required"));
    }
    Ok(())
}

/// Class-specific body checks.
fn validate_body(kind: RequestKind, req: &HandlerRequest) -> Result<()> {
    let body = req.body_json().map_err(|_| {
        RelayError::validation(format!("{} request body must be JSON", kind.as_str()))
    })?;
    match kind {
        RequestKind::Chat => {
            let messages = body.get("messages").and_then(Value::as_array);
            match messages {
                Some(messages) if !messages.is_empty() => Ok(()),
                _ => Err(RelayError::validation("chat requires a non-empty messages array")),
            }
        }
        RequestKind::Embedding => {
            if body.get("input").is_none() {
                return Err(RelayError::validation("embedding requires input"));
            }
            Ok(())
        }
        RequestKind::Image => {
            match body.get("prompt").and_then(Value::as_str) {
                Some(prompt) if !prompt.is_empty() => Ok(()),
                _ => Err(RelayError::validation("image requires a prompt")),
            }
        }
        RequestKind::Audio => {
            if body.get("file").is_none() {
                return Err(RelayError::validation("audio requires a file"));
            }
            Ok(())
        }
    }
}

/// The prompt-bearing text of a request body, for token estimation.
fn prompt_text(kind: RequestKind, body: &Value) -> String {
    match kind {
        RequestKind::Chat => body
            .get("messages")
            .and_then(Value::as_array)
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| m.get("content").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default(),
        RequestKind::Embedding => match body.get("input") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        },
        RequestKind::Image => body
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        RequestKind::Audio => String::new(),
    }
}

fn select_options(req: &HandlerRequest) -> SelectOptions {
    let mut opts = SelectOptions::for_model(&req.model);
    if let Some(region) = req.metadata.get("region").and_then(Value::as_str) {
        opts = opts.with_region(region);
    }
    if let Some(t) = req.metadata.get("channel_type").and_then(Value::as_str) {
        opts = opts.with_type(t);
    }
    opts
}

/// The chat handler: full streaming support plus quota reservation.
pub struct ChatHandler {
    client: Arc<RequestClient>,
    quota: Arc<dyn QuotaService>,
    streams: StreamHandler,
    stats: HandlerStats,
}

impl ChatHandler {
    /// A chat handler over the shared client and quota service.
    pub fn new(client: Arc<RequestClient>, quota: Arc<dyn QuotaService>) -> Self {
        Self {
            client,
            quota: quota.clone(),
            streams: StreamHandler::new(quota),
            stats: HandlerStats::default(),
        }
    }

    /// Attach an event handler to the streaming pipeline.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.streams = self.streams.with_events(events);
        self
    }

    async fn reserve(&self, req: &HandlerRequest, prompt: &str) -> Result<()> {
        self.quota
            .pre_consume(&PreConsumeRequest {
                request_id: req.id.clone(),
                user_id: req.user_id.clone(),
                token_id: req.token_id.clone(),
                model: req.model.clone(),
                estimated_tokens: estimate_tokens(prompt),
            })
            .await
            .map(|_| ())
    }

    async fn refund(&self, req: &HandlerRequest) {
        if let Err(err) = self.quota.return_pre_consumed(&req.id, &req.user_id).await {
            tracing::warn!(request_id = %req.id, error = %err, "quota refund failed");
        }
    }
}

#[async_trait]
impl RelayHandler for ChatHandler {
    fn kind(&self) -> RequestKind {
        RequestKind::Chat
    }

    fn name(&self) -> &str {
        "chat"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn handle(&self, req: &HandlerRequest) -> Result<HandlerResponse> {
        let started = Instant::now();
        self.validate_request(req)?;

        let body = req.body_json()?;
        let prompt = prompt_text(RequestKind::Chat, &body);
        self.reserve(req, &prompt).await?;

        let result = self
            .client
            .execute(
                &req.cancel,
                Method::POST,
                &req.endpoint,
                Some(&req.body),
                req.headers.clone(),
                &select_options(req),
            )
            .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(response) => {
                let response = HandlerResponse::from(response);
                self.validate_response(&response)?;

                let completion = String::from_utf8_lossy(&response.body).into_owned();
                let usage = TokenUsage {
                    prompt_tokens: estimate_tokens(&prompt),
                    completion_tokens: estimate_tokens(&completion),
                    total_tokens: estimate_tokens(&prompt) + estimate_tokens(&completion),
                };
                if let Err(err) = self
                    .quota
                    .post_consume(&PostConsumeRequest {
                        request_id: req.id.clone(),
                        user_id: req.user_id.clone(),
                        token_id: req.token_id.clone(),
                        model: req.model.clone(),
                        usage,
                        duration: started.elapsed(),
                        success: true,
                    })
                    .await
                {
                    tracing::warn!(request_id = %req.id, error = %err, "quota post-consume failed");
                }

                self.stats.record(true, false, latency_ms);
                Ok(response)
            }
            Err(err) => {
                self.refund(req).await;
                self.stats.record(false, false, latency_ms);
                Err(err)
            }
        }
    }

    async fn handle_stream(
        &self,
        req: &HandlerRequest,
        sink: Arc<dyn SseSink>,
    ) -> Result<StreamResult> {
        let started = Instant::now();
        let mut phase = PhaseTracker::new();

        let validated = self.validate_request(req);
        if let Err(err) = validated {
            phase.advance(HandlerPhase::Error)?;
            phase.advance(HandlerPhase::Finalizing)?;
            self.stats.record(false, true, started.elapsed().as_millis() as u64);
            return Err(err);
        }

        let body = req.body_json()?;
        let prompt = prompt_text(RequestKind::Chat, &body);
        self.reserve(req, &prompt).await?;

        phase.advance(HandlerPhase::AcquiringChannel)?;
        phase.advance(HandlerPhase::Sending)?;

        let upstream = match self
            .client
            .execute_stream(
                &req.cancel,
                &req.endpoint,
                Some(&req.body),
                req.headers.clone(),
                &select_options(req),
            )
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                // Nothing streamed: the reservation is refunded whole.
                phase.advance(HandlerPhase::Error)?;
                phase.advance(HandlerPhase::Finalizing)?;
                self.refund(req).await;
                self.stats.record(false, true, started.elapsed().as_millis() as u64);
                return Err(err);
            }
        };

        phase.advance(HandlerPhase::Streaming)?;
        let opts = StreamOptions::new(&req.id, req.session_id(), &req.model)
            .with_user(&req.user_id, &req.token_id)
            .with_prompt(&prompt);
        let result = self
            .streams
            .handle(&req.cancel, sink.as_ref(), upstream.chunks, upstream.errors, &opts)
            .await;

        // The stream handler already settled quota; only phases and
        // stats remain.
        match result {
            Ok(stream_result) => {
                phase.advance(HandlerPhase::Finalizing)?;
                phase.advance(HandlerPhase::Done)?;
                self.stats.record(true, true, started.elapsed().as_millis() as u64);
                Ok(stream_result)
            }
            Err(err) => {
                phase.advance(HandlerPhase::Error)?;
                phase.advance(HandlerPhase::Finalizing)?;
                self.stats.record(false, true, started.elapsed().as_millis() as u64);
                Err(err)
            }
        }
    }

    fn validate_request(&self, req: &HandlerRequest) -> Result<()> {
        validate_common(RequestKind::Chat, req)?;
        validate_body(RequestKind::Chat, req)
    }

    fn stats(&self) -> HandlerStatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for ChatHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatHandler").field("stats", &self.stats()).finish()
    }
}

/// Non-streaming handler shared by the embedding, image, and audio
/// classes.
pub struct SimpleHandler {
    kind: RequestKind,
    client: Arc<RequestClient>,
    quota: Arc<dyn QuotaService>,
    stats: HandlerStats,
}

impl SimpleHandler {
    /// A handler for one non-streaming class.
    pub fn new(kind: RequestKind, client: Arc<RequestClient>, quota: Arc<dyn QuotaService>) -> Self {
        Self {
            kind,
            client,
            quota,
            stats: HandlerStats::default(),
        }
    }
}

#[async_trait]
impl RelayHandler for SimpleHandler {
    fn kind(&self) -> RequestKind {
        self.kind
    }

    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    async fn handle(&self, req: &HandlerRequest) -> Result<HandlerResponse> {
        let started = Instant::now();
        self.validate_request(req)?;

        let body = req.body_json()?;
        let prompt = prompt_text(self.kind, &body);
        self.quota
            .pre_consume(&PreConsumeRequest {
                request_id: req.id.clone(),
                user_id: req.user_id.clone(),
                token_id: req.token_id.clone(),
                model: req.model.clone(),
                estimated_tokens: estimate_tokens(&prompt),
            })
            .await?;

        let result = self
            .client
            .execute(
                &req.cancel,
                Method::POST,
                &req.endpoint,
                Some(&req.body),
                req.headers.clone(),
                &select_options(req),
            )
            .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(response) => {
                let response = HandlerResponse::from(response);
                self.validate_response(&response)?;
                if let Err(err) = self
                    .quota
                    .post_consume(&PostConsumeRequest {
                        request_id: req.id.clone(),
                        user_id: req.user_id.clone(),
                        token_id: req.token_id.clone(),
                        model: req.model.clone(),
                        usage: TokenUsage {
                            prompt_tokens: estimate_tokens(&prompt),
                            completion_tokens: 0,
                            total_tokens: estimate_tokens(&prompt),
                        },
                        duration: started.elapsed(),
                        success: true,
                    })
                    .await
                {
                    tracing::warn!(request_id = %req.id, error = %err, "quota post-consume failed");
                }
                self.stats.record(true, false, latency_ms);
                Ok(response)
            }
            Err(err) => {
                if let Err(refund_err) =
                    self.quota.return_pre_consumed(&req.id, &req.user_id).await
                {
                    tracing::warn!(request_id = %req.id, error = %refund_err, "quota refund failed");
                }
                self.stats.record(false, false, latency_ms);
                Err(err)
            }
        }
    }

    async fn handle_stream(
        &self,
        _req: &HandlerRequest,
        _sink: Arc<dyn SseSink>,
    ) -> Result<StreamResult> {
        Err(RelayError::validation(format!(
            "{} requests do not support streaming",
            self.kind.as_str()
        )))
    }

    fn validate_request(&self, req: &HandlerRequest) -> Result<()> {
        validate_common(self.kind, req)?;
        validate_body(self.kind, req)
    }

    fn stats(&self) -> HandlerStatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for SimpleHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleHandler")
            .field("kind", &self.kind)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Class-keyed handler registry.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<RequestKind, Arc<dyn RelayHandler>>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Duplicate registration for a class is
    /// rejected.
    pub fn register(&self, handler: Arc<dyn RelayHandler>) -> Result<()> {
        let mut handlers = self.handlers.write();
        let kind = handler.kind();
        if handlers.contains_key(&kind) {
            return Err(RelayError::validation(format!(
                "handler for {} already registered",
                kind.as_str()
            )));
        }
        handlers.insert(kind, handler);
        Ok(())
    }

    /// Look up the handler for a class.
    pub fn get(&self, kind: RequestKind) -> Option<Arc<dyn RelayHandler>> {
        self.handlers.read().get(&kind).cloned()
    }

    /// The registered classes.
    pub fn kinds(&self) -> Vec<RequestKind> {
        self.handlers.read().keys().copied().collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").field("handlers", &self.len()).finish()
    }
}

/// Registry wrapper with a class-to-handler lookup cache and envelope
/// routing.
pub struct HandlerManager {
    registry: Arc<HandlerRegistry>,
    cache: RwLock<HashMap<RequestKind, Arc<dyn RelayHandler>>>,
}

impl HandlerManager {
    /// A manager over `registry`.
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The handler for `kind`, from the cache when warm.
    pub fn get(&self, kind: RequestKind) -> Result<Arc<dyn RelayHandler>> {
        if let Some(handler) = self.cache.read().get(&kind) {
            return Ok(handler.clone());
        }
        let handler = self
            .registry
            .get(kind)
            .ok_or_else(|| RelayError::validation(format!("no handler for {}", kind.as_str())))?;
        self.cache.write().insert(kind, handler.clone());
        Ok(handler)
    }

    /// Route and dispatch a non-streaming envelope.
    pub async fn dispatch(&self, req: &HandlerRequest) -> Result<HandlerResponse> {
        let handler = self.get(req.kind)?;
        handler.validate_request(req)?;
        handler.handle(req).await
    }

    /// Route and dispatch a streaming envelope.
    pub async fn dispatch_stream(
        &self,
        req: &HandlerRequest,
        sink: Arc<dyn SseSink>,
    ) -> Result<StreamResult> {
        let handler = self.get(req.kind)?;
        if !handler.supports_streaming() {
            return Err(RelayError::validation(format!(
                "{} requests do not support streaming",
                req.kind.as_str()
            )));
        }
        handler.validate_request(req)?;
        handler.handle_stream(req, sink).await
    }
}

impl std::fmt::Debug for HandlerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerManager")
            .field("registered", &self.registry.len())
            .field("cached", &self.cache.read().len())
            .finish()
    }
}

/// Manufactures the full handler set over one shared client.
pub struct HandlerFactory {
    client: Arc<RequestClient>,
    quota: Arc<dyn QuotaService>,
    events: Option<Arc<dyn EventHandler>>,
}

impl HandlerFactory {
    /// A factory sharing `client` and `quota` across every handler.
    pub fn new(client: Arc<RequestClient>, quota: Arc<dyn QuotaService>) -> Self {
        Self {
            client,
            quota,
            events: None,
        }
    }

    /// Attach an event handler to manufactured handlers.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the handler for one class.
    pub fn make(&self, kind: RequestKind) -> Arc<dyn RelayHandler> {
        match kind {
            RequestKind::Chat => {
                let mut handler = ChatHandler::new(self.client.clone(), self.quota.clone());
                if let Some(ref events) = self.events {
                    handler = handler.with_events(events.clone());
                }
                Arc::new(handler)
            }
            other => Arc::new(SimpleHandler::new(
                other,
                self.client.clone(),
                self.quota.clone(),
            )),
        }
    }

    /// Build and register all four classes.
    pub fn register_all(&self, registry: &HandlerRegistry) -> Result<()> {
        for kind in [
            RequestKind::Chat,
            RequestKind::Embedding,
            RequestKind::Image,
            RequestKind::Audio,
        ] {
            registry.register(self.make(kind))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HandlerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerFactory").finish()
    }
}
