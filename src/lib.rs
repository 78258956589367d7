//! # LLM Relay
//!
//! Dispatch core for an LLM request relay: accepts inference requests
//! (chat, embedding, image, audio), selects a suitable upstream provider
//! ("channel") from a pool, forwards the request, streams the response
//! back over SSE, meters usage against quotas, and maintains the health
//! and reputation of each upstream.
//!
//! This crate is the dispatch engine only. The HTTP framework, route
//! wiring, persistence, and authentication live in the embedding
//! application; the quota accounting engine is consumed through the
//! [`QuotaService`] interface.
//!
//! ## Core Concepts
//!
//! - **[`Channel`]** -- one upstream provider endpoint with routing
//!   attributes, keys, abilities, and lock-free metrics.
//! - **[`ChannelCache`]** -- process-wide registry with type/model/region
//!   indices and atomic refresh.
//! - **[`LoadBalancer`]** -- picks a channel per request: wildcard rules,
//!   six strategies, circuit-breaker gating, adaptive weights.
//! - **[`KeyPool`]** -- per-channel-type API-key rotation with failure
//!   awareness.
//! - **[`RequestClient`]** -- retry loop with channel fail-over, body
//!   replay from the [`BodyCache`], and metric accounting.
//! - **[`StreamManager`]** / **[`StreamHandler`]** -- SSE fan-out and the
//!   chunk-to-frame pump with token counting and quota reconciliation.
//! - **[`Relay`]** -- the assembled aggregate with `start`/`stop`
//!   lifecycle for all background workers.
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_relay::{Relay, RelayConfig};
//! use llm_relay::channel::{Channel, ChannelKey};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = Relay::builder(RelayConfig::default()).build()?;
//!
//!     relay.cache.add(Arc::new(
//!         Channel::new(1, "openai-primary", "https://api.openai.com", "openai")
//!             .with_models(["gpt-4o", "gpt-4o-mini"])
//!             .with_key(ChannelKey::new("k1", "sk-...", "openai")),
//!     ));
//!     relay.keys.add_key("openai", llm_relay::keypool::ApiKey::new("k1", "sk-..."));
//!
//!     relay.start();
//!     // ... wire HTTP routes to relay.handlers ...
//!     relay.stop().await;
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod body_cache;
pub mod breaker;
pub mod cache;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod health;
pub mod keypool;
pub mod quota;
pub mod relay;
pub mod retry;
pub mod sse;
pub mod stream_handler;
pub mod stream_manager;
pub mod tokens;
pub mod wildcard;

pub use balancer::{LoadBalancer, SelectOptions, Strategy};
pub use body_cache::{BodyCache, BodyCacheStats};
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use cache::{CacheStats, ChannelCache, ChannelSource};
pub use channel::{Channel, ChannelFilter, ChannelKey, ChannelStatus};
pub use client::{ChannelStatsSnapshot, RelayResponse, RequestClient, UpstreamStream};
pub use config::{
    BodyCacheConfig, CacheMode, HealthCheckConfig, KeyPoolConfig, LoadBalancerConfig, RelayConfig,
    StreamConfig,
};
pub use error::{RelayError, Result, TimeoutKind};
pub use events::{Event, EventHandler, FnEventHandler};
pub use handler::{
    HandlerFactory, HandlerManager, HandlerRegistry, HandlerRequest, HandlerResponse, RelayHandler,
    RequestKind,
};
pub use health::{HealthChecker, HealthCheckResult};
pub use keypool::{ApiKey, KeyPool, KeyStrategy};
pub use quota::{NoopQuota, PostConsumeRequest, PreConsumeRequest, QuotaReservation, QuotaService};
pub use relay::{Relay, RelayBuilder};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use sse::{SseDecoder, SseEvent, SseFrame};
pub use stream_handler::{ChannelSink, SseSink, StreamHandler, StreamOptions, StreamResult};
pub use stream_manager::{ClientHandle, StreamManager, StreamMessage, StreamSession};
pub use tokens::{StreamTokenCounter, TokenUsage};
pub use wildcard::{wildcard_match, RuleSet, WildcardRule};
