//! Event system for relay lifecycle hooks.
//!
//! Provides an optional, non-intrusive way to observe dispatch decisions,
//! breaker transitions, health results, and stream lifecycle. Components
//! accept an `Option<Arc<dyn EventHandler>>` and emit through it; there is
//! exactly one sink interface for the whole crate.

use crate::breaker::BreakerState;
use crate::channel::ChannelStatus;
use std::sync::Arc;

/// Events emitted by relay components.
#[derive(Debug, Clone)]
pub enum Event {
    /// The selector picked a channel for a request.
    ChannelSelected {
        /// Selected channel id.
        channel_id: u64,
        /// Selected channel name.
        channel_name: String,
        /// Model the request asked for, if any.
        model: Option<String>,
    },
    /// The request client switched channels between attempts.
    ChannelSwitch {
        /// Channel the previous attempt used.
        from: u64,
        /// Channel the next attempt will use.
        to: u64,
        /// Attempt number (1-indexed).
        attempt: u32,
    },
    /// A retry was scheduled after a retryable failure.
    RetryScheduled {
        /// The retry attempt number (1-indexed).
        attempt: u32,
        /// Delay before this retry attempt in milliseconds.
        delay_ms: u64,
        /// Why the retry was triggered.
        reason: String,
    },
    /// A circuit breaker changed state.
    BreakerTransition {
        /// Channel the breaker guards.
        channel_id: u64,
        /// State before the transition.
        from: BreakerState,
        /// State after the transition.
        to: BreakerState,
    },
    /// A health check completed for one channel.
    HealthResult {
        /// Checked channel id.
        channel_id: u64,
        /// Status derived from the check.
        status: ChannelStatus,
        /// Probe round-trip in milliseconds, when a probe ran.
        latency_ms: Option<u64>,
        /// Probe error, when the check failed.
        error: Option<String>,
    },
    /// A stream began pumping chunks.
    StreamStarted {
        /// Owning session id.
        session_id: String,
        /// Model the stream serves.
        model: String,
    },
    /// A stream finished (normally or with an error).
    StreamFinished {
        /// Owning session id.
        session_id: String,
        /// Tokens counted in the prompt.
        prompt_tokens: u64,
        /// Tokens counted in the completion.
        completion_tokens: u64,
        /// Chunks forwarded.
        chunk_count: u64,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
        /// Whether the stream terminated cleanly.
        ok: bool,
    },
    /// A broadcast message was dropped because a client buffer was full.
    MessageDropped {
        /// Session the broadcast belonged to.
        session_id: String,
        /// Client whose buffer was full.
        client_id: String,
    },
    /// The body cache evicted entries.
    CacheEviction {
        /// Entries removed.
        evicted: u64,
        /// Bytes reclaimed.
        reclaimed_bytes: u64,
        /// `"ttl"` or `"size"`.
        reason: &'static str,
    },
    /// Quota was reconciled after a request completed.
    QuotaReconciled {
        /// Request the reconciliation belongs to.
        request_id: String,
        /// Total tokens reported to the quota service.
        total_tokens: u64,
        /// Whether the request had failed (reservation refund path).
        refunded: bool,
    },
}

/// Handler for relay lifecycle events.
///
/// Implement this trait to receive dispatch decisions, breaker
/// transitions, and stream lifecycle signals. Entirely optional --
/// components work without a handler.
///
/// # Example
///
/// ```
/// use llm_relay::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         if let Event::ChannelSelected { channel_name, .. } = event {
///             println!("selected {}", channel_name);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Called when a component emits an event.
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use llm_relay::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     eprintln!("{:?}", event);
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_without_handler_is_noop() {
        let handler: Option<Arc<dyn EventHandler>> = None;
        emit(
            &handler,
            Event::RetryScheduled {
                attempt: 1,
                delay_ms: 100,
                reason: "503".into(),
            },
        );
    }

    #[test]
    fn test_fn_handler_receives_events() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handler: Option<Arc<dyn EventHandler>> = Some(Arc::new(FnEventHandler(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })));

        emit(
            &handler,
            Event::ChannelSelected {
                channel_id: 1,
                channel_name: "primary".into(),
                model: Some("gpt-4o".into()),
            },
        );
        emit(
            &handler,
            Event::MessageDropped {
                session_id: "s1".into(),
                client_id: "c1".into(),
            },
        );

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
