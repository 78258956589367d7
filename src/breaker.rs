//! Per-channel circuit breakers.
//!
//! Each breaker is a CLOSED / OPEN / HALF_OPEN state machine with a lazy
//! timer: state only advances when the next event observes a
//! state-dependent predicate, so no background timers are needed.
//! Breakers are keyed by channel id in a [`BreakerRegistry`] and never
//! hold a reference back to the channel record.

use crate::events::{emit, Event, EventHandler};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Traffic flows; failures are counted.
    Closed,
    /// Traffic is refused until the timeout elapses.
    Open,
    /// A limited trial is in progress.
    HalfOpen,
}

impl BreakerState {
    /// Short label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures in CLOSED before opening. Default: 5.
    pub failure_threshold: u32,
    /// Successes in HALF_OPEN before closing. Default: 2.
    pub success_threshold: u32,
    /// How long OPEN refuses traffic before admitting a trial.
    /// Default: 30 seconds.
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: BreakerState,
    /// Failures counted in the current CLOSED period.
    pub failure_count: u32,
    /// Successes counted in the current HALF_OPEN period.
    pub success_count: u32,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_transition: Instant,
}

/// One channel's circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// A closed breaker with the given thresholds.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_transition: Instant::now(),
            }),
        }
    }

    /// Whether a request may pass right now.
    ///
    /// CLOSED and HALF_OPEN admit traffic. OPEN admits a trial request
    /// once the timeout has elapsed since the transition; before that it
    /// refuses. Without the trial admission HALF_OPEN would be
    /// unreachable, since no success could ever be observed.
    pub fn is_available(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => inner.last_transition.elapsed() >= self.config.timeout,
        }
    }

    /// Record a successful call. Returns the transition taken, if any.
    pub fn on_success(&self) -> Option<(BreakerState, BreakerState)> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
                None
            }
            BreakerState::Open => {
                if inner.last_transition.elapsed() >= self.config.timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.last_transition = Instant::now();
                    // This success is the first of the trial period.
                    inner.success_count = 1;
                    inner.failure_count = 0;
                    if inner.success_count >= self.config.success_threshold {
                        inner.state = BreakerState::Closed;
                        inner.success_count = 0;
                        return Some((BreakerState::Open, BreakerState::Closed));
                    }
                    Some((BreakerState::Open, BreakerState::HalfOpen))
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.last_transition = Instant::now();
                    inner.success_count = 0;
                    inner.failure_count = 0;
                    Some((BreakerState::HalfOpen, BreakerState::Closed))
                } else {
                    None
                }
            }
        }
    }

    /// Record a failed call. Returns the transition taken, if any.
    pub fn on_failure(&self) -> Option<(BreakerState, BreakerState)> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.last_transition = Instant::now();
                    Some((BreakerState::Closed, BreakerState::Open))
                } else {
                    None
                }
            }
            BreakerState::Open => {
                // A trial request failed; re-stamp so the full timeout
                // must elapse again.
                inner.last_transition = Instant::now();
                None
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.last_transition = Instant::now();
                inner.success_count = 0;
                Some((BreakerState::HalfOpen, BreakerState::Open))
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Point-in-time counters.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }

    /// Force the breaker back to CLOSED with cleared counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_transition = Instant::now();
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("CircuitBreaker")
            .field("state", &snap.state)
            .field("failure_count", &snap.failure_count)
            .field("success_count", &snap.success_count)
            .finish()
    }
}

/// Breakers keyed by channel id, created on first use.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<u64, Arc<CircuitBreaker>>>,
    config: BreakerConfig,
    events: Option<Arc<dyn EventHandler>>,
}

impl BreakerRegistry {
    /// An empty registry applying `config` to every new breaker.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
            events: None,
        }
    }

    /// Attach an event handler for breaker transitions.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// The breaker guarding `channel_id`, created closed on first access.
    pub fn for_channel(&self, channel_id: u64) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(&channel_id) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(channel_id)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    /// Whether `channel_id` may receive traffic. Channels without a
    /// breaker yet are available.
    pub fn is_available(&self, channel_id: u64) -> bool {
        match self.breakers.read().get(&channel_id) {
            Some(breaker) => breaker.is_available(),
            None => true,
        }
    }

    /// Record a success for `channel_id`, emitting any transition.
    pub fn on_success(&self, channel_id: u64) {
        let breaker = self.for_channel(channel_id);
        if let Some((from, to)) = breaker.on_success() {
            emit(
                &self.events,
                Event::BreakerTransition { channel_id, from, to },
            );
        }
    }

    /// Record a failure for `channel_id`, emitting any transition.
    pub fn on_failure(&self, channel_id: u64) {
        let breaker = self.for_channel(channel_id);
        if let Some((from, to)) = breaker.on_failure() {
            emit(
                &self.events,
                Event::BreakerTransition { channel_id, from, to },
            );
        }
    }

    /// Force one channel's breaker back to CLOSED.
    pub fn reset(&self, channel_id: u64) {
        if let Some(breaker) = self.breakers.read().get(&channel_id) {
            breaker.reset();
        }
    }

    /// Number of breakers created so far.
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Whether no breaker has been created yet.
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("breakers", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_closed_success_resets_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.on_failure();
        assert_eq!(breaker.snapshot().failure_count, 1);
        breaker.on_success();
        assert_eq!(breaker.snapshot().failure_count, 0);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_opens_at_failure_threshold() {
        let breaker = CircuitBreaker::new(fast_config());
        assert!(breaker.on_failure().is_none());
        let transition = breaker.on_failure();
        assert_eq!(transition, Some((BreakerState::Closed, BreakerState::Open)));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.is_available());
    }

    #[tokio::test]
    async fn test_half_open_recovery_sequence() {
        // fail, fail -> OPEN; wait past the timeout; success -> HALF_OPEN;
        // success -> CLOSED and traffic flows again.
        let breaker = CircuitBreaker::new(fast_config());
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.is_available());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(breaker.is_available(), "trial admitted after timeout");

        let transition = breaker.on_success();
        assert_eq!(transition, Some((BreakerState::Open, BreakerState::HalfOpen)));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let transition = breaker.on_success();
        assert_eq!(transition, Some((BreakerState::HalfOpen, BreakerState::Closed)));
        assert!(breaker.is_available());
    }

    #[tokio::test]
    async fn test_open_success_before_timeout_ignored() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.on_failure();
        breaker.on_failure();
        assert!(breaker.on_success().is_none());
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.on_failure();
        breaker.on_failure();
        tokio::time::sleep(Duration::from_millis(150)).await;
        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let transition = breaker.on_failure();
        assert_eq!(transition, Some((BreakerState::HalfOpen, BreakerState::Open)));
        assert!(!breaker.is_available(), "re-stamped timeout applies");
    }

    #[tokio::test]
    async fn test_single_success_threshold_closes_from_open() {
        let config = BreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout: Duration::from_millis(50),
        };
        let breaker = CircuitBreaker::new(config);
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let transition = breaker.on_success();
        assert_eq!(transition, Some((BreakerState::Open, BreakerState::Closed)));
    }

    #[test]
    fn test_reset_forces_closed() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.is_available());
    }

    #[test]
    fn test_registry_creates_on_first_use() {
        let registry = BreakerRegistry::new(fast_config());
        assert!(registry.is_empty());
        assert!(registry.is_available(7));

        registry.on_failure(7);
        assert_eq!(registry.len(), 1);
        registry.on_failure(7);
        assert!(!registry.is_available(7));

        registry.reset(7);
        assert!(registry.is_available(7));
    }

    #[test]
    fn test_registry_breakers_are_independent() {
        let registry = BreakerRegistry::new(fast_config());
        registry.on_failure(1);
        registry.on_failure(1);
        assert!(!registry.is_available(1));
        assert!(registry.is_available(2));
    }
}
