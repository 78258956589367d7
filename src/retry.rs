//! Transport-level retry policy with pluggable backoff.
//!
//! [`RetryPolicy`] controls how transient failures (429, 5xx, connection
//! errors, empty candidate sets) are retried with increasing delays. The
//! policy is pure configuration plus a [`run`](RetryPolicy::run) driver
//! that executes a fallible async closure, sleeping between attempts and
//! honoring `Retry-After` hints and caller cancellation.

use crate::error::{RelayError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How the delay grows across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `initial * multiplier^n`, capped at the max delay.
    Exponential,
    /// `initial * (1 + multiplier * n)`, capped.
    Linear,
    /// `initial` every time.
    Fixed,
}

/// Retry configuration and driver.
///
/// # Example
///
/// ```
/// use llm_relay::retry::{BackoffStrategy, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_max_retries(5)
///     .with_strategy(BackoffStrategy::Exponential)
///     .with_initial_delay(Duration::from_millis(200));
/// assert_eq!(policy.max_retries, 5);
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt. Default: 3.
    pub max_retries: u32,
    /// Delay growth strategy. Default: exponential.
    pub strategy: BackoffStrategy,
    /// Delay before the first retry. Default: 1 second.
    pub initial_delay: Duration,
    /// Ceiling on any single delay. Default: 60 seconds.
    pub max_delay: Duration,
    /// Growth factor. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Add a uniform `[0, delay/2]` on top of each delay. Default: true.
    pub enable_jitter: bool,
    /// Status codes that classify an upstream error as retryable.
    /// Default: 408, 429, 500, 502, 503, 504.
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            enable_jitter: true,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the maximum retry count.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff strategy.
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the delay before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay ceiling.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.enable_jitter = enabled;
        self
    }

    /// Replace the retryable status list.
    pub fn with_retryable_statuses(mut self, codes: Vec<u16>) -> Self {
        self.retryable_status_codes = codes;
        self
    }

    /// Whether `error` may succeed on a later attempt under this policy.
    pub fn is_retryable(&self, error: &RelayError) -> bool {
        error.is_retryable(&self.retryable_status_codes)
    }

    /// The delay before retry attempt `n` (0-indexed), before jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let raw = match self.strategy {
            BackoffStrategy::Exponential => initial * self.backoff_multiplier.powi(attempt as i32),
            BackoffStrategy::Linear => initial * (1.0 + self.backoff_multiplier * f64::from(attempt)),
            BackoffStrategy::Fixed => initial,
        };
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    /// The delay before retry attempt `n`, with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        if !self.enable_jitter {
            return base;
        }
        base + Duration::from_secs_f64(fastrand::f64() * base.as_secs_f64() / 2.0)
    }

    /// Execute `op` with retry.
    ///
    /// `op` receives the attempt number (0 for the initial call). After a
    /// retryable failure the driver sleeps for the computed delay -- or
    /// the error's `Retry-After` hint when that is longer -- then calls
    /// `op` again, up to `max_retries` times. Non-retryable errors and
    /// cancellation abort immediately; cancellation also interrupts the
    /// sleep.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error: Option<RelayError> = None;

        for attempt in 0..=self.max_retries {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }

            if attempt > 0 {
                let mut delay = self.delay_for_attempt(attempt - 1);
                if let Some(hint) = last_error.as_ref().and_then(RelayError::retry_after) {
                    if hint > delay {
                        delay = hint;
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt < self.max_retries && self.is_retryable(&err) {
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RelayError::Other("retry loop exited unexpectedly".into())))
    }
}
