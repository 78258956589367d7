use std::time::Duration;
use thiserror::Error;

/// Which timer fired for a [`RelayError::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No chunk arrived within the stream's idle window.
    Idle,
    /// The stream exceeded its total allowed duration.
    Total,
    /// A health-check probe did not answer in time.
    HealthCheck,
}

impl TimeoutKind {
    /// Short label for logs and SSE error payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutKind::Idle => "idle",
            TimeoutKind::Total => "total",
            TimeoutKind::HealthCheck => "health-check",
        }
    }
}

/// Errors produced by the relay core and its components.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Low-level HTTP transport failure (connection refused, reset, etc.).
    /// Always retryable.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Request rejected before any side effect (bad envelope, missing
    /// fields, handler/type mismatch). Maps to a 4xx-class response.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The selector or key pool produced an empty candidate set.
    /// Retryable within the request client; terminal for the caller once
    /// retries are exhausted.
    #[error("No {resource} available: {detail}")]
    NoCandidate {
        /// Which pool ran dry (`"channels"` or `"keys"`).
        resource: &'static str,
        /// What was being looked for.
        detail: String,
    },

    /// Upstream returned a non-success status.
    ///
    /// Retryability depends on the status code and the active
    /// [`RetryPolicy`](crate::retry::RetryPolicy); the `retry_after` field
    /// is populated from the `Retry-After` response header when present.
    #[error("Upstream returned {status}: {body}")]
    Upstream {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// Every otherwise-eligible channel had an open circuit breaker.
    #[error("All candidate channels have open circuit breakers ({candidates} excluded)")]
    CircuitOpen {
        /// How many candidates the breaker filter removed.
        candidates: usize,
    },

    /// An idle, total, or health-check timer fired.
    #[error("{} timeout elapsed", .0.as_str())]
    Timeout(TimeoutKind),

    /// The caller's cancellation signal fired.
    #[error("Operation was cancelled")]
    Cancelled,

    /// Body-cache or channel-cache miss, or a cache-tier I/O failure.
    /// Non-retryable once terminal.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Shorthand for a [`RelayError::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        RelayError::Validation(msg.into())
    }

    /// Shorthand for a [`RelayError::Cache`].
    pub fn cache(msg: impl Into<String>) -> Self {
        RelayError::Cache(msg.into())
    }

    /// Shorthand for an empty-candidate error.
    pub fn no_candidate(resource: &'static str, detail: impl Into<String>) -> Self {
        RelayError::NoCandidate {
            resource,
            detail: detail.into(),
        }
    }

    /// Whether this error may succeed on a later attempt.
    ///
    /// Transport errors, candidate-set exhaustion, and breaker lock-out are
    /// always retryable. Upstream status errors are retryable iff the
    /// status appears in `retryable_statuses`. Validation, cancellation,
    /// cache, and timeout errors are terminal.
    pub fn is_retryable(&self, retryable_statuses: &[u16]) -> bool {
        match self {
            RelayError::Request(_) => true,
            RelayError::NoCandidate { .. } => true,
            RelayError::CircuitOpen { .. } => true,
            RelayError::Upstream { status, .. } => retryable_statuses.contains(status),
            _ => false,
        }
    }

    /// The upstream's `Retry-After` hint, if this error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RelayError::Upstream { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Sanitized message for the client-facing `error` SSE event.
    ///
    /// Internal detail (upstream bodies, transport addresses) is stripped;
    /// the client sees only the error class.
    pub fn public_message(&self) -> String {
        match self {
            RelayError::Validation(msg) => msg.clone(),
            RelayError::Upstream { status, .. } => format!("upstream error (status {})", status),
            RelayError::Timeout(kind) => format!("{} timeout", kind.as_str()),
            RelayError::Cancelled => "request cancelled".to_string(),
            RelayError::NoCandidate { resource, .. } => format!("no {} available", resource),
            RelayError::CircuitOpen { .. } => "no channels currently accepting traffic".to_string(),
            _ => "internal relay error".to_string(),
        }
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_RETRYABLE: &[u16] = &[408, 429, 500, 502, 503, 504];

    #[test]
    fn test_upstream_retryable_by_status() {
        let err = RelayError::Upstream {
            status: 503,
            body: "service unavailable".into(),
            retry_after: None,
        };
        assert!(err.is_retryable(DEFAULT_RETRYABLE));

        let err = RelayError::Upstream {
            status: 400,
            body: "bad request".into(),
            retry_after: None,
        };
        assert!(!err.is_retryable(DEFAULT_RETRYABLE));
    }

    #[test]
    fn test_no_candidate_retryable() {
        let err = RelayError::no_candidate("channels", "model gpt-4o");
        assert!(err.is_retryable(DEFAULT_RETRYABLE));
        let err = RelayError::no_candidate("keys", "type openai");
        assert!(err.is_retryable(DEFAULT_RETRYABLE));
    }

    #[test]
    fn test_terminal_errors_not_retryable() {
        assert!(!RelayError::Cancelled.is_retryable(DEFAULT_RETRYABLE));
        assert!(!RelayError::validation("empty model").is_retryable(DEFAULT_RETRYABLE));
        assert!(!RelayError::cache("miss").is_retryable(DEFAULT_RETRYABLE));
        assert!(!RelayError::Timeout(TimeoutKind::Idle).is_retryable(DEFAULT_RETRYABLE));
    }

    #[test]
    fn test_retry_after_surfaced() {
        let err = RelayError::Upstream {
            status: 429,
            body: "rate limited".into(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(RelayError::Cancelled.retry_after(), None);
    }

    #[test]
    fn test_public_message_hides_upstream_body() {
        let err = RelayError::Upstream {
            status: 502,
            body: "secret internal hostname".into(),
            retry_after: None,
        };
        let msg = err.public_message();
        assert!(!msg.contains("secret"));
        assert!(msg.contains("502"));
    }

    #[test]
    fn test_timeout_kind_labels() {
        assert_eq!(TimeoutKind::Idle.as_str(), "idle");
        assert_eq!(TimeoutKind::Total.as_str(), "total");
        assert_eq!(TimeoutKind::HealthCheck.as_str(), "health-check");
    }
}
