//! Quota service seam.
//!
//! The relay meters usage but does not own the accounting engine. It
//! reserves quota before issuing the upstream request
//! ([`QuotaService::pre_consume`]), reconciles actual usage on completion
//! ([`QuotaService::post_consume`]), and refunds the reservation when the
//! request dies before producing usage
//! ([`QuotaService::return_pre_consumed`]).

use crate::error::Result;
use crate::tokens::TokenUsage;
use async_trait::async_trait;
use std::time::Duration;

/// Reservation request issued before the upstream call.
#[derive(Debug, Clone)]
pub struct PreConsumeRequest {
    /// Relay-assigned request id.
    pub request_id: String,
    /// Requesting user.
    pub user_id: String,
    /// API token the user authenticated with.
    pub token_id: String,
    /// Requested model.
    pub model: String,
    /// Upper-bound token estimate for the reservation.
    pub estimated_tokens: u64,
}

/// A granted reservation.
#[derive(Debug, Clone)]
pub struct QuotaReservation {
    /// Request the reservation belongs to.
    pub request_id: String,
    /// Tokens held against the user's quota.
    pub reserved_tokens: u64,
}

/// Reconciliation record issued after the request completes.
#[derive(Debug, Clone)]
pub struct PostConsumeRequest {
    /// Relay-assigned request id.
    pub request_id: String,
    /// Requesting user.
    pub user_id: String,
    /// API token the user authenticated with.
    pub token_id: String,
    /// Model that served the request.
    pub model: String,
    /// Metered token usage.
    pub usage: TokenUsage,
    /// Wall-clock duration of the request.
    pub duration: Duration,
    /// Whether the request completed successfully. The quota service
    /// refunds any unused reservation either way.
    pub success: bool,
}

/// External quota accounting engine, consumed as an interface.
#[async_trait]
pub trait QuotaService: Send + Sync {
    /// Reserve quota ahead of the upstream request.
    async fn pre_consume(&self, req: &PreConsumeRequest) -> Result<QuotaReservation>;

    /// Refund a reservation whose request died before producing usage.
    async fn return_pre_consumed(&self, request_id: &str, user_id: &str) -> Result<()>;

    /// Report actual usage; the service settles it against the
    /// reservation and refunds the unused remainder.
    async fn post_consume(&self, req: &PostConsumeRequest) -> Result<()>;
}

/// A quota service that grants everything and records nothing.
///
/// Used in tests and in deployments where metering happens entirely
/// outside the relay.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopQuota;

#[async_trait]
impl QuotaService for NoopQuota {
    async fn pre_consume(&self, req: &PreConsumeRequest) -> Result<QuotaReservation> {
        Ok(QuotaReservation {
            request_id: req.request_id.clone(),
            reserved_tokens: req.estimated_tokens,
        })
    }

    async fn return_pre_consumed(&self, _request_id: &str, _user_id: &str) -> Result<()> {
        Ok(())
    }

    async fn post_consume(&self, _req: &PostConsumeRequest) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_grants_reservation() {
        let quota = NoopQuota;
        let reservation = quota
            .pre_consume(&PreConsumeRequest {
                request_id: "r1".into(),
                user_id: "u1".into(),
                token_id: "t1".into(),
                model: "gpt-4o".into(),
                estimated_tokens: 500,
            })
            .await
            .expect("noop always grants");

        assert_eq!(reservation.request_id, "r1");
        assert_eq!(reservation.reserved_tokens, 500);
    }

    #[tokio::test]
    async fn test_noop_accepts_reconciliation() {
        let quota = NoopQuota;
        quota
            .post_consume(&PostConsumeRequest {
                request_id: "r1".into(),
                user_id: "u1".into(),
                token_id: "t1".into(),
                model: "gpt-4o".into(),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 20,
                    total_tokens: 30,
                },
                duration: Duration::from_secs(2),
                success: true,
            })
            .await
            .expect("noop accepts");
        quota
            .return_pre_consumed("r1", "u1")
            .await
            .expect("noop refunds");
    }
}
