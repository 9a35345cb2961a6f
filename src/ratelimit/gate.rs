//! Decision gate turning limiter results into accept/reject outcomes.

use serde::Serialize;

use super::counter::epoch_millis;
use super::identity::RequestMeta;
use super::limiter::RateLimiter;

/// Error message carried by every rejection.
pub const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded";

/// Accept/reject outcome for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The request may proceed
    Allowed { remaining: u64, reset_time: u64 },
    /// The request must be rejected; retry after this many seconds
    Denied { retry_after: u64 },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed { .. })
    }
}

/// Wire shape of a gate decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl From<GateDecision> for GateResponse {
    fn from(decision: GateDecision) -> Self {
        match decision {
            GateDecision::Allowed {
                remaining,
                reset_time,
            } => Self {
                success: true,
                remaining: Some(remaining),
                reset_time: Some(reset_time),
                error: None,
                retry_after: None,
            },
            GateDecision::Denied { retry_after } => Self {
                success: false,
                remaining: None,
                reset_time: None,
                error: Some(RATE_LIMIT_EXCEEDED.to_string()),
                retry_after: Some(retry_after),
            },
        }
    }
}

/// Check a request against `limiter`.
///
/// The identifier is resolved from `meta` unless `identifier` overrides it.
pub async fn check_request(
    limiter: &RateLimiter,
    meta: &RequestMeta,
    identifier: Option<&str>,
) -> GateDecision {
    check_request_at(limiter, meta, identifier, epoch_millis()).await
}

/// Like [`check_request`], at an explicit time (epoch ms).
pub async fn check_request_at(
    limiter: &RateLimiter,
    meta: &RequestMeta,
    identifier: Option<&str>,
    now: u64,
) -> GateDecision {
    let identifier = match identifier {
        Some(id) => id.to_string(),
        None => meta.identifier(),
    };

    let decision = limiter.is_allowed_at(&identifier, now).await;

    if decision.allowed {
        GateDecision::Allowed {
            remaining: decision.remaining,
            reset_time: decision.reset_time,
        }
    } else {
        // A window still counts at its reset instant, so never hint zero.
        GateDecision::Denied {
            retry_after: decision.reset_time.saturating_sub(now).div_ceil(1000).max(1),
        }
    }
}
