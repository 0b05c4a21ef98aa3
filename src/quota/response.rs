//! Rate-limit responses
//!
//! Maps decisions and errors onto the bodies and status codes request
//! handlers return to clients.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::error::QuotaError;
use super::guard::Decision;
use super::policy::{ActionType, SubscriptionTier};

/// Status returned with a rate-limit payload
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Body of a 429 response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPayload {
    /// Always `rate_limit_exceeded`
    pub error: String,
    pub message: String,
    pub current_usage: u64,
    pub limit: u32,
    /// ISO-8601 instant
    pub next_reset: Option<String>,
    /// Epoch milliseconds
    pub next_reset_ms: Option<i64>,
    pub is_first_day: bool,
    /// Whole seconds until `next_reset`, rounded up
    pub retry_after_secs: Option<u64>,
    pub action: ActionType,
    pub tier: SubscriptionTier,
}

impl RateLimitPayload {
    /// Payload for a denied decision; `None` when the decision allowed the action
    pub fn from_decision(decision: &Decision, now: DateTime<Utc>) -> Option<Self> {
        if decision.allowed {
            return None;
        }

        let retry_after_secs = decision.next_reset.map(|reset| {
            let millis = (reset - now).num_milliseconds().max(0) as u64;
            millis.div_ceil(1000)
        });

        Some(Self {
            error: "rate_limit_exceeded".to_string(),
            message: decision
                .reason
                .clone()
                .unwrap_or_else(|| "Usage limit reached".to_string()),
            current_usage: decision.current_usage,
            limit: decision.limit,
            next_reset: decision
                .next_reset
                .map(|reset| reset.to_rfc3339_opts(SecondsFormat::Millis, true)),
            next_reset_ms: decision.next_reset.map(|reset| reset.timestamp_millis()),
            is_first_day: decision.is_first_day,
            retry_after_secs,
            action: decision.action,
            tier: decision.tier,
        })
    }
}

/// Body of an error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&QuotaError> for ErrorPayload {
    fn from(err: &QuotaError) -> Self {
        let code = match err {
            QuotaError::UserNotFound(_) => "user_not_found",
            QuotaError::Configuration(_) => "configuration_error",
            QuotaError::Storage(_) => "storage_error",
            QuotaError::DeadlineExceeded(_) => "deadline_exceeded",
        };
        Self {
            error: code.to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Status code for a decision: 200 when allowed, 429 when denied
pub fn status_code(decision: &Decision) -> u16 {
    if decision.allowed {
        200
    } else {
        TOO_MANY_REQUESTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::policy::WindowKind;
    use chrono::TimeZone;

    fn denied(next_reset: Option<DateTime<Utc>>) -> Decision {
        Decision {
            allowed: false,
            current_usage: 20,
            limit: 20,
            next_reset,
            is_first_day: true,
            reason: Some("First day limit of 20 interactions reached".to_string()),
            action: ActionType::Explanation,
            tier: SubscriptionTier::Free,
            window: WindowKind::CalendarDay,
            degraded: false,
        }
    }

    #[test]
    fn test_payload_for_denied_decision() {
        let now = Utc.with_ymd_and_hms(2024, 6, 3, 23, 59, 0).unwrap();
        let reset = Utc.with_ymd_and_hms(2024, 6, 4, 0, 0, 0).unwrap();
        let payload = RateLimitPayload::from_decision(&denied(Some(reset)), now).unwrap();

        assert_eq!(payload.error, "rate_limit_exceeded");
        assert_eq!(payload.message, "First day limit of 20 interactions reached");
        assert_eq!(payload.next_reset.as_deref(), Some("2024-06-04T00:00:00.000Z"));
        assert_eq!(payload.next_reset_ms, Some(reset.timestamp_millis()));
        assert_eq!(payload.retry_after_secs, Some(60));

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["currentUsage"], 20);
        assert_eq!(json["isFirstDay"], true);
        assert_eq!(json["action"], "explanation");
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap();
        let reset = now + chrono::Duration::milliseconds(1500);
        let payload = RateLimitPayload::from_decision(&denied(Some(reset)), now).unwrap();
        assert_eq!(payload.retry_after_secs, Some(2));
    }

    #[test]
    fn test_no_payload_when_allowed() {
        let mut decision = denied(None);
        decision.allowed = true;
        assert!(RateLimitPayload::from_decision(&decision, Utc::now()).is_none());
        assert_eq!(status_code(&decision), 200);
    }

    #[test]
    fn test_unknown_reset() {
        let payload = RateLimitPayload::from_decision(&denied(None), Utc::now()).unwrap();
        assert!(payload.next_reset.is_none());
        assert!(payload.retry_after_secs.is_none());
        assert_eq!(status_code(&denied(None)), 429);
    }

    #[test]
    fn test_error_payload() {
        let payload = ErrorPayload::from(&QuotaError::Storage("disk full".into()));
        assert_eq!(payload.error, "storage_error");
        assert!(payload.retryable);
        assert!(payload.message.contains("disk full"));
    }
}
