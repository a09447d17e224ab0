use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ledger::models::OrderStatus;

/// Pause applied when a 429 carries no usable `Retry-After`
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Order status as reported by the accrual service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

impl AccrualStatus {
    /// Local status this remote status resolves to
    pub fn ledger_status(&self) -> OrderStatus {
        match self {
            AccrualStatus::Registered | AccrualStatus::Processing => OrderStatus::Processing,
            AccrualStatus::Invalid => OrderStatus::Invalid,
            AccrualStatus::Processed => OrderStatus::Processed,
        }
    }
}

/// `GET /api/orders/{number}` response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccrualResponse {
    pub order: String,
    pub status: AccrualStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Decimal>,
}

/// Classified answer of the accrual service for one order
#[derive(Debug, Clone, PartialEq)]
pub enum AccrualOutcome {
    /// 204: the service has not seen this order yet
    NotRegistered,
    /// 429: every caller must back off for `retry_after`
    RateLimited { retry_after: Duration },
    /// 200
    Resolved {
        status: AccrualStatus,
        accrual: Option<Decimal>,
    },
}

impl From<AccrualResponse> for AccrualOutcome {
    fn from(response: AccrualResponse) -> Self {
        AccrualOutcome::Resolved {
            status: response.status,
            accrual: response.accrual,
        }
    }
}

/// Whole seconds from a `Retry-After` header, [`DEFAULT_RETRY_AFTER`] otherwise.
pub fn parse_retry_after(header: Option<&str>) -> Duration {
    header
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_retry_after_parsing() {
        assert_eq!(parse_retry_after(Some("60")), Duration::from_secs(60));
        assert_eq!(parse_retry_after(Some(" 3 ")), Duration::from_secs(3));
        assert_eq!(parse_retry_after(Some("0")), Duration::ZERO);
        assert_eq!(parse_retry_after(None), DEFAULT_RETRY_AFTER);
        assert_eq!(parse_retry_after(Some("soon")), DEFAULT_RETRY_AFTER);
        assert_eq!(parse_retry_after(Some("-5")), DEFAULT_RETRY_AFTER);
        assert_eq!(
            parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")),
            DEFAULT_RETRY_AFTER
        );
    }

    #[test]
    fn test_remote_statuses_map_onto_ledger() {
        assert_eq!(AccrualStatus::Registered.ledger_status(), OrderStatus::Processing);
        assert_eq!(AccrualStatus::Processing.ledger_status(), OrderStatus::Processing);
        assert_eq!(AccrualStatus::Invalid.ledger_status(), OrderStatus::Invalid);
        assert_eq!(AccrualStatus::Processed.ledger_status(), OrderStatus::Processed);
    }

    #[test]
    fn test_response_deserialization() {
        let processed: AccrualResponse =
            serde_json::from_str(r#"{"order":"79927398713","status":"PROCESSED","accrual":729.98}"#)
                .unwrap();
        assert_eq!(processed.status, AccrualStatus::Processed);
        assert_eq!(processed.accrual, Some(dec!(729.98)));

        let registered: AccrualResponse =
            serde_json::from_str(r#"{"order":"79927398713","status":"REGISTERED"}"#).unwrap();
        assert_eq!(registered.status, AccrualStatus::Registered);
        assert!(registered.accrual.is_none());

        let unknown = serde_json::from_str::<AccrualResponse>(
            r#"{"order":"79927398713","status":"LOST"}"#,
        );
        assert!(unknown.is_err());
    }
}
