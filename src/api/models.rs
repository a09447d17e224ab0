use crate::ledger::models::*;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

// ========== REQUEST MODELS ==========

/// Request to spend accrued points against an order
#[derive(Debug, Deserialize, Validate)]
pub struct WithdrawRequest {
    #[validate(length(min = 1, max = 64, message = "order number is required"))]
    pub order: String,

    #[validate(custom = "validate_positive_sum")]
    pub sum: Decimal,
}

/// The sum is stored with two fractional digits; it has to stay positive after rounding.
fn validate_positive_sum(sum: &Decimal) -> Result<(), ValidationError> {
    if normalize_amount(*sum) > Decimal::ZERO {
        return Ok(());
    }

    let mut error = ValidationError::new("positive_sum");
    error.message = Some("sum must be at least 0.01".into());
    Err(error)
}

// ========== RESPONSE MODELS ==========

/// Order as shown to its owner
#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub number: String,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            number: order.number,
            status: order.status,
            accrual: order.accrual,
            uploaded_at: order.uploaded_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub current: Decimal,
    pub withdrawn: Decimal,
}

impl From<Balance> for BalanceResponse {
    fn from(balance: Balance) -> Self {
        Self {
            current: balance.current,
            withdrawn: balance.withdrawn,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WithdrawalResponse {
    pub order: String,
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl From<Withdrawal> for WithdrawalResponse {
    fn from(withdrawal: Withdrawal) -> Self {
        Self {
            order: withdrawal.order_number,
            sum: withdrawal.amount,
            processed_at: withdrawal.processed_at,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    /// Seconds left on the accrual rate-limit pause, if any
    pub accrual_paused_for_secs: Option<u64>,
}
