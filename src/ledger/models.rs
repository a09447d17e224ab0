use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Order status enum
///
/// `NEW → PROCESSING → {PROCESSED | INVALID}`. Both `PROCESSED` and
/// `INVALID` are terminal: the store never overwrites them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "order_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Processed | OrderStatus::Invalid)
    }

    /// Statuses the reconciler still has to resolve
    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }
}

/// Order entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub number: String,
    pub accrual: Option<Decimal>,
    pub status: OrderStatus,
    pub uploaded_at: DateTime<Utc>,
}

/// Result of registering an order number
#[derive(Debug, Clone)]
pub enum CreateOrderOutcome {
    Created(Order),
    /// The caller already owns this number; nothing was written.
    AlreadyOwned,
}

/// Result of a conditional status write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Terminal (or unknown) order, the row was left untouched.
    Ignored,
}

/// Withdrawal entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Withdrawal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub order_number: String,
    pub amount: Decimal,
    pub processed_at: DateTime<Utc>,
}

/// Derived balance, never stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub current: Decimal,
    pub withdrawn: Decimal,
}

impl Balance {
    pub fn from_totals(accrued: Decimal, withdrawn: Decimal) -> Self {
        Self {
            current: accrued - withdrawn,
            withdrawn,
        }
    }

    pub fn covers(&self, amount: Decimal) -> bool {
        self.current >= amount
    }
}

/// Money is kept with two fractional digits, like the NUMERIC(12,2) columns.
pub fn normalize_amount(amount: Decimal) -> Decimal {
    amount.round_dp(2)
}

/// Normalized withdrawal amount, rejected when nothing is left after rounding.
pub fn checked_withdrawal_amount(amount: Decimal) -> AppResult<Decimal> {
    let normalized = normalize_amount(amount);
    if normalized <= Decimal::ZERO {
        return Err(AppError::InvalidInput(format!(
            "Withdrawal amount {} must be at least 0.01",
            amount
        )));
    }
    Ok(normalized)
}
