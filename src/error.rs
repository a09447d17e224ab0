use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Accrual service error: {0}")]
    Accrual(#[from] AccrualError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid order number: {0}")]
    InvalidOrderNumber(String),

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Ledger (orders + withdrawals) errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Order {number} is already registered by another user")]
    OrderOwnedByAnotherUser { number: String },

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    /// The ledger changed between a transaction's reads and its commit
    #[error("Concurrent ledger write, transaction aborted")]
    WriteConflict,
}

/// External accrual service errors
#[derive(Error, Debug)]
pub enum AccrualError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Accrual service returned unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("Malformed accrual payload: {0}")]
    MalformedPayload(String),
}

impl AppError {
    /// Serialization failures (40001) and deadlocks (40P01) are safe to replay
    /// in a fresh transaction. So is an in-memory [`LedgerError::WriteConflict`].
    pub fn is_retryable_conflict(&self) -> bool {
        match self {
            AppError::Database(sqlx::Error::Database(db_error)) => matches!(
                db_error.code().as_deref(),
                Some("40001") | Some("40P01")
            ),
            AppError::Ledger(LedgerError::WriteConflict) => true,
            _ => false,
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            AppError::Ledger(LedgerError::OrderOwnedByAnotherUser { number }) => (
                StatusCode::CONFLICT,
                "ORDER_ALREADY_EXISTS",
                format!("Order {} already exists", number),
            ),
            AppError::Ledger(LedgerError::InsufficientFunds { .. }) => (
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_FUNDS",
                "Insufficient funds".to_string(),
            ),
            AppError::InvalidOrderNumber(number) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "INVALID_ORDER_NUMBER",
                format!("Invalid order number: {}", number),
            ),
            AppError::InvalidInput(message) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                message.clone(),
            ),
            AppError::UnsupportedContentType(content_type) => (
                StatusCode::BAD_REQUEST,
                "UNSUPPORTED_CONTENT_TYPE",
                format!("Unexpected content type: {}", content_type),
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Missing or invalid user identity".to_string(),
            ),
            AppError::Cancelled => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SHUTTING_DOWN",
                "Service is shutting down".to_string(),
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!("❌ Request failed: {}", self);
        }

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
