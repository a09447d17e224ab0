pub mod client;
pub mod models;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::shutdown::Shutdown;
use models::AccrualOutcome;

pub use client::AccrualClient;

/// Anything that can report the accrual state of an order
#[async_trait]
pub trait AccrualSource: Send + Sync {
    /// Returns `AppError::Cancelled` as soon as `shutdown` fires.
    async fn fetch(&self, number: &str, shutdown: &Shutdown) -> AppResult<AccrualOutcome>;
}
