pub mod memory;
pub mod models;
pub mod repository;
pub mod transaction;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::AppResult;
use crate::shutdown::Shutdown;
use models::{Balance, CreateOrderOutcome, Order, OrderStatus, TransitionOutcome, Withdrawal};

pub use memory::InMemoryLedger;
pub use repository::LedgerRepository;

/// Orders and withdrawals, the single source of truth for balances.
///
/// Consumed both by the reconciler (pending fetch + status writes) and by
/// the HTTP layer (order registration, balance, withdrawals).
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Register `number` for `user_id`.
    ///
    /// Returns [`CreateOrderOutcome::AlreadyOwned`] when the same user submits
    /// the number again and `LedgerError::OrderOwnedByAnotherUser` when it
    /// belongs to someone else.
    async fn create_order(&self, user_id: Uuid, number: &str) -> AppResult<CreateOrderOutcome>;

    /// All orders of a user, newest first
    async fn list_orders(&self, user_id: Uuid) -> AppResult<Vec<Order>>;

    /// Up to `limit` NEW/PROCESSING orders, oldest first
    async fn fetch_pending(&self, limit: usize) -> AppResult<Vec<Order>>;

    /// Conditional status write; a terminal row yields `Ignored`.
    ///
    /// `accrual` only overwrites the stored amount when it is `Some`.
    async fn transition_status(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> AppResult<TransitionOutcome>;

    async fn balance_snapshot(&self, user_id: Uuid) -> AppResult<Balance>;

    /// Check the balance and insert the withdrawal atomically.
    async fn create_withdrawal(
        &self,
        user_id: Uuid,
        order_number: &str,
        amount: Decimal,
        shutdown: &Shutdown,
    ) -> AppResult<Withdrawal>;

    /// All withdrawals of a user, oldest first
    async fn list_withdrawals(&self, user_id: Uuid) -> AppResult<Vec<Withdrawal>>;
}
