use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::transaction::{run_in_transaction, Transactor, TxRetryPolicy};
use super::OrderStore;
use crate::error::{AppResult, LedgerError};
use crate::shutdown::Shutdown;

#[derive(Default)]
struct LedgerState {
    /// Insertion order doubles as upload order
    orders: Vec<Order>,
    withdrawals: Vec<Withdrawal>,
    /// Bumped on every write, checked by optimistic commits
    version: u64,
}

impl LedgerState {
    fn balance(&self, user_id: Uuid) -> Balance {
        let accrued = self
            .orders
            .iter()
            .filter(|o| o.user_id == user_id && o.status == OrderStatus::Processed)
            .filter_map(|o| o.accrual)
            .sum::<Decimal>();
        let withdrawn = self
            .withdrawals
            .iter()
            .filter(|w| w.user_id == user_id)
            .map(|w| w.amount)
            .sum::<Decimal>();

        Balance::from_totals(accrued, withdrawn)
    }
}

// ========== OPTIMISTIC TRANSACTIONS ==========

/// Transactor over the shared in-memory state.
///
/// Reads go straight to the committed state. Writes are staged and applied on
/// commit, which fails with [`LedgerError::WriteConflict`] when anything was
/// written since `begin`.
#[derive(Clone, Default)]
pub struct MemoryTransactor {
    state: Arc<Mutex<LedgerState>>,
}

pub struct MemoryTx {
    state: Arc<Mutex<LedgerState>>,
    base_version: u64,
    staged: Vec<Withdrawal>,
}

impl MemoryTx {
    pub fn balance(&self, user_id: Uuid) -> Balance {
        self.state.lock().balance(user_id)
    }

    pub fn stage_withdrawal(&mut self, withdrawal: Withdrawal) {
        self.staged.push(withdrawal);
    }
}

#[async_trait]
impl Transactor for MemoryTransactor {
    type Tx = MemoryTx;

    async fn begin(&self) -> AppResult<MemoryTx> {
        let base_version = self.state.lock().version;
        Ok(MemoryTx {
            state: self.state.clone(),
            base_version,
            staged: Vec::new(),
        })
    }

    async fn commit(&self, tx: MemoryTx) -> AppResult<()> {
        let mut state = tx.state.lock();
        if state.version != tx.base_version {
            return Err(LedgerError::WriteConflict.into());
        }
        if !tx.staged.is_empty() {
            state.withdrawals.extend(tx.staged);
            state.version += 1;
        }
        Ok(())
    }

    async fn rollback(&self, _tx: MemoryTx) -> AppResult<()> {
        Ok(())
    }
}

/// In-memory ledger with the same semantics as the Postgres repository.
///
/// Withdrawals go through [`run_in_transaction`] like they do on Postgres,
/// with optimistic version checks standing in for `SERIALIZABLE`. Used by
/// tests and by local runs without a database.
#[derive(Default)]
pub struct InMemoryLedger {
    transactor: MemoryTransactor,
    retry_policy: TxRetryPolicy,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> &Mutex<LedgerState> {
        &self.transactor.state
    }

    /// Look up a single order by number
    pub fn get_order(&self, number: &str) -> Option<Order> {
        self.state()
            .lock()
            .orders
            .iter()
            .find(|o| o.number == number)
            .cloned()
    }
}

#[async_trait]
impl OrderStore for InMemoryLedger {
    async fn create_order(&self, user_id: Uuid, number: &str) -> AppResult<CreateOrderOutcome> {
        let mut state = self.state().lock();

        if let Some(existing) = state.orders.iter().find(|o| o.number == number) {
            if existing.user_id == user_id {
                return Ok(CreateOrderOutcome::AlreadyOwned);
            }
            return Err(LedgerError::OrderOwnedByAnotherUser {
                number: number.to_string(),
            }
            .into());
        }

        let order = Order {
            id: Uuid::new_v4(),
            user_id,
            number: number.to_string(),
            accrual: None,
            status: OrderStatus::New,
            uploaded_at: Utc::now(),
        };
        state.orders.push(order.clone());
        state.version += 1;

        Ok(CreateOrderOutcome::Created(order))
    }

    async fn list_orders(&self, user_id: Uuid) -> AppResult<Vec<Order>> {
        let state = self.state().lock();
        let orders = state
            .orders
            .iter()
            .rev()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        Ok(orders)
    }

    async fn fetch_pending(&self, limit: usize) -> AppResult<Vec<Order>> {
        let state = self.state().lock();
        let pending = state
            .orders
            .iter()
            .filter(|o| o.status.is_pending())
            .take(limit)
            .cloned()
            .collect();
        Ok(pending)
    }

    async fn transition_status(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> AppResult<TransitionOutcome> {
        let mut state = self.state().lock();

        let Some(order) = state
            .orders
            .iter_mut()
            .find(|o| o.number == number && !o.status.is_terminal())
        else {
            return Ok(TransitionOutcome::Ignored);
        };

        order.status = status;
        if let Some(accrual) = accrual {
            order.accrual = Some(normalize_amount(accrual));
        }
        state.version += 1;

        Ok(TransitionOutcome::Applied)
    }

    async fn balance_snapshot(&self, user_id: Uuid) -> AppResult<Balance> {
        Ok(self.state().lock().balance(user_id))
    }

    async fn create_withdrawal(
        &self,
        user_id: Uuid,
        order_number: &str,
        amount: Decimal,
        shutdown: &Shutdown,
    ) -> AppResult<Withdrawal> {
        let amount = checked_withdrawal_amount(amount)?;
        let order_number = order_number.to_string();

        let withdrawal = run_in_transaction(&self.transactor, &self.retry_policy, shutdown, move |tx| {
            let order_number = order_number.clone();
            Box::pin(async move {
                let balance = tx.balance(user_id);
                if !balance.covers(amount) {
                    return Err(LedgerError::InsufficientFunds {
                        required: amount,
                        available: balance.current,
                    }
                    .into());
                }

                let withdrawal = Withdrawal {
                    id: Uuid::new_v4(),
                    user_id,
                    order_number,
                    amount,
                    processed_at: Utc::now(),
                };
                tx.stage_withdrawal(withdrawal.clone());
                Ok(withdrawal)
            })
        })
        .await?;

        debug!(
            "💸 Withdrawal {} of {} recorded for user {}",
            withdrawal.id, withdrawal.amount, user_id
        );
        Ok(withdrawal)
    }

    async fn list_withdrawals(&self, user_id: Uuid) -> AppResult<Vec<Withdrawal>> {
        let state = self.state().lock();
        let withdrawals = state
            .withdrawals
            .iter()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect();
        Ok(withdrawals)
    }
}
