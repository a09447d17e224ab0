use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgExecutor, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use super::transaction::{run_in_transaction, PgTransactor, TxRetryPolicy};
use super::OrderStore;
use crate::error::{AppError, AppResult, LedgerError};
use crate::shutdown::Shutdown;

const ORDER_COLUMNS: &str = "id, user_id, number, accrual, status, uploaded_at";
const WITHDRAWAL_COLUMNS: &str = "id, user_id, order_number, amount, processed_at";

/// Ledger repository - THE source of truth for orders and balances
pub struct LedgerRepository {
    pub pool: PgPool,
    transactor: PgTransactor,
    retry_policy: TxRetryPolicy,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry_policy(pool, TxRetryPolicy::default())
    }

    pub fn with_retry_policy(pool: PgPool, retry_policy: TxRetryPolicy) -> Self {
        Self {
            transactor: PgTransactor::new(pool.clone()),
            pool,
            retry_policy,
        }
    }

    /// Sum of processed accruals and of withdrawals, read in one statement
    async fn read_balance<'e>(executor: impl PgExecutor<'e>, user_id: Uuid) -> AppResult<Balance> {
        let (accrued, withdrawn): (Decimal, Decimal) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COALESCE(SUM(accrual), 0) FROM orders
                    WHERE user_id = $1 AND status = 'PROCESSED') AS accrued,
                (SELECT COALESCE(SUM(amount), 0) FROM withdrawals
                    WHERE user_id = $1) AS withdrawn
            "#,
        )
        .bind(user_id)
        .fetch_one(executor)
        .await?;

        Ok(Balance::from_totals(accrued, withdrawn))
    }

    async fn insert_withdrawal<'e>(
        executor: impl PgExecutor<'e>,
        user_id: Uuid,
        order_number: &str,
        amount: Decimal,
    ) -> AppResult<Withdrawal> {
        let withdrawal = sqlx::query_as::<_, Withdrawal>(&format!(
            r#"
            INSERT INTO withdrawals (user_id, order_number, amount)
            VALUES ($1, $2, $3)
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        ))
        .bind(user_id)
        .bind(order_number)
        .bind(amount)
        .fetch_one(executor)
        .await?;

        Ok(withdrawal)
    }
}

#[async_trait]
impl OrderStore for LedgerRepository {
    // ========== ORDER OPERATIONS ==========

    async fn create_order(&self, user_id: Uuid, number: &str) -> AppResult<CreateOrderOutcome> {
        let inserted = sqlx::query_as::<_, Order>(&format!(
            r#"
            INSERT INTO orders (user_id, number)
            VALUES ($1, $2)
            ON CONFLICT (number) DO NOTHING
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(user_id)
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(order) = inserted {
            info!("📝 Order {} registered for user {}", order.number, user_id);
            return Ok(CreateOrderOutcome::Created(order));
        }

        // Orders are never deleted, so the conflicting row is still there.
        let owner: Option<Uuid> = sqlx::query_scalar("SELECT user_id FROM orders WHERE number = $1")
            .bind(number)
            .fetch_optional(&self.pool)
            .await?;

        match owner {
            Some(owner) if owner == user_id => Ok(CreateOrderOutcome::AlreadyOwned),
            Some(_) => Err(LedgerError::OrderOwnedByAnotherUser {
                number: number.to_string(),
            }
            .into()),
            None => Err(AppError::Internal(format!(
                "order {} conflicted but could not be found",
                number
            ))),
        }
    }

    async fn list_orders(&self, user_id: Uuid) -> AppResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            r#"
            SELECT {}
            FROM orders
            WHERE user_id = $1
            ORDER BY uploaded_at DESC
            "#,
            ORDER_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn fetch_pending(&self, limit: usize) -> AppResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            r#"
            SELECT {}
            FROM orders
            WHERE status IN ('NEW', 'PROCESSING')
            ORDER BY uploaded_at ASC, id ASC
            LIMIT $1
            "#,
            ORDER_COLUMNS
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn transition_status(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> AppResult<TransitionOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, accrual = COALESCE($3, accrual)
            WHERE number = $1 AND status NOT IN ('PROCESSED', 'INVALID')
            "#,
        )
        .bind(number)
        .bind(status)
        .bind(accrual.map(normalize_amount))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Order {} is terminal or unknown, {} ignored", number, status);
            return Ok(TransitionOutcome::Ignored);
        }

        Ok(TransitionOutcome::Applied)
    }

    // ========== BALANCE OPERATIONS ==========

    async fn balance_snapshot(&self, user_id: Uuid) -> AppResult<Balance> {
        Self::read_balance(&self.pool, user_id).await
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
                let balance = Self::read_balance(&mut **tx, user_id).await?;
                if !balance.covers(amount) {
                    return Err(LedgerError::InsufficientFunds {
                        required: amount,
                        available: balance.current,
                    }
                    .into());
                }

                Self::insert_withdrawal(&mut **tx, user_id, &order_number, amount).await
            })
        })
        .await?;

        info!(
            "💸 Withdrawal {} of {} created for user {}",
            withdrawal.id, withdrawal.amount, user_id
        );
        Ok(withdrawal)
    }

    async fn list_withdrawals(&self, user_id: Uuid) -> AppResult<Vec<Withdrawal>> {
        let withdrawals = sqlx::query_as::<_, Withdrawal>(&format!(
            r#"
            SELECT {}
            FROM withdrawals
            WHERE user_id = $1
            ORDER BY processed_at ASC
            "#,
            WITHDRAWAL_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(withdrawals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use rust_decimal_macros::dec;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn test_sub_cent_withdrawal_rejected_before_touching_the_database() {
        // Nothing listens here; any query would fail with a database error.
        let pool = PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(200))
            .connect_lazy("postgres://ledger@127.0.0.1:1/ledger")
            .unwrap();
        let repository = LedgerRepository::new(pool);
        let (_trigger, shutdown) = shutdown::channel();

        let result = repository
            .create_withdrawal(Uuid::new_v4(), "2377225624", dec!(0.001), &shutdown)
            .await;

        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }
}
