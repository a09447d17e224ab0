//! Retry-on-conflict execution of a unit of work inside one transaction.
//!
//! Balance checks and withdrawal inserts run under `SERIALIZABLE`, which makes
//! Postgres abort one side of a concurrent conflict with `40001` (or `40P01`
//! on deadlock). Those aborts are expected and get replayed in a fresh
//! transaction; every other failure goes straight back to the caller.

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::shutdown::Shutdown;

/// Source of transactions for [`run_in_transaction`].
#[async_trait]
pub trait Transactor: Send + Sync {
    type Tx: Send;

    async fn begin(&self) -> AppResult<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> AppResult<()>;

    async fn rollback(&self, tx: Self::Tx) -> AppResult<()>;
}

/// Postgres transactor, every transaction is `SERIALIZABLE`.
#[derive(Clone)]
pub struct PgTransactor {
    pool: PgPool,
}

impl PgTransactor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Transactor for PgTransactor {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> AppResult<Self::Tx> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn commit(&self, tx: Self::Tx) -> AppResult<()> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> AppResult<()> {
        tx.rollback().await?;
        Ok(())
    }
}

/// Retry policy configuration
#[derive(Clone, Copy)]
pub struct TxRetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Pause before attempt N+1 is `backoff * N`
    pub backoff: Duration,
    /// Decides which failures are worth a fresh transaction
    pub is_retryable: fn(&AppError) -> bool,
}

impl Default for TxRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(10),
            is_retryable: AppError::is_retryable_conflict,
        }
    }
}

impl TxRetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }
}

/// Run `operation` inside a transaction, replaying it on retryable conflicts.
///
/// Rolls back after every failed attempt. A retryable commit failure is
/// replayed under the same budget. Once the budget is spent the last error is
/// returned. Shutdown aborts with [`AppError::Cancelled`] without spending an
/// attempt.
pub async fn run_in_transaction<X, T, F>(
    transactor: &X,
    policy: &TxRetryPolicy,
    shutdown: &Shutdown,
    mut operation: F,
) -> AppResult<T>
where
    X: Transactor,
    T: Send,
    F: for<'t> FnMut(&'t mut X::Tx) -> BoxFuture<'t, AppResult<T>> + Send,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;
    let mut attempt = 0;

    while attempt < max_attempts {
        if shutdown.is_triggered() {
            return Err(AppError::Cancelled);
        }
        attempt += 1;

        let mut tx = transactor.begin().await?;

        let result = tokio::select! {
            biased;
            _ = shutdown.triggered() => None,
            result = operation(&mut tx) => Some(result),
        };

        let error = match result {
            None => {
                rollback_quietly(transactor, tx).await;
                return Err(AppError::Cancelled);
            }
            Some(Ok(value)) => match transactor.commit(tx).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!("✓ Transaction committed after {} attempts", attempt);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            },
            Some(Err(error)) => {
                rollback_quietly(transactor, tx).await;
                error
            }
        };

        if !(policy.is_retryable)(&error) {
            debug!("Transaction failed with non-retryable error: {}", error);
            return Err(error);
        }

        warn!(
            attempt,
            max_attempts,
            error = %error,
            "⚠️  Transaction conflict, retrying"
        );
        last_error = Some(error);

        if attempt < max_attempts {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => return Err(AppError::Cancelled),
                _ = tokio::time::sleep(policy.backoff * attempt) => {}
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        AppError::Internal("transaction retry budget exhausted".to_string())
    }))
}

/// A failed rollback is only logged; the caller keeps the error that caused it.
async fn rollback_quietly<X: Transactor>(transactor: &X, tx: X::Tx) {
    if let Err(e) = transactor.rollback(tx).await {
        warn!(error = %e, "⚠️  Transaction rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Scripted transactor: counts begin/commit/rollback and can fail
    /// commits or rollbacks.
    #[derive(Default)]
    struct FakeTransactor {
        begins: AtomicU32,
        commits: AtomicU32,
        rollbacks: AtomicU32,
        commit_failures: Mutex<VecDeque<AppError>>,
        rollback_failures: Mutex<VecDeque<AppError>>,
    }

    #[async_trait]
    impl Transactor for FakeTransactor {
        type Tx = u32;

        async fn begin(&self) -> AppResult<u32> {
            Ok(self.begins.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn commit(&self, _tx: u32) -> AppResult<()> {
            if let Some(error) = self.commit_failures.lock().pop_front() {
                return Err(error);
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(&self, _tx: u32) -> AppResult<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.rollback_failures.lock().pop_front() {
                return Err(error);
            }
            Ok(())
        }
    }

    /// Treat `Internal("conflict")` as the retryable class in these tests.
    fn conflict() -> AppError {
        AppError::Internal("conflict".to_string())
    }

    fn is_test_conflict(error: &AppError) -> bool {
        matches!(error, AppError::Internal(message) if message == "conflict")
    }

    fn policy(max_attempts: u32) -> TxRetryPolicy {
        TxRetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
            is_retryable: is_test_conflict,
        }
    }

    #[tokio::test]
    async fn test_conflict_is_retried_until_success() {
        let transactor = FakeTransactor::default();
        let (_trigger, shutdown) = shutdown::channel();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let value = run_in_transaction(&transactor, &policy(5), &shutdown, move |tx| {
            let counter = counter.clone();
            Box::pin(async move {
                let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if seen < 3 {
                    return Err(conflict());
                }
                Ok(*tx * 10)
            })
        })
        .await
        .unwrap();

        assert_eq!(value, 30);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(transactor.begins.load(Ordering::SeqCst), 3);
        assert_eq!(transactor.rollbacks.load(Ordering::SeqCst), 2);
        assert_eq!(transactor.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let transactor = FakeTransactor::default();
        let (_trigger, shutdown) = shutdown::channel();

        let result: AppResult<()> =
            run_in_transaction(&transactor, &policy(5), &shutdown, |_tx| {
                Box::pin(async { Err(AppError::InvalidInput("nope".to_string())) })
            })
            .await;

        assert!(matches!(result, Err(AppError::InvalidInput(_))));
        assert_eq!(transactor.begins.load(Ordering::SeqCst), 1);
        assert_eq!(transactor.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_returns_last_error() {
        let transactor = FakeTransactor::default();
        let (_trigger, shutdown) = shutdown::channel();

        let result: AppResult<()> =
            run_in_transaction(&transactor, &policy(4), &shutdown, |_tx| {
                Box::pin(async { Err(conflict()) })
            })
            .await;

        assert!(matches!(result, Err(ref e) if is_test_conflict(e)));
        assert_eq!(transactor.begins.load(Ordering::SeqCst), 4);
        assert_eq!(transactor.commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retryable_commit_failure_is_retried() {
        let transactor = FakeTransactor::default();
        transactor.commit_failures.lock().push_back(conflict());
        let (_trigger, shutdown) = shutdown::channel();

        let value = run_in_transaction(&transactor, &policy(5), &shutdown, |_tx| {
            Box::pin(async { Ok("done") })
        })
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert_eq!(transactor.begins.load(Ordering::SeqCst), 2);
        assert_eq!(transactor.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let transactor = FakeTransactor::default();
        let (trigger, shutdown) = shutdown::channel();
        trigger.trigger();

        let result: AppResult<()> =
            run_in_transaction(&transactor, &policy(5), &shutdown, |_tx| {
                Box::pin(async { Ok(()) })
            })
            .await;

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(transactor.begins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_rollback_keeps_the_original_error() {
        let transactor = FakeTransactor::default();
        transactor
            .rollback_failures
            .lock()
            .push_back(AppError::Internal("connection reset".to_string()));
        let (_trigger, shutdown) = shutdown::channel();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let value = run_in_transaction(&transactor, &policy(3), &shutdown, move |_tx| {
            let counter = counter.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(conflict());
                }
                Ok("second try")
            })
        })
        .await
        .unwrap();

        assert_eq!(value, "second try");
        assert_eq!(transactor.begins.load(Ordering::SeqCst), 2);
        assert_eq!(transactor.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(transactor.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_rollback_does_not_mask_non_retryable_error() {
        let transactor = FakeTransactor::default();
        transactor.rollback_failures.lock().push_back(conflict());
        let (_trigger, shutdown) = shutdown::channel();

        let result: AppResult<()> =
            run_in_transaction(&transactor, &policy(3), &shutdown, |_tx| {
                Box::pin(async { Err(AppError::InvalidInput("bad".to_string())) })
            })
            .await;

        assert!(matches!(result, Err(AppError::InvalidInput(_))));
        assert_eq!(transactor.begins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let transactor = FakeTransactor::default();
        let (trigger, shutdown) = shutdown::channel();
        let slow = TxRetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_secs(3600),
            is_retryable: is_test_conflict,
        };

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });

        let started = tokio::time::Instant::now();
        let result: AppResult<()> = run_in_transaction(&transactor, &slow, &shutdown, |_tx| {
            Box::pin(async { Err(conflict()) })
        })
        .await;

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(transactor.begins.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_policy_never_drops_below_one_attempt() {
        assert_eq!(TxRetryPolicy::with_max_attempts(0).max_attempts, 1);
        assert_eq!(TxRetryPolicy::default().max_attempts, 5);
    }
}
