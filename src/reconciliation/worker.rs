use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use super::gate::BackpressureGate;
use crate::accrual::models::AccrualOutcome;
use crate::accrual::AccrualSource;
use crate::error::AppError;
use crate::ledger::models::{Order, OrderStatus, TransitionOutcome};
use crate::ledger::OrderStore;
use crate::shutdown::Shutdown;

/// Receiving end of the work queue, shared by every worker
pub type SharedQueue = Arc<Mutex<mpsc::Receiver<Order>>>;

/// What a worker did with one order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Unknown to the accrual service, retried on a later poll
    NotRegistered,
    /// Rate limited, the gate now holds everyone for this long
    Paused(Duration),
    Updated(OrderStatus),
    /// Nothing to write, or the order became terminal meanwhile
    Unchanged,
    /// Lookup or write failed and was logged
    Failed,
    Cancelled,
}

pub struct Worker {
    id: usize,
    store: Arc<dyn OrderStore>,
    source: Arc<dyn AccrualSource>,
    gate: Arc<BackpressureGate>,
    queue: SharedQueue,
}

impl Worker {
    pub fn new(
        id: usize,
        store: Arc<dyn OrderStore>,
        source: Arc<dyn AccrualSource>,
        gate: Arc<BackpressureGate>,
        queue: SharedQueue,
    ) -> Self {
        Self {
            id,
            store,
            source,
            gate,
            queue,
        }
    }

    /// Process orders until the queue closes or shutdown fires
    pub async fn run(self, shutdown: Shutdown) {
        debug!("👷 Worker {} started", self.id);

        while let Some(order) = self.next_order(&shutdown).await {
            if self.process(&order, &shutdown).await == ReconcileAction::Cancelled {
                break;
            }
        }

        debug!("👷 Worker {} stopped", self.id);
    }

    async fn next_order(&self, shutdown: &Shutdown) -> Option<Order> {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => None,
            order = async { self.queue.lock().await.recv().await } => order,
        }
    }

    /// Resolve one order against the accrual service and record the result
    pub async fn process(&self, order: &Order, shutdown: &Shutdown) -> ReconcileAction {
        if self.gate.wait_if_paused(shutdown).await.is_err() {
            return ReconcileAction::Cancelled;
        }

        let outcome = match self.source.fetch(&order.number, shutdown).await {
            Ok(outcome) => outcome,
            Err(AppError::Cancelled) => return ReconcileAction::Cancelled,
            Err(e) => {
                warn!(
                    worker = self.id,
                    order_number = %order.number,
                    error = %e,
                    "⚠️  Accrual lookup failed"
                );
                return ReconcileAction::Failed;
            }
        };

        match outcome {
            AccrualOutcome::NotRegistered => {
                debug!(order_number = %order.number, "Order not registered in accrual service yet");
                ReconcileAction::NotRegistered
            }
            AccrualOutcome::RateLimited { retry_after } => {
                if self.gate.extend(retry_after) {
                    warn!(
                        order_number = %order.number,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "⏸️  Accrual service rate limit hit, pausing all workers"
                    );
                }
                ReconcileAction::Paused(retry_after)
            }
            AccrualOutcome::Resolved { status, accrual } => {
                let new_status = status.ledger_status();
                let accrual = if new_status == OrderStatus::Processed {
                    accrual
                } else {
                    None
                };
                self.apply(order, new_status, accrual, shutdown).await
            }
        }
    }

    async fn apply(
        &self,
        order: &Order,
        new_status: OrderStatus,
        accrual: Option<Decimal>,
        shutdown: &Shutdown,
    ) -> ReconcileAction {
        if order.status == new_status && accrual.is_none() {
            return ReconcileAction::Unchanged;
        }

        let result = tokio::select! {
            biased;
            _ = shutdown.triggered() => return ReconcileAction::Cancelled,
            result = self.store.transition_status(&order.number, new_status, accrual) => result,
        };

        match result {
            Ok(TransitionOutcome::Applied) => {
                info!(
                    order_number = %order.number,
                    new_status = %new_status,
                    "✓ Order status updated"
                );
                ReconcileAction::Updated(new_status)
            }
            Ok(TransitionOutcome::Ignored) => ReconcileAction::Unchanged,
            Err(e) => {
                error!(
                    order_number = %order.number,
                    new_status = %new_status,
                    error = %e,
                    "❌ Failed to update order status"
                );
                ReconcileAction::Failed
            }
        }
    }
}
