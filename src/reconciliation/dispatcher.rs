use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::gate::BackpressureGate;
use crate::error::{AppError, AppResult};
use crate::ledger::models::Order;
use crate::ledger::OrderStore;
use crate::shutdown::Shutdown;

/// Periodically moves pending orders from the store onto the work queue
pub struct Dispatcher {
    store: Arc<dyn OrderStore>,
    gate: Arc<BackpressureGate>,
    queue: mpsc::Sender<Order>,
    poll_interval: Duration,
    batch_size: usize,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OrderStore>,
        gate: Arc<BackpressureGate>,
        queue: mpsc::Sender<Order>,
        poll_interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            gate,
            queue,
            poll_interval,
            batch_size,
        }
    }

    /// Tick until shutdown. Consumes the dispatcher so the queue sender is
    /// dropped on return, which closes the queue for the workers.
    pub async fn run(self, shutdown: Shutdown) {
        // First tick after one full period, not immediately
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {}
            }

            match self.dispatch_batch(&shutdown).await {
                Ok(0) => {}
                Ok(count) => debug!("📤 Dispatched {} pending orders", count),
                Err(AppError::Cancelled) => break,
                Err(e) => error!("❌ Failed to dispatch pending orders: {}", e),
            }
        }

        info!("🛑 Dispatcher stopped");
    }

    /// One tick: wait for the gate, fetch the oldest pending orders and queue
    /// them. Blocks on a slow store or a full queue but gives up on shutdown.
    pub async fn dispatch_batch(&self, shutdown: &Shutdown) -> AppResult<usize> {
        self.gate.wait_if_paused(shutdown).await?;

        let orders = tokio::select! {
            biased;
            _ = shutdown.triggered() => return Err(AppError::Cancelled),
            result = self.store.fetch_pending(self.batch_size) => result?,
        };
        let mut sent = 0;

        for order in orders {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => return Err(AppError::Cancelled),
                result = self.queue.send(order) => {
                    if result.is_err() {
                        return Err(AppError::Internal("work queue closed".to_string()));
                    }
                }
            }
            sent += 1;
        }

        Ok(sent)
    }
}
