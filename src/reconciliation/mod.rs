// Accrual reconciliation - resolves pending orders against the accrual service
//
// Layout:
// - one dispatcher ticks every `poll_interval`, fetching the oldest pending
//   orders in batches of `batch_size`
// - a bounded queue (2 x batch_size) feeds a fixed pool of workers
// - a shared backpressure gate pauses everyone when the accrual service
//   answers 429
//
// Shutdown stops the ticker, closes the queue and waits for workers to finish
// the order they hold. Anything still queued stays pending in the store and is
// picked up by the next run.

pub mod dispatcher;
pub mod gate;
pub mod worker;

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;
use tracing::{error, info};

use crate::accrual::AccrualSource;
use crate::ledger::OrderStore;
use crate::shutdown::Shutdown;
use dispatcher::Dispatcher;
use gate::BackpressureGate;
use worker::Worker;

/// Reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub workers: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 5,
            workers: 4,
        }
    }
}

impl ReconcilerConfig {
    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    pub fn queue_capacity(&self) -> usize {
        self.batch_size() * 2
    }
}

/// Owns the dispatcher, the worker pool and the gate they share
pub struct Reconciler {
    config: ReconcilerConfig,
    store: Arc<dyn OrderStore>,
    source: Arc<dyn AccrualSource>,
    gate: Arc<BackpressureGate>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        store: Arc<dyn OrderStore>,
        source: Arc<dyn AccrualSource>,
    ) -> Self {
        Self {
            config,
            store,
            source,
            gate: Arc::new(BackpressureGate::new()),
        }
    }

    pub fn gate(&self) -> Arc<BackpressureGate> {
        self.gate.clone()
    }

    /// Start the reconciler (runs in background)
    pub fn start(self, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until shutdown, then wait for every worker to finish
    pub async fn run(self, shutdown: Shutdown) {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity());
        let queue = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for id in 0..self.config.worker_count() {
            let worker = Worker::new(
                id,
                self.store.clone(),
                self.source.clone(),
                self.gate.clone(),
                queue.clone(),
            );
            workers.spawn(worker.run(shutdown.clone()));
        }

        info!(
            "🚀 Reconciler started: {} workers, batch of {}, polling every {:?}",
            self.config.worker_count(),
            self.config.batch_size(),
            self.config.poll_interval
        );

        let dispatcher = Dispatcher::new(
            self.store.clone(),
            self.gate.clone(),
            tx,
            self.config.poll_interval,
            self.config.batch_size(),
        );
        dispatcher.run(shutdown).await;

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("❌ Reconciliation worker crashed: {}", e);
            }
        }

        info!("✓ Reconciler stopped");
    }
}
