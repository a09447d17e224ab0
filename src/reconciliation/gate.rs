use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::shutdown::Shutdown;

/// Process-wide pause shared by the dispatcher and every worker.
///
/// Holds a single deadline that only ever moves forward. Waiters re-read it
/// on every wake, so extending the pause while they sleep keeps them asleep
/// until the new deadline.
pub struct BackpressureGate {
    deadline: watch::Sender<Option<Instant>>,
}

impl Default for BackpressureGate {
    fn default() -> Self {
        Self::new()
    }
}

impl BackpressureGate {
    pub fn new() -> Self {
        let (deadline, _) = watch::channel(None);
        Self { deadline }
    }

    /// Push the deadline to `now + duration` unless it is already later.
    ///
    /// Returns `true` when the deadline moved, which is also the only case
    /// that wakes waiters.
    pub fn extend(&self, duration: Duration) -> bool {
        let candidate = Instant::now() + duration;
        let moved = self.deadline.send_if_modified(|current| match current {
            Some(existing) if *existing >= candidate => false,
            _ => {
                *current = Some(candidate);
                true
            }
        });

        if moved {
            debug!("Backpressure gate extended by {:?}", duration);
        }
        moved
    }

    /// Current deadline, `None` once it has passed
    pub fn paused_until(&self) -> Option<Instant> {
        let deadline = *self.deadline.borrow();
        deadline.filter(|until| *until > Instant::now())
    }

    pub fn is_paused(&self) -> bool {
        self.paused_until().is_some()
    }

    /// Returns once the gate is open, or `Cancelled` if shutdown fires first.
    pub async fn wait_if_paused(&self, shutdown: &Shutdown) -> AppResult<()> {
        let mut rx = self.deadline.subscribe();

        loop {
            let deadline = *rx.borrow_and_update();
            let Some(until) = deadline.filter(|until| *until > Instant::now()) else {
                return Ok(());
            };

            tokio::select! {
                biased;
                _ = shutdown.triggered() => return Err(AppError::Cancelled),
                // The sender lives in `self`, so this never reports closed.
                _ = rx.changed() => {}
                _ = tokio::time::sleep_until(until) => {}
            }
        }
    }
}
