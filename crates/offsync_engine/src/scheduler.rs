//! Background sync loop.
//!
//! The loop starts an episode when:
//! - it starts and the device is online
//! - connectivity flips to online
//! - the periodic interval ticks while online
//! - [`SyncHandle::trigger`] is called
//! - the earliest backoff deadline passes
//!
//! Going offline only stops the periodic ticks; the ledger is left alone.

use crate::controller::SyncController;
use crate::error::SyncError;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Handle to a running sync loop.
#[derive(Debug)]
pub struct SyncHandle {
    trigger: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Requests an episode as soon as the loop is free.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Returns true once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop. An episode in flight is allowed to finish first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "sync loop panicked");
        }
    }
}

/// Spawns the sync loop for `controller` on the current tokio runtime.
pub fn spawn(controller: Arc<SyncController>) -> SyncHandle {
    let trigger = Arc::new(Notify::new());
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run(controller, Arc::clone(&trigger), shutdown_rx));
    SyncHandle {
        trigger,
        shutdown,
        task,
    }
}

async fn run(
    controller: Arc<SyncController>,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut online = controller.connectivity().subscribe();
    let period = controller.config().sync_interval;
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(interval_ms = period.as_millis() as u64, "sync loop started");

    if *online.borrow_and_update() {
        attempt(&controller).await;
    }

    loop {
        let is_online = *online.borrow();
        let backoff = if is_online {
            match controller.time_until_backoff_deadline() {
                Ok(wait) => wait,
                Err(err) => {
                    tracing::warn!(error = %err, "could not read backoff deadline");
                    None
                }
            }
        } else {
            None
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                if *online.borrow_and_update() {
                    interval.reset();
                    attempt(&controller).await;
                }
            }
            _ = interval.tick(), if is_online => attempt(&controller).await,
            _ = trigger.notified() => attempt(&controller).await,
            _ = time::sleep(backoff.unwrap_or_default()), if backoff.is_some() => {
                attempt(&controller).await;
            }
        }
    }

    tracing::debug!("sync loop stopped");
}

async fn attempt(controller: &SyncController) {
    match controller.sync_now().await {
        Ok(_) => {}
        Err(err @ (SyncError::AlreadySyncing | SyncError::NotConnected)) => {
            tracing::debug!(reason = %err, "sync skipped");
        }
        Err(err) => tracing::warn!(error = %err, "sync failed"),
    }
}
