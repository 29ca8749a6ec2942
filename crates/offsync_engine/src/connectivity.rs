//! Online/offline signal.

use std::sync::Arc;
use tokio::sync::watch;

/// Tracks whether the device can reach the server.
///
/// Platform code calls [`set_online`](Self::set_online) on connectivity
/// events; the scheduler and any UI [`subscribe`](Self::subscribe) to
/// transitions. Clones share the same signal.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    /// Creates a monitor with an initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Returns the current state.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Updates the state. Returns true if it changed.
    ///
    /// Setting the current value again does not wake subscribers.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });

        if changed {
            if online {
                tracing::info!("connectivity restored");
            } else {
                tracing::info!("connectivity lost, changes will be queued");
            }
        }
        changed
    }

    /// Marks the device online.
    pub fn go_online(&self) -> bool {
        self.set_online(true)
    }

    /// Marks the device offline.
    pub fn go_offline(&self) -> bool {
        self.set_online(false)
    }

    /// Subscribes to transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
