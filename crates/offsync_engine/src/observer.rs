//! Status callbacks.

use crate::controller::SyncCycleResult;
use offsync_protocol::{ChangeId, Conflict};
use offsync_storage::StorageEstimate;

/// A terminal sync error, kept in the controller's error log.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncErrorReport {
    /// The change that failed, if the error belongs to one.
    pub change_id: Option<ChangeId>,
    /// Endpoint of the change.
    pub endpoint: Option<String>,
    /// Human readable cause.
    pub message: String,
    /// Attempts made before giving up.
    pub retry_count: u32,
    /// When the error was recorded, in milliseconds since the Unix epoch.
    pub at: i64,
}

/// Receives sync status updates.
///
/// Callbacks run on the sync task and should return quickly. Every method
/// has an empty default body.
pub trait SyncObserver: Send + Sync {
    /// A sync episode started.
    fn on_sync_start(&self) {}

    /// A sync episode finished.
    fn on_sync_complete(&self, _result: &SyncCycleResult) {}

    /// A change ran out of retries, or an episode failed outright.
    fn on_sync_error(&self, _error: &SyncErrorReport) {}

    /// The server reported a conflict.
    fn on_conflict(&self, _conflict: &Conflict) {}

    /// Storage usage crossed the warning ratio.
    fn on_storage_warning(&self, _estimate: &StorageEstimate) {}
}
