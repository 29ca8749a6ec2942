//! Retry command implementation.

use super::{has_collection, open_ledger, open_store, parse_change_id, CliError};
use offsync_protocol::{ChangeId, ChangeState, QueuedChange, SyncStatus};
use offsync_storage::{LocalStore, RecordKey, WriteBatch};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Runs the retry command.
pub fn run(path: &Path, change_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let change_id = parse_change_id(change_id)?;
    let store = open_store(path)?;
    let change = retry(&store, change_id)?;

    println!(
        "✓ Change {} ({} {}) will be sent on the next sync",
        change.id, change.method, change.endpoint
    );
    Ok(())
}

/// Resets a change so the next sync cycle sends it.
///
/// An exhausted change gets its retry budget back and returns to pending.
/// Any backoff deadline is cleared. The targeted record is marked pending in
/// the same write.
pub fn retry(
    store: &Arc<LocalStore>,
    change_id: ChangeId,
) -> Result<QueuedChange, Box<dyn std::error::Error>> {
    let ledger = open_ledger(store)?.ok_or(CliError::UnknownChange(change_id))?;
    let mut change = ledger
        .get(change_id)?
        .ok_or(CliError::UnknownChange(change_id))?;

    if change.is_exhausted() {
        change.reset_retries();
        change.state = ChangeState::Pending;
    }
    change.next_attempt_at = None;

    let mut batch = WriteBatch::new();
    ledger.stage_put(&mut batch, &change)?;
    if let Some(key) = change.record_id().and_then(RecordKey::from_value) {
        if has_collection(store, &change.endpoint) {
            if let Some(mut record) = store.get(&change.endpoint, &key)? {
                SyncStatus::Pending.apply(&mut record);
                batch.put_verbatim(change.endpoint.as_str(), Value::Object(record));
            }
        }
    }
    store.write(batch)?;

    tracing::info!(%change_id, "change rescheduled");
    Ok(change)
}
