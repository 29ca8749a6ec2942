//! Discard command implementation.

use super::{has_collection, open_ledger, open_store, parse_change_id, CliError};
use offsync_engine::SYNC_CONFLICTS;
use offsync_protocol::{ChangeId, ChangeState, QueuedChange, SyncStatus};
use offsync_storage::{LocalStore, RecordKey, WriteBatch};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Runs the discard command.
pub fn run(path: &Path, change_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let change_id = parse_change_id(change_id)?;
    let store = open_store(path)?;
    let change = discard(&store, change_id)?;

    println!(
        "✓ Discarded change {} ({} {})",
        change.id, change.method, change.endpoint
    );
    if change.is_deferred() {
        println!("  Its conflict was removed as well");
    }
    Ok(())
}

/// Removes a change from the ledger.
///
/// A deferred change takes its conflict with it. The targeted record's
/// status is recomputed from the changes still referencing it.
pub fn discard(
    store: &Arc<LocalStore>,
    change_id: ChangeId,
) -> Result<QueuedChange, Box<dyn std::error::Error>> {
    let ledger = open_ledger(store)?.ok_or(CliError::UnknownChange(change_id))?;
    let change = ledger
        .get(change_id)?
        .ok_or(CliError::UnknownChange(change_id))?;

    let mut batch = WriteBatch::new();
    ledger.stage_remove(&mut batch, change_id);
    if let ChangeState::Deferred { conflict_id } = change.state {
        if has_collection(store, SYNC_CONFLICTS) {
            batch.delete(SYNC_CONFLICTS, conflict_id.to_string());
        }
    }
    if let Some(key) = change.record_id().and_then(RecordKey::from_value) {
        if has_collection(store, &change.endpoint) {
            if let Some(mut record) = store.get(&change.endpoint, &key)? {
                let remaining: Vec<_> = ledger
                    .references(&change.endpoint, &key)?
                    .into_iter()
                    .filter(|c| c.id != change_id)
                    .collect();
                status_of(&remaining).apply(&mut record);
                batch.put_verbatim(change.endpoint.as_str(), Value::Object(record));
            }
        }
    }
    store.write(batch)?;

    tracing::info!(%change_id, "change discarded");
    Ok(change)
}

fn status_of(remaining: &[QueuedChange]) -> SyncStatus {
    if remaining.is_empty() {
        SyncStatus::Synced
    } else if remaining.iter().all(QueuedChange::is_exhausted) {
        SyncStatus::Failed
    } else {
        SyncStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixture::Fixture;
    use offsync_engine::ChangeLedger;
    use offsync_protocol::{ChangeRequest, ConflictId};
    use offsync_storage::{CollectionSchema, StoreSchema};
    use serde_json::json;

    #[test]
    fn last_change_marks_record_synced() {
        let fixture = Fixture::new();
        let store = fixture.store();

        discard(&store, fixture.exhausted.id).unwrap();

        let ledger = ChangeLedger::open(Arc::clone(&store)).unwrap();
        assert_eq!(ledger.get(fixture.exhausted.id).unwrap(), None);
        assert_eq!(ledger.count().unwrap(), 1);

        let record = store.get("tasks", 1).unwrap().unwrap();
        assert_eq!(SyncStatus::of(&record), Some(SyncStatus::Synced));
    }

    #[test]
    fn other_changes_keep_record_pending() {
        let fixture = Fixture::new();
        let store = fixture.store();
        let ledger = ChangeLedger::open(Arc::clone(&store)).unwrap();
        let follow_up = QueuedChange::new(
            ChangeRequest::update("tasks", json!({"id": 1, "done": true})),
            3_000,
        );
        ledger.enqueue(&follow_up).unwrap();

        discard(&store, fixture.exhausted.id).unwrap();

        let record = store.get("tasks", 1).unwrap().unwrap();
        assert_eq!(SyncStatus::of(&record), Some(SyncStatus::Pending));
    }

    #[test]
    fn deferred_change_takes_its_conflict() {
        let fixture = Fixture::new();
        let store = fixture.store();
        store
            .provision(&StoreSchema::new().collection(CollectionSchema::new(SYNC_CONFLICTS)))
            .unwrap();
        let ledger = ChangeLedger::open(Arc::clone(&store)).unwrap();

        let conflict_id = ConflictId::new();
        let mut held = fixture.updated.clone();
        held.state = ChangeState::Deferred { conflict_id };
        ledger.enqueue(&held).unwrap();
        store
            .put(SYNC_CONFLICTS, json!({"id": conflict_id.to_string()}))
            .unwrap();

        let change = discard(&store, held.id).unwrap();
        assert!(change.is_deferred());
        assert_eq!(store.count(SYNC_CONFLICTS).unwrap(), 0);

        let record = store.get("tasks", 2).unwrap().unwrap();
        assert_eq!(SyncStatus::of(&record), Some(SyncStatus::Synced));
    }

    #[test]
    fn unknown_change() {
        let fixture = Fixture::new();
        assert!(discard(&fixture.store(), ChangeId::new()).is_err());
    }
}
