//! The pending change ledger.

use crate::error::SyncResult;
use offsync_protocol::{ChangeId, ChangeState, QueuedChange};
use offsync_storage::{
    CollectionSchema, LocalStore, Query, RecordKey, SortDirection, StoreSchema, WriteBatch,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Collection holding queued changes.
pub const PENDING_CHANGES: &str = "pendingChanges";

/// Durable queue of client mutations awaiting confirmation.
///
/// Every method is atomic and durable on return. Mutations that must land
/// together with record updates are staged into a [`WriteBatch`] with the
/// `stage_*` methods and committed by the caller.
#[derive(Debug, Clone)]
pub struct ChangeLedger {
    store: Arc<LocalStore>,
}

impl ChangeLedger {
    /// Opens the ledger, provisioning its collection.
    pub fn open(store: Arc<LocalStore>) -> SyncResult<Self> {
        store.provision(&Self::schema())?;
        Ok(Self { store })
    }

    /// The ledger collection's declaration.
    pub fn schema() -> StoreSchema {
        StoreSchema::new().collection(
            CollectionSchema::new(PENDING_CHANGES)
                .index("endpoint", "endpoint")
                .index("enqueuedAt", "enqueuedAt"),
        )
    }

    /// Adds a change. Returns once it is durable.
    pub fn enqueue(&self, change: &QueuedChange) -> SyncResult<ChangeId> {
        let mut batch = WriteBatch::new();
        self.stage_put(&mut batch, change)?;
        self.store.write(batch)?;
        tracing::debug!(
            change_id = %change.id,
            endpoint = %change.endpoint,
            method = %change.method,
            "change queued"
        );
        Ok(change.id)
    }

    /// Stages an insert or replacement of a change.
    pub fn stage_put(&self, batch: &mut WriteBatch, change: &QueuedChange) -> SyncResult<()> {
        batch.put_verbatim(PENDING_CHANGES, serde_json::to_value(change)?);
        Ok(())
    }

    /// Stages the removal of a change.
    pub fn stage_remove(&self, batch: &mut WriteBatch, id: ChangeId) {
        batch.delete(PENDING_CHANGES, id.to_string());
    }

    /// Fetches one change.
    pub fn get(&self, id: ChangeId) -> SyncResult<Option<QueuedChange>> {
        match self.store.get(PENDING_CHANGES, id.to_string())? {
            Some(document) => Ok(Some(decode(document)?)),
            None => Ok(None),
        }
    }

    /// All changes, ordered by `enqueuedAt` then id.
    pub fn list_all(&self) -> SyncResult<Vec<QueuedChange>> {
        let query = Query::new().sort_by("enqueuedAt", SortDirection::Ascending);
        self.collect(&query)
    }

    /// Changes of one endpoint, in queue order.
    pub fn list_endpoint(&self, endpoint: &str) -> SyncResult<Vec<QueuedChange>> {
        let query = Query::new()
            .by_index("endpoint", json!(endpoint))
            .sort_by("enqueuedAt", SortDirection::Ascending);
        self.collect(&query)
    }

    /// Removes a change. Returns whether it was present.
    pub fn remove(&self, id: ChangeId) -> SyncResult<bool> {
        Ok(self.store.delete(PENDING_CHANGES, id.to_string())?)
    }

    /// Applies `update` to a stored change and writes it back.
    ///
    /// Returns the updated change, or `None` if no change has this id.
    pub fn reschedule<F>(&self, id: ChangeId, update: F) -> SyncResult<Option<QueuedChange>>
    where
        F: FnOnce(&mut QueuedChange),
    {
        let Some(mut change) = self.get(id)? else {
            return Ok(None);
        };
        update(&mut change);
        change.id = id;

        let mut batch = WriteBatch::new();
        self.stage_put(&mut batch, &change)?;
        self.store.write(batch)?;
        Ok(Some(change))
    }

    /// Number of queued changes.
    pub fn count(&self) -> SyncResult<usize> {
        Ok(self.store.count(PENDING_CHANGES)?)
    }

    /// Number of changes per state name (`pending`, `deferred`, `exhausted`).
    pub fn count_by_state(&self) -> SyncResult<BTreeMap<&'static str, usize>> {
        let mut counts = BTreeMap::new();
        for change in self.list_all()? {
            *counts.entry(change.state.name()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Changes of `endpoint` that target the record `key`.
    pub fn references(&self, endpoint: &str, key: &RecordKey) -> SyncResult<Vec<QueuedChange>> {
        Ok(self
            .list_endpoint(endpoint)?
            .into_iter()
            .filter(|c| {
                c.record_id()
                    .and_then(RecordKey::from_value)
                    .is_some_and(|k| &k == key)
            })
            .collect())
    }

    /// Changes held by the given state.
    pub fn list_in_state(&self, state: ChangeState) -> SyncResult<Vec<QueuedChange>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|c| c.state == state)
            .collect())
    }

    fn collect(&self, query: &Query) -> SyncResult<Vec<QueuedChange>> {
        let mut changes = self
            .store
            .get_all(PENDING_CHANGES, query)?
            .into_iter()
            .map(decode)
            .collect::<SyncResult<Vec<_>>>()?;
        changes.sort_by(QueuedChange::queue_order);
        Ok(changes)
    }
}

fn decode(document: offsync_storage::Document) -> SyncResult<QueuedChange> {
    Ok(serde_json::from_value(serde_json::Value::Object(document))?)
}
