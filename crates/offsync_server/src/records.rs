//! Server-side record table.

use crate::error::ServerResult;
use offsync_protocol::{ChangeId, VERSION_FIELD};
use offsync_storage::{
    CollectionSchema, Document, LocalStore, RecordKey, StorageError, StoreSchema, WriteBatch,
    KEY_FIELD,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// Collection remembering which client changes were applied.
pub const APPLIED_CHANGES: &str = "appliedChanges";

/// The server's authoritative records, one collection per endpoint.
///
/// The table maintains:
/// - The current copy of every record, with a `version` bumped on each write
/// - The id of every applied client change, so a resent change is not applied
///   twice
///
/// It is stored in the same [`LocalStore`] clients use.
#[derive(Debug, Clone)]
pub struct RecordTable {
    store: Arc<LocalStore>,
}

impl RecordTable {
    /// Creates an empty in-memory table.
    pub fn new() -> ServerResult<Self> {
        Self::with_store(Arc::new(LocalStore::in_memory()))
    }

    /// Creates a table over an existing store.
    pub fn with_store(store: Arc<LocalStore>) -> ServerResult<Self> {
        store.provision(&StoreSchema::new().collection(CollectionSchema::new(APPLIED_CHANGES)))?;
        Ok(Self { store })
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Provisions the collection of an endpoint.
    pub fn ensure_endpoint(&self, endpoint: &str) -> ServerResult<()> {
        self.store
            .provision(&StoreSchema::new().collection(CollectionSchema::new(endpoint)))?;
        Ok(())
    }

    fn has_endpoint(&self, endpoint: &str) -> bool {
        self.store.collections().iter().any(|c| c == endpoint)
    }

    /// Fetches the current copy of a record.
    pub fn get(&self, endpoint: &str, key: &RecordKey) -> ServerResult<Option<Document>> {
        if !self.has_endpoint(endpoint) {
            return Ok(None);
        }
        Ok(self.store.get(endpoint, key)?)
    }

    /// Number of records of an endpoint.
    pub fn count(&self, endpoint: &str) -> ServerResult<usize> {
        if !self.has_endpoint(endpoint) {
            return Ok(0);
        }
        Ok(self.store.count(endpoint)?)
    }

    /// Returns true if the change was already applied.
    pub fn is_applied(&self, id: ChangeId) -> ServerResult<bool> {
        Ok(self.store.get(APPLIED_CHANGES, id.to_string())?.is_some())
    }

    /// Stages the marker recording that a change was applied.
    pub fn stage_applied(&self, batch: &mut WriteBatch, id: ChangeId, endpoint: &str) {
        batch.put(APPLIED_CHANGES, json!({"id": id.to_string(), "endpoint": endpoint}));
    }

    /// Writes a record outside any client batch, bumping its version.
    ///
    /// Stands in for an edit made by another client.
    pub fn put(&self, endpoint: &str, record: Value) -> ServerResult<Document> {
        self.ensure_endpoint(endpoint)?;
        let Value::Object(mut record) = record else {
            return Err(StorageError::NotAnObject {
                collection: endpoint.to_string(),
            }
            .into());
        };
        let current = match record.get(KEY_FIELD).and_then(RecordKey::from_value) {
            Some(key) => self.get(endpoint, &key)?,
            None => None,
        };
        record.insert(
            VERSION_FIELD.to_string(),
            json!(version_of(current.as_ref()).unwrap_or(0) + 1),
        );
        Ok(self.store.put(endpoint, Value::Object(record))?)
    }

    /// Deletes a record outside any client batch.
    pub fn delete(&self, endpoint: &str, key: &RecordKey) -> ServerResult<bool> {
        if !self.has_endpoint(endpoint) {
            return Ok(false);
        }
        Ok(self.store.delete(endpoint, key)?)
    }
}

/// Version carried by a record, if any.
pub fn version_of(record: Option<&Document>) -> Option<u64> {
    record?.get(VERSION_FIELD)?.as_u64()
}
