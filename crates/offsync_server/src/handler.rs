//! Batch handling.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::records::{version_of, RecordTable};
use offsync_protocol::{Method, QueuedChange, SyncBatchRequest, SyncBatchResponse, VERSION_FIELD};
use offsync_storage::{Document, RecordKey, WriteBatch, KEY_FIELD};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

enum Outcome {
    Applied(Option<Value>),
    Conflict(Value),
}

/// Applies client batches to the record table.
///
/// A change conflicts when its base version differs from the version the
/// record had when the batch arrived. Changes to the same record within one
/// batch therefore chain: the second edit of a record is not refused because
/// the first edit bumped its version.
pub struct RequestHandler {
    config: ServerConfig,
    records: RecordTable,
    write_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl RequestHandler {
    /// Creates a handler.
    pub fn new(config: ServerConfig, records: RecordTable) -> Self {
        Self {
            config,
            records,
            write_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The record table.
    pub fn records(&self) -> &RecordTable {
        &self.records
    }

    /// The configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Applies a batch. Changes are applied in order; each one either lands
    /// completely or is reported as a conflict.
    pub fn handle_batch(&self, request: SyncBatchRequest) -> ServerResult<SyncBatchResponse> {
        self.validate(&request)?;

        let endpoint = request.endpoint.as_str();
        let _guard = self.write_lock.lock();
        self.records.ensure_endpoint(endpoint)?;

        let mut batch_start: HashMap<RecordKey, Option<u64>> = HashMap::new();
        let mut response = SyncBatchResponse::new();

        for change in &request.changes {
            let key = change.record_id().and_then(RecordKey::from_value);

            if self.records.is_applied(change.id)? {
                tracing::debug!(change_id = %change.id, "change already applied");
                response.synced_ids.push(change.id);
                if let Some(key) = &key {
                    if let Some(record) = self.records.get(endpoint, key)? {
                        response.updates.push(Value::Object(record));
                    }
                }
                continue;
            }

            match self.apply(endpoint, change, key, &mut batch_start)? {
                Outcome::Applied(update) => {
                    response.synced_ids.push(change.id);
                    response.updates.extend(update);
                }
                Outcome::Conflict(server_version) => {
                    tracing::debug!(change_id = %change.id, "stale base version");
                    response = response.with_conflict(change.clone(), server_version);
                }
            }
        }

        tracing::info!(
            %endpoint,
            changes = request.changes.len(),
            accepted = response.synced_ids.len(),
            conflicts = response.conflicts.len(),
            "batch applied"
        );
        Ok(response)
    }

    fn validate(&self, request: &SyncBatchRequest) -> ServerResult<()> {
        if request.endpoint.trim().is_empty() {
            return Err(ServerError::InvalidRequest("endpoint is empty".into()));
        }
        if request.changes.len() > self.config.max_batch_size {
            return Err(ServerError::InvalidRequest(format!(
                "too many changes: {} > {}",
                request.changes.len(),
                self.config.max_batch_size
            )));
        }
        if let Some(stray) = request.changes.iter().find(|c| c.endpoint != request.endpoint) {
            return Err(ServerError::InvalidRequest(format!(
                "change {} belongs to {}, not {}",
                stray.id, stray.endpoint, request.endpoint
            )));
        }
        Ok(())
    }

    fn apply(
        &self,
        endpoint: &str,
        change: &QueuedChange,
        key: Option<RecordKey>,
        batch_start: &mut HashMap<RecordKey, Option<u64>>,
    ) -> ServerResult<Outcome> {
        let current = match &key {
            Some(key) => self.records.get(endpoint, key)?,
            None => None,
        };
        let current_version = version_of(current.as_ref());
        let start_version = match &key {
            Some(key) => *batch_start.entry(key.clone()).or_insert(current_version),
            None => None,
        };

        let server_copy = || current.clone().map_or(Value::Null, Value::Object);

        match (change.method, change.base_version) {
            (Method::Create, None) if current.is_some() => {
                return Ok(Outcome::Conflict(server_copy()));
            }
            (Method::Update | Method::Delete, None)
                if self.config.strict_versions && current.is_some() =>
            {
                return Ok(Outcome::Conflict(server_copy()));
            }
            (_, Some(base)) if start_version != Some(base) => {
                return Ok(Outcome::Conflict(server_copy()));
            }
            _ => {}
        }

        let mut batch = WriteBatch::new();
        self.records.stage_applied(&mut batch, change.id, endpoint);

        let written_key = match change.method {
            Method::Delete => {
                if let Some(key) = &key {
                    batch.delete(endpoint, key);
                }
                None
            }
            Method::Create | Method::Update => {
                let Value::Object(fields) = &change.payload else {
                    return Err(ServerError::InvalidRequest(format!(
                        "change {} has a non-object payload",
                        change.id
                    )));
                };
                let mut record: Document = current.clone().unwrap_or_default();
                for (field, value) in fields {
                    record.insert(field.clone(), value.clone());
                }
                let key = match key {
                    Some(key) => key,
                    None => {
                        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let assigned = format!("{endpoint}-{n}");
                        record.insert(KEY_FIELD.to_string(), json!(assigned));
                        RecordKey::new(assigned)
                    }
                };
                record.insert(
                    VERSION_FIELD.to_string(),
                    json!(current_version.unwrap_or(0) + 1),
                );
                batch.put(endpoint, Value::Object(record));
                Some(key)
            }
        };

        self.records.store().write(batch)?;

        match written_key {
            Some(key) => Ok(Outcome::Applied(
                self.records.get(endpoint, &key)?.map(Value::Object),
            )),
            None => Ok(Outcome::Applied(None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_protocol::ChangeRequest;

    fn handler() -> RequestHandler {
        RequestHandler::new(ServerConfig::default(), RecordTable::new().unwrap())
    }

    fn change(request: ChangeRequest, base: Option<u64>) -> QueuedChange {
        QueuedChange::new(request, 0).with_base_version(base)
    }

    #[test]
    fn create_update_delete() {
        let handler = handler();

        let create = change(ChangeRequest::create("tasks", json!({"id": 1, "title": "a"})), None);
        let response = handler
            .handle_batch(SyncBatchRequest::new("tasks", vec![create.clone()]))
            .unwrap();
        assert_eq!(response.synced_ids, vec![create.id]);
        assert_eq!(response.updates[0]["version"], json!(1));
        assert!(response.updates[0].get("updatedAt").is_some());

        let update = change(ChangeRequest::update("tasks", json!({"id": 1, "done": true})), Some(1));
        let response = handler
            .handle_batch(SyncBatchRequest::new("tasks", vec![update]))
            .unwrap();
        assert_eq!(response.updates[0]["version"], json!(2));
        assert_eq!(response.updates[0]["title"], json!("a"));

        let delete = change(ChangeRequest::delete("tasks", json!({"id": 1})), Some(2));
        let response = handler
            .handle_batch(SyncBatchRequest::new("tasks", vec![delete.clone()]))
            .unwrap();
        assert_eq!(response.synced_ids, vec![delete.id]);
        assert!(response.updates.is_empty());
        assert_eq!(handler.records().count("tasks").unwrap(), 0);
    }

    #[test]
    fn stale_base_version_conflicts() {
        let handler = handler();
        handler
            .records()
            .put("tasks", json!({"id": 42, "title": "theirs"}))
            .unwrap();
        handler
            .records()
            .put("tasks", json!({"id": 42, "title": "theirs again"}))
            .unwrap();

        let stale = change(ChangeRequest::update("tasks", json!({"id": 42, "title": "mine"})), Some(1));
        let response = handler
            .handle_batch(SyncBatchRequest::new("tasks", vec![stale.clone()]))
            .unwrap();

        assert!(response.synced_ids.is_empty());
        assert_eq!(response.conflicts.len(), 1);
        assert_eq!(response.conflicts[0].client_change, stale);
        assert_eq!(response.conflicts[0].server_version["version"], json!(2));
        assert_eq!(response.conflicts[0].server_version["title"], json!("theirs again"));
    }

    #[test]
    fn deleted_record_conflicts_with_null() {
        let handler = handler();
        let stale = change(ChangeRequest::update("tasks", json!({"id": 9, "x": 1})), Some(4));
        let response = handler
            .handle_batch(SyncBatchRequest::new("tasks", vec![stale]))
            .unwrap();
        assert_eq!(response.conflicts[0].server_version, Value::Null);
    }

    #[test]
    fn edits_in_one_batch_chain() {
        let handler = handler();
        handler.records().put("tasks", json!({"id": 1})).unwrap();

        let a = change(ChangeRequest::update("tasks", json!({"id": 1, "a": 1})), Some(1));
        let b = change(ChangeRequest::update("tasks", json!({"id": 1, "b": 2})), Some(1));
        let response = handler
            .handle_batch(SyncBatchRequest::new("tasks", vec![a, b]))
            .unwrap();

        assert_eq!(response.synced_ids.len(), 2);
        assert!(response.conflicts.is_empty());
        let last = response.updates.last().unwrap();
        assert_eq!(last["version"], json!(3));
        assert_eq!(last["a"], json!(1));
        assert_eq!(last["b"], json!(2));
    }

    #[test]
    fn resent_change_is_not_applied_twice() {
        let handler = handler();
        let create = change(ChangeRequest::create("tasks", json!({"id": 1})), None);

        handler
            .handle_batch(SyncBatchRequest::new("tasks", vec![create.clone()]))
            .unwrap();
        let response = handler
            .handle_batch(SyncBatchRequest::new("tasks", vec![create.clone()]))
            .unwrap();

        assert_eq!(response.synced_ids, vec![create.id]);
        assert!(response.conflicts.is_empty());
        assert_eq!(response.updates[0]["version"], json!(1));
    }

    #[test]
    fn create_without_id_gets_one() {
        let handler = handler();
        let create = change(ChangeRequest::create("notes", json!({"body": "hi"})), None);
        let response = handler
            .handle_batch(SyncBatchRequest::new("notes", vec![create]))
            .unwrap();
        assert_eq!(response.updates[0]["id"], json!("notes-1"));
    }

    #[test]
    fn strict_versions() {
        let handler = RequestHandler::new(
            ServerConfig::default().with_strict_versions(true),
            RecordTable::new().unwrap(),
        );
        handler.records().put("tasks", json!({"id": 1})).unwrap();

        let blind = change(ChangeRequest::update("tasks", json!({"id": 1, "x": 1})), None);
        let response = handler
            .handle_batch(SyncBatchRequest::new("tasks", vec![blind]))
            .unwrap();
        assert_eq!(response.conflicts.len(), 1);
    }

    #[test]
    fn invalid_batches() {
        let handler = RequestHandler::new(
            ServerConfig::default().with_max_batch_size(1),
            RecordTable::new().unwrap(),
        );
        let a = change(ChangeRequest::create("tasks", json!({"id": 1})), None);
        let b = change(ChangeRequest::create("tasks", json!({"id": 2})), None);

        let err = handler
            .handle_batch(SyncBatchRequest::new("tasks", vec![a.clone(), b]))
            .unwrap_err();
        assert!(err.is_client_error());

        let err = handler
            .handle_batch(SyncBatchRequest::new("notes", vec![a]))
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }
}
