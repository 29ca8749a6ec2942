//! Batched sync wire messages.
//!
//! One request per endpoint group; JSON with camelCase keys:
//!
//! ```text
//! request  = { endpoint, changes: QueuedChange[] }
//! response = { syncedIds, updates, conflicts: [{ clientChange, serverVersion }] }
//! ```

use crate::change::QueuedChange;
use crate::error::ProtocolResult;
use crate::id::ChangeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Changes for one endpoint, in `enqueuedAt` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBatchRequest {
    /// The endpoint every change belongs to.
    pub endpoint: String,
    /// The changes.
    pub changes: Vec<QueuedChange>,
}

impl SyncBatchRequest {
    /// Creates a request.
    pub fn new(endpoint: impl Into<String>, changes: Vec<QueuedChange>) -> Self {
        Self {
            endpoint: endpoint.into(),
            changes,
        }
    }

    /// Encodes to JSON bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A change the server refused because its base version is stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    /// The change as the client sent it.
    pub client_change: QueuedChange,
    /// The server's current copy of the record. `null` if it was deleted.
    pub server_version: Value,
}

/// The server's answer to one batch.
///
/// A single response may accept some changes and report conflicts for
/// others. Changes mentioned in neither list were not applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBatchResponse {
    /// Changes the server durably accepted.
    #[serde(default)]
    pub synced_ids: Vec<ChangeId>,
    /// Authoritative copies of records touched by accepted changes.
    #[serde(default)]
    pub updates: Vec<Value>,
    /// Changes refused with a stale base version.
    #[serde(default)]
    pub conflicts: Vec<ConflictReport>,
}

impl SyncBatchResponse {
    /// Creates an empty response.
    pub fn new() -> Self {
        Self::default()
    }

    /// A response accepting `ids` with the given authoritative updates.
    pub fn accepted(ids: Vec<ChangeId>, updates: Vec<Value>) -> Self {
        Self {
            synced_ids: ids,
            updates,
            conflicts: Vec::new(),
        }
    }

    /// Adds a conflict.
    #[must_use]
    pub fn with_conflict(mut self, client_change: QueuedChange, server_version: Value) -> Self {
        self.conflicts.push(ConflictReport {
            client_change,
            server_version,
        });
        self
    }

    /// Returns true if the response accepts nothing and reports nothing.
    pub fn is_empty(&self) -> bool {
        self.synced_ids.is_empty() && self.updates.is_empty() && self.conflicts.is_empty()
    }

    /// Encodes to JSON bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeRequest;
    use serde_json::json;

    #[test]
    fn response_uses_wire_names() {
        let change = QueuedChange::new(ChangeRequest::update("tasks", json!({"id": 42})), 1);
        let response = SyncBatchResponse::accepted(vec![change.id], vec![json!({"id": 7})])
            .with_conflict(change.clone(), json!({"id": 42, "version": 5}));

        let value: Value = serde_json::from_slice(&response.encode().unwrap()).unwrap();
        assert_eq!(value["syncedIds"][0], change.id.to_string());
        assert_eq!(value["updates"][0]["id"], 7);
        assert_eq!(value["conflicts"][0]["serverVersion"]["version"], 5);
        assert_eq!(value["conflicts"][0]["clientChange"]["endpoint"], "tasks");
    }

    #[test]
    fn response_fields_are_optional() {
        let response = SyncBatchResponse::decode(br#"{"syncedIds": []}"#).unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn request_decode_rejects_garbage() {
        assert!(SyncBatchRequest::decode(b"not json").is_err());
    }
}
