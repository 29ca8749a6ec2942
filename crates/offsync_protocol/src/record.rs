//! Locally cached server records.

use crate::error::ProtocolResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field holding a record's [`SyncStatus`].
pub const SYNC_STATUS_FIELD: &str = "syncStatus";

/// Whether a cached record matches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local changes are not yet confirmed.
    Pending,
    /// Matches the last server copy.
    Synced,
    /// A change to it ran out of retries.
    Failed,
}

impl SyncStatus {
    /// Returns the stored name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    /// Returns the status as a JSON value, for index lookups.
    pub fn to_value(&self) -> Value {
        Value::String(self.as_str().to_string())
    }

    /// Reads the status field of a record.
    pub fn of(record: &Map<String, Value>) -> Option<Self> {
        match record.get(SYNC_STATUS_FIELD)?.as_str()? {
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }

    /// Writes the status field of a record.
    pub fn apply(&self, record: &mut Map<String, Value>) {
        record.insert(SYNC_STATUS_FIELD.to_string(), self.to_value());
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The client's cached copy of a server-owned entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
    /// Primary key.
    pub id: Value,
    /// Last write time. Local writes stamp milliseconds since the Unix
    /// epoch; server copies keep whatever the server sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Value>,
    /// Sync state. Absent on records that never passed through the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,
    /// Domain fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LocalRecord {
    /// Builds a record from a stored JSON object.
    pub fn from_document(document: Map<String, Value>) -> ProtocolResult<Self> {
        Ok(serde_json::from_value(Value::Object(document))?)
    }

    /// Converts back into a JSON object.
    pub fn into_document(self) -> ProtocolResult<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    /// Looks up a domain field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns true if the record is waiting on unconfirmed changes.
    pub fn is_pending(&self) -> bool {
        self.sync_status == Some(SyncStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_read_and_write() {
        let mut record = json!({"id": 1}).as_object().cloned().unwrap();
        assert_eq!(SyncStatus::of(&record), None);

        SyncStatus::Failed.apply(&mut record);
        assert_eq!(record["syncStatus"], "failed");
        assert_eq!(SyncStatus::of(&record), Some(SyncStatus::Failed));
    }

    #[test]
    fn local_record_splits_known_fields() {
        let document = json!({
            "id": 7,
            "status": "done",
            "updatedAt": 1_000,
            "syncStatus": "pending"
        })
        .as_object()
        .cloned()
        .unwrap();

        let record = LocalRecord::from_document(document.clone()).unwrap();
        assert_eq!(record.id, json!(7));
        assert_eq!(record.updated_at, Some(json!(1_000)));
        assert!(record.is_pending());
        assert_eq!(record.get("status"), Some(&json!("done")));
        assert!(record.get("syncStatus").is_none());

        assert_eq!(record.into_document().unwrap(), document);
    }
}
