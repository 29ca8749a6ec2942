//! Conflict detection results and resolution policy.

use crate::change::{QueuedChange, VERSION_FIELD};
use crate::id::ConflictId;
use crate::messages::ConflictReport;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A client change the server refused, paired with the server's copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Durable id, used by manual resolution.
    pub id: ConflictId,
    /// The change that provoked the conflict.
    pub client_change: QueuedChange,
    /// The server's current record. `null` if the server deleted it.
    pub server_version: Value,
    /// Detection time in milliseconds since the Unix epoch.
    pub detected_at: i64,
}

impl Conflict {
    /// Creates a conflict from a server report.
    pub fn from_report(report: ConflictReport, detected_at: i64) -> Self {
        Self {
            id: ConflictId::new(),
            client_change: report.client_change,
            server_version: report.server_version,
            detected_at,
        }
    }

    /// Endpoint of the conflicting change.
    pub fn endpoint(&self) -> &str {
        &self.client_change.endpoint
    }

    /// The server's version number, if its copy carries one.
    pub fn server_version_number(&self) -> Option<u64> {
        self.server_version.get(VERSION_FIELD)?.as_u64()
    }

    /// Returns true if the server no longer has the record.
    pub fn is_server_deleted(&self) -> bool {
        self.server_version.is_null()
    }
}

/// How conflicts are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    /// The server's copy replaces the local one; the client change is dropped.
    #[default]
    ServerWins,
    /// The client change is resent against the server's current version.
    ClientWins,
    /// The conflict is stored until someone picks a side.
    Manual,
}

impl ConflictPolicy {
    /// Returns true if this policy settles conflicts without a caller.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    /// Decides the action for a conflict.
    pub fn resolve(&self, conflict: &Conflict) -> Action {
        resolve(conflict, *self)
    }
}

/// The outcome of resolving a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// Overwrite the local record with the server's copy and drop the change.
    AcceptServer,
    /// Keep the change and send it again with the server's version as base.
    ResendClient,
    /// Hold the change until resolved by hand.
    Defer,
}

/// Decides what to do about a conflict under a policy. Pure.
pub fn resolve(_conflict: &Conflict, policy: ConflictPolicy) -> Action {
    match policy {
        ConflictPolicy::ServerWins => Action::AcceptServer,
        ConflictPolicy::ClientWins => Action::ResendClient,
        ConflictPolicy::Manual => Action::Defer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeRequest;
    use serde_json::json;

    fn conflict() -> Conflict {
        let change = QueuedChange::new(
            ChangeRequest::update("tasks", json!({"id": 42, "title": "client"})),
            10,
        )
        .with_base_version(Some(1));
        Conflict::from_report(
            ConflictReport {
                client_change: change,
                server_version: json!({"id": 42, "title": "server", "version": 2}),
            },
            20,
        )
    }

    #[test]
    fn policy_actions() {
        let c = conflict();
        assert_eq!(resolve(&c, ConflictPolicy::ServerWins), Action::AcceptServer);
        assert_eq!(resolve(&c, ConflictPolicy::ClientWins), Action::ResendClient);
        assert_eq!(ConflictPolicy::Manual.resolve(&c), Action::Defer);

        assert!(ConflictPolicy::ServerWins.auto_resolves());
        assert!(!ConflictPolicy::Manual.auto_resolves());
    }

    #[test]
    fn conflict_accessors() {
        let c = conflict();
        assert_eq!(c.endpoint(), "tasks");
        assert_eq!(c.server_version_number(), Some(2));
        assert!(!c.is_server_deleted());
        assert_eq!(c.detected_at, 20);
    }

    #[test]
    fn conflict_persists_as_json() {
        let c = conflict();
        let value = serde_json::to_value(&c).unwrap();
        assert_eq!(value["id"], c.id.to_string());
        assert_eq!(value["detectedAt"], 20);
        let back: Conflict = serde_json::from_value(value).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn policy_names() {
        assert_eq!(
            serde_json::to_value(ConflictPolicy::ClientWins).unwrap(),
            json!("clientWins")
        );
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::ServerWins);
    }
}
