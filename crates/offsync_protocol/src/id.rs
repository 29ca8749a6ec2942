//! Change and conflict identifiers.
//!
//! Both are UUID v7, so ids generated later sort after ids generated earlier
//! and ties on `enqueuedAt` still have a stable order.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

fn parse_uuid(s: &str) -> ProtocolResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| ProtocolError::InvalidId {
        value: s.to_string(),
        reason: e.to_string(),
    })
}

/// Identifier of a queued change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(Uuid);

impl ChangeId {
    /// Generates a fresh time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ChangeId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        parse_uuid(s).map(Self)
    }
}

/// Identifier of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Generates a fresh time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConflictId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        parse_uuid(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_time_ordered() {
        let first = ChangeId::new();
        let second = ChangeId::new();
        assert!(first < second);
    }

    #[test]
    fn parse_and_display() {
        let id = ChangeId::new();
        let parsed: ChangeId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        assert!(matches!(
            "not-a-uuid".parse::<ConflictId>(),
            Err(ProtocolError::InvalidId { .. })
        ));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ConflictId::new();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }
}
