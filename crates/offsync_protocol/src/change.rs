//! Queued client mutations.

use crate::error::{ProtocolError, ProtocolResult};
use crate::id::{ChangeId, ConflictId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Field of a payload naming the record a change targets.
pub const RECORD_ID_FIELD: &str = "id";

/// Field of a record carrying its server version.
pub const VERSION_FIELD: &str = "version";

/// The mutation verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Create a new record.
    Create,
    /// Update an existing record.
    Update,
    /// Delete a record.
    Delete,
}

impl Method {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Create => "create",
            Method::Update => "update",
            Method::Delete => "delete",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" | "post" => Ok(Method::Create),
            "update" | "put" | "patch" => Ok(Method::Update),
            "delete" => Ok(Method::Delete),
            _ => Err(ProtocolError::UnknownMethod(s.to_string())),
        }
    }
}

/// Where a change is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChangeState {
    /// Waiting to be sent.
    #[default]
    Pending,
    /// Held back by an unresolved manual conflict.
    Deferred {
        /// The conflict holding the change.
        #[serde(rename = "conflictId")]
        conflict_id: ConflictId,
    },
    /// Retries are used up. Kept, but never sent again automatically.
    Exhausted,
}

impl ChangeState {
    /// Short name, for logs and counts.
    pub fn name(&self) -> &'static str {
        match self {
            ChangeState::Pending => "pending",
            ChangeState::Deferred { .. } => "deferred",
            ChangeState::Exhausted => "exhausted",
        }
    }
}

/// What a caller asks to have queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    /// Resource group; also the local collection name.
    pub endpoint: String,
    /// Mutation verb.
    pub method: Method,
    /// Mutation body.
    pub data: Value,
}

impl ChangeRequest {
    /// Creates a request.
    pub fn new(endpoint: impl Into<String>, method: Method, data: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            data,
        }
    }

    /// A `create` request.
    pub fn create(endpoint: impl Into<String>, data: Value) -> Self {
        Self::new(endpoint, Method::Create, data)
    }

    /// An `update` request.
    pub fn update(endpoint: impl Into<String>, data: Value) -> Self {
        Self::new(endpoint, Method::Update, data)
    }

    /// A `delete` request.
    pub fn delete(endpoint: impl Into<String>, data: Value) -> Self {
        Self::new(endpoint, Method::Delete, data)
    }

    /// Checks the request can be queued.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidChange`] for an empty endpoint, or for
    /// an update or delete whose data has no `id`.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(ProtocolError::InvalidChange("endpoint is empty".into()));
        }
        if self.method != Method::Create && self.data.get(RECORD_ID_FIELD).is_none() {
            return Err(ProtocolError::InvalidChange(format!(
                "{} on {} needs an `id` in its data",
                self.method, self.endpoint
            )));
        }
        Ok(())
    }
}

/// A durable record of one client mutation awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedChange {
    /// Unique id, assigned at enqueue time.
    pub id: ChangeId,
    /// Resource group the change is batched under.
    pub endpoint: String,
    /// Mutation verb.
    pub method: Method,
    /// Mutation body.
    pub payload: Value,
    /// Enqueue time in milliseconds since the Unix epoch.
    pub enqueued_at: i64,
    /// Times the change has been sent again, failed sends and conflict
    /// resends alike.
    #[serde(default)]
    pub retry_count: u32,
    /// Part of `retry_count` owed to conflict resends.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub resend_count: u32,
    /// Earliest time the change may be sent again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<i64>,
    /// Lifecycle state.
    #[serde(default)]
    pub state: ChangeState,
    /// Version of the record the client edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
}

impl QueuedChange {
    /// Creates a pending change from a request.
    pub fn new(request: ChangeRequest, enqueued_at: i64) -> Self {
        Self {
            id: ChangeId::new(),
            endpoint: request.endpoint,
            method: request.method,
            payload: request.data,
            enqueued_at,
            retry_count: 0,
            resend_count: 0,
            next_attempt_at: None,
            state: ChangeState::Pending,
            base_version: None,
        }
    }

    /// Sets the base version.
    #[must_use]
    pub fn with_base_version(mut self, version: Option<u64>) -> Self {
        self.base_version = version;
        self
    }

    /// The `id` of the record this change targets, if the payload names one.
    pub fn record_id(&self) -> Option<&Value> {
        self.payload.get(RECORD_ID_FIELD)
    }

    /// Failed sends so far. Conflict resends do not count.
    pub fn failed_attempts(&self) -> u32 {
        self.retry_count.saturating_sub(self.resend_count)
    }

    /// Records a resend after the server reported a conflict.
    pub fn mark_resent(&mut self) {
        self.retry_count += 1;
        self.resend_count += 1;
    }

    /// Gives the change its retry budget back.
    pub fn reset_retries(&mut self) {
        self.retry_count = 0;
        self.resend_count = 0;
    }

    /// Returns true if the change may be sent at `now`.
    pub fn is_eligible(&self, now: i64) -> bool {
        self.state == ChangeState::Pending && self.next_attempt_at.map_or(true, |t| t <= now)
    }

    /// Returns true if the change is waiting on a backoff deadline.
    pub fn is_backing_off(&self, now: i64) -> bool {
        self.state == ChangeState::Pending && self.next_attempt_at.is_some_and(|t| t > now)
    }

    /// Returns true if a manual conflict holds the change.
    pub fn is_deferred(&self) -> bool {
        matches!(self.state, ChangeState::Deferred { .. })
    }

    /// Returns true if retries are exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.state == ChangeState::Exhausted
    }

    /// Orders changes by enqueue time, then by id.
    pub fn queue_order(a: &QueuedChange, b: &QueuedChange) -> std::cmp::Ordering {
        a.enqueued_at
            .cmp(&b.enqueued_at)
            .then_with(|| a.id.cmp(&b.id))
    }
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}
