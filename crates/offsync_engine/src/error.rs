//! Error types for the sync engine.

use offsync_protocol::{ChangeId, ConflictId, ProtocolError};
use offsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server answered with an error.
    #[error("server error: {0}")]
    ServerError(String),

    /// A request took longer than the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// The device is offline.
    #[error("not connected to server")]
    NotConnected,

    /// Another sync episode is in flight.
    #[error("a sync is already in progress")]
    AlreadySyncing,

    /// Encoding, decoding or validating a protocol value failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A stored change or conflict could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The local store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// No queued change has this id.
    #[error("unknown change: {0}")]
    UnknownChange(ChangeId),

    /// No pending conflict has this id.
    #[error("unknown conflict: {0}")]
    UnknownConflict(ConflictId),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            SyncError::NotConnected => true,
            _ => false,
        }
    }

    /// Returns true if the local store ran out of quota.
    pub fn is_quota(&self) -> bool {
        matches!(self, SyncError::Storage(e) if e.is_quota())
    }
}
