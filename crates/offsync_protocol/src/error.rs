//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or decoding protocol values.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message or record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An identifier was not a valid UUID.
    #[error("invalid identifier {value:?}: {reason}")]
    InvalidId {
        /// The rejected input.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A method name other than create, update or delete.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// A change request is missing something it needs.
    #[error("invalid change: {0}")]
    InvalidChange(String),
}
