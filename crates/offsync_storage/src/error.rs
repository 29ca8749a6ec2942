//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The journal is corrupted beyond what recovery can repair.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A record or journal payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The collection was never provisioned.
    #[error("unknown collection: {name}")]
    UnknownCollection {
        /// Name of the collection.
        name: String,
    },

    /// The collection has no index with this name.
    #[error("unknown index {index} on collection {collection}")]
    UnknownIndex {
        /// Name of the collection.
        collection: String,
        /// Name of the index.
        index: String,
    },

    /// A record has no usable primary key.
    #[error("record in collection {collection} has no usable `id` field")]
    MissingKey {
        /// Name of the collection.
        collection: String,
    },

    /// A record was not a JSON object.
    #[error("record in collection {collection} is not a JSON object")]
    NotAnObject {
        /// Name of the collection.
        collection: String,
    },

    /// The write would push usage past the configured quota.
    #[error("storage quota exceeded: usage {usage} + {requested} bytes > quota {quota}")]
    QuotaExceeded {
        /// Bytes in use before the write.
        usage: u64,
        /// Bytes the write needs.
        requested: u64,
        /// Configured quota.
        quota: u64,
    },

    /// Another process holds the store directory lock.
    #[error("store locked: another process has exclusive access")]
    Locked,
}

impl StorageError {
    /// Creates an unknown collection error.
    pub fn unknown_collection(name: impl Into<String>) -> Self {
        Self::UnknownCollection { name: name.into() }
    }

    /// Returns true if the error means the device is out of space.
    pub fn is_quota(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}
