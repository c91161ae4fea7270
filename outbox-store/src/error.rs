//! Error types for the outbox-store crate.

use std::io;

use outbox_common::{InvalidTransition, QueueRecordId, QueueStatus};
use thiserror::Error;

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O operation failed (file read/write/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Record not found in the store.
    #[error("Record not found: {0}")]
    NotFound(QueueRecordId),

    /// Record already exists in the store.
    #[error("Record already exists: {0}")]
    AlreadyExists(QueueRecordId),

    /// The record was not in the status the caller expected.
    #[error("Record {id} is {actual}, expected {expected}")]
    Conflict {
        id: QueueRecordId,
        expected: QueueStatus,
        actual: QueueStatus,
    },

    /// The requested status change is not allowed.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Store configuration or location is invalid.
    #[error("Store validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Internal error (capacity, lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serialization and deserialization errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Store location validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Store path cannot contain '..' components: {0}")]
    ParentDir(String),

    #[error("Store path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("Store path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: String, path: String },

    #[error("Store path is not a directory: {0}")]
    NotDirectory(String),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<bincode::error::EncodeError> for StoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialization(e.into())
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Serialization(e.into())
    }
}
