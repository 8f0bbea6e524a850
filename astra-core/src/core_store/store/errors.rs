/*
    errors.rs - Error types for the store subsystem

    Defines all error types that can occur in:
    - CRDT operations and validation
    - Operation log and checkpoint storage
    - Serialization
*/

use thiserror::Error;

/// Errors that can occur in the store subsystem
#[derive(Debug, Error)]
pub enum StoreError {
    /// Operation would violate the CRDT algebra; state left untouched
    #[error("Validation error: {0}")]
    Validation(String),

    /// Field already holds a different CRDT kind
    #[error("Field kind mismatch on {field}: expected {expected}, got {actual}")]
    KindMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Local persistence is damaged (checksum failure, counter gap)
    #[error("Corrupted data: {0}")]
    Corruption(String),

    /// Storage I/O error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Entity or element not found
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
