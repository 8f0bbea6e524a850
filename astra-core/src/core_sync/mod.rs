/*
    core_sync - Version-vector delta exchange between replicas
*/

pub mod engine;

pub use engine::{SyncReport, SyncSession, SyncState, SyncStore};

use crate::core_router::TransportError;
use crate::core_store::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Unexpected frame: expected {expected}, got {actual}")]
    UnexpectedFrame { expected: &'static str, actual: &'static str },

    #[error("Sync session timed out")]
    Timeout,
}
