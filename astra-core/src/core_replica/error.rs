//! Replica error taxonomy
//!
//! Every subsystem error folds into `ReplicaError`. Network failures that
//! a later attempt may not hit are `TransientNetwork`; they only ever
//! surface as peer reachability.

use crate::config::ConfigError;
use crate::core_discovery::DiscoveryError;
use crate::core_identity::IdentityError;
use crate::core_pairing::PairingError;
use crate::core_router::{ProtocolVersion, TransportError};
use crate::core_store::model::ReplicaId;
use crate::core_store::store::StoreError;
use crate::core_sync::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Pairing rejected: {0}")]
    PairingRejected(String),

    #[error("Trust violation: {0}")]
    TrustViolation(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: ProtocolVersion, remote: ProtocolVersion },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Pairing error: {0}")]
    Pairing(PairingError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(ReplicaId),

    #[error("Sync with {0} already in progress")]
    AlreadySyncing(ReplicaId),

    #[error("Feature not registered: {0}")]
    FeatureNotFound(String),

    #[error("Feature disabled: {0}")]
    FeatureDisabled(String),
}

impl ReplicaError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplicaError::TransientNetwork(_))
    }
}

impl From<StoreError> for ReplicaError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corruption(msg) => ReplicaError::Corruption(msg),
            other => ReplicaError::Store(other),
        }
    }
}

impl From<TransportError> for ReplicaError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::TrustViolation { .. } => ReplicaError::TrustViolation(e.to_string()),
            TransportError::VersionMismatch { local, remote } => {
                ReplicaError::VersionMismatch { local, remote }
            }
            e if e.is_transient() => ReplicaError::TransientNetwork(e.to_string()),
            e => ReplicaError::Protocol(e.to_string()),
        }
    }
}

impl From<SyncError> for ReplicaError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Transport(e) => e.into(),
            SyncError::Store(e) => e.into(),
            SyncError::Integrity(msg) => ReplicaError::TrustViolation(msg),
            SyncError::Timeout => ReplicaError::TransientNetwork(e.to_string()),
            SyncError::UnexpectedFrame { .. } => ReplicaError::Protocol(e.to_string()),
        }
    }
}

impl From<PairingError> for ReplicaError {
    fn from(e: PairingError) -> Self {
        match e {
            PairingError::Transport(e) => e.into(),
            PairingError::Rejected(_) | PairingError::Timeout | PairingError::RekeyNotAllowed(_) => {
                ReplicaError::PairingRejected(e.to_string())
            }
            e => ReplicaError::Pairing(e),
        }
    }
}
