/*
    core_pairing - Establishing trust between replicas

    - state: per-candidate state machine
    - code: six-digit short codes from the Noise handshake hash
    - manager: candidates, confirmations, expiry, events
    - protocol: requester/responder message exchange
*/

pub mod code;
pub mod manager;
pub mod protocol;
pub mod state;

pub use code::ShortCode;
pub use manager::{CandidateInfo, PairingEvent, PairingManager};
pub use protocol::{run_requester, run_responder, LocalPeer, PairingOutcome};
pub use state::PairingState;

use crate::core_router::TransportError;
use crate::core_store::model::ReplicaId;

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("Invalid pairing transition from {from} to {to}")]
    InvalidTransition { from: PairingState, to: PairingState },

    #[error("Unknown pairing candidate: {0}")]
    UnknownCandidate(ReplicaId),

    #[error("No confirmation pending for {0}")]
    NoPendingConfirmation(ReplicaId),

    #[error("Pairing rejected: {0}")]
    Rejected(String),

    #[error("Pairing confirmation timed out")]
    Timeout,

    #[error("Replica {0} is paired under another key; re-keying not allowed")]
    RekeyNotAllowed(ReplicaId),

    #[error("Peer introduced itself as {expected} but claimed {actual}")]
    IdentityMismatch { expected: ReplicaId, actual: ReplicaId },

    #[error("Unexpected frame: expected {expected}, got {actual}")]
    UnexpectedFrame { expected: &'static str, actual: &'static str },

    #[error("Pairing state lock poisoned")]
    Poisoned,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
