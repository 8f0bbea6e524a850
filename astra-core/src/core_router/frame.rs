/*
    frame.rs - Wire frames exchanged between replicas

    Every message inside a Noise session is one bincode-encoded `Frame`.
    `Announce` is the only variant that travels outside a session (as
    JSON over UDP, see core_discovery).

    Session shapes:
    - Pairing: Hello, PairRequest / PairChallenge, PairConfirm
    - Sync:    Hello, VectorExchange, Operation*, Ack
*/

use super::TransportError;
use crate::core_discovery::PeerAnnouncement;
use crate::core_store::crdt::VectorClock;
use crate::core_store::model::{Operation, ReplicaId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version carried in `Hello` and discovery announcements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    /// Peers can talk when their major versions agree
    pub fn is_compatible(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// What a session is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPurpose {
    Pair,
    Sync,
}

/// First frame of every session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: ProtocolVersion,
    pub replica_id: ReplicaId,
    pub display_name: String,
    pub purpose: SessionPurpose,
}

impl Hello {
    pub fn new(replica_id: ReplicaId, display_name: impl Into<String>, purpose: SessionPurpose) -> Self {
        Hello {
            protocol_version: ProtocolVersion::CURRENT,
            replica_id,
            display_name: display_name.into(),
            purpose,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Announce(PeerAnnouncement),
    PairRequest { replica_id: ReplicaId, display_name: String },
    PairChallenge { replica_id: ReplicaId, display_name: String },
    PairConfirm { accepted: bool },
    Hello(Hello),
    VectorExchange { vector: VectorClock },
    Operation { operation: Operation, checksum: u32 },
    /// End of push; carries the sender's vector after applying what it received
    Ack { vector: VectorClock },
}

impl Frame {
    /// Operation frame with its checksum filled in
    pub fn operation(operation: Operation) -> Result<Frame, TransportError> {
        let checksum = operation.checksum().map_err(|e| TransportError::Codec(e.to_string()))?;
        Ok(Frame::Operation { operation, checksum })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Announce(_) => "Announce",
            Frame::PairRequest { .. } => "PairRequest",
            Frame::PairChallenge { .. } => "PairChallenge",
            Frame::PairConfirm { .. } => "PairConfirm",
            Frame::Hello(_) => "Hello",
            Frame::VectorExchange { .. } => "VectorExchange",
            Frame::Operation { .. } => "Operation",
            Frame::Ack { .. } => "Ack",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serialize(self).map_err(|e| TransportError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, TransportError> {
        bincode::deserialize(bytes).map_err(|e| TransportError::Codec(e.to_string()))
    }
}
