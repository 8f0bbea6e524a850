use super::DiscoveryError;
use crate::core_router::frame::ProtocolVersion;
use crate::core_store::model::ReplicaId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Datagram a replica broadcasts to advertise itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub replica_id: ReplicaId,
    pub display_name: String,
    /// Address of the sync listener (may be unspecified, e.g. `0.0.0.0:47801`)
    pub address: String,
    pub protocol_version: ProtocolVersion,
}

impl PeerAnnouncement {
    pub fn new(replica_id: ReplicaId, display_name: impl Into<String>, address: SocketAddr) -> Self {
        PeerAnnouncement {
            replica_id,
            display_name: display_name.into(),
            address: address.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, DiscoveryError> {
        serde_json::to_vec(self).map_err(|e| DiscoveryError::Serialization(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, DiscoveryError> {
        serde_json::from_slice(bytes).map_err(|e| DiscoveryError::Serialization(e.to_string()))
    }

    /// Listener address as seen from `source`, the datagram's sender.
    ///
    /// An unspecified host is replaced with the sender's IP.
    pub fn resolve_address(&self, source: SocketAddr) -> Option<SocketAddr> {
        let mut address: SocketAddr = self.address.parse().ok()?;
        if address.ip().is_unspecified() {
            address.set_ip(source.ip());
        }
        Some(address)
    }
}
