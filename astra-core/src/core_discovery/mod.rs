/*
    core_discovery - Finding replicas on the local network

    Periodic JSON announcements over UDP broadcast. Produces a stream of
    `DiscoveryEvent`s for the replica coordinator.
*/

pub mod announcement;
pub mod service;

pub use announcement::PeerAnnouncement;
pub use service::{DiscoveryConfig, DiscoveryEvent, DiscoveryService, KnownPeers};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
