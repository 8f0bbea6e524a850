/*
  DiscoveryService - UDP announcements on the local network

  Workflow:
  1. Bind the discovery port and enable broadcast.
  2. Every `advertisement_interval`, send our `PeerAnnouncement` as JSON
     to the broadcast address.
  3. For every datagram received:
     - drop our own announcements and unparseable datagrams
     - drop announcements with an incompatible protocol major version
     - unknown replica -> `PairingCandidate`
     - known replica   -> `PeerSeen` (coordinator updates address, reachability)

  Staleness is tracked by the peer table; discovery only reports sightings.
*/

use super::announcement::PeerAnnouncement;
use super::DiscoveryError;
use crate::core_store::model::ReplicaId;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

const MAX_DATAGRAM_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Announcement from a replica we have not paired with
    PairingCandidate { replica_id: ReplicaId, display_name: String, address: SocketAddr },

    /// Announcement from a paired replica
    PeerSeen { replica_id: ReplicaId, address: SocketAddr },
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub bind_address: SocketAddr,
    pub broadcast_address: SocketAddr,
    pub advertisement_interval: Duration,
}

/// Replica identities the coordinator has paired with
#[derive(Debug, Clone, Default)]
pub struct KnownPeers {
    inner: Arc<RwLock<HashSet<ReplicaId>>>,
}

impl KnownPeers {
    pub fn insert(&self, replica_id: ReplicaId) {
        if let Ok(mut known) = self.inner.write() {
            known.insert(replica_id);
        }
    }

    pub fn remove(&self, replica_id: &ReplicaId) {
        if let Ok(mut known) = self.inner.write() {
            known.remove(replica_id);
        }
    }

    pub fn contains(&self, replica_id: &ReplicaId) -> bool {
        self.inner.read().map(|known| known.contains(replica_id)).unwrap_or(false)
    }
}

pub struct DiscoveryService {
    announcement: PeerAnnouncement,
    config: DiscoveryConfig,
    known: KnownPeers,
}

impl DiscoveryService {
    pub fn new(announcement: PeerAnnouncement, config: DiscoveryConfig, known: KnownPeers) -> Self {
        DiscoveryService { announcement, config, known }
    }

    /// Classify one received datagram
    pub fn handle_datagram(&self, bytes: &[u8], source: SocketAddr) -> Option<DiscoveryEvent> {
        let announcement = match PeerAnnouncement::from_json(bytes) {
            Ok(announcement) => announcement,
            Err(e) => {
                debug!(source = %source, error = %e, "ignoring malformed announcement");
                return None;
            }
        };
        if announcement.replica_id == self.announcement.replica_id {
            return None;
        }
        if !self.announcement.protocol_version.is_compatible(&announcement.protocol_version) {
            warn!(
                replica_id = %announcement.replica_id,
                version = %announcement.protocol_version,
                "ignoring announcement with incompatible protocol version"
            );
            return None;
        }
        let address = announcement.resolve_address(source)?;

        if self.known.contains(&announcement.replica_id) {
            trace!(replica_id = %announcement.replica_id, address = %address, "peer seen");
            Some(DiscoveryEvent::PeerSeen { replica_id: announcement.replica_id, address })
        } else {
            debug!(replica_id = %announcement.replica_id, address = %address, "pairing candidate");
            Some(DiscoveryEvent::PairingCandidate {
                replica_id: announcement.replica_id,
                display_name: announcement.display_name,
                address,
            })
        }
    }

    /// Bind the socket and spawn the announce/listen loop.
    ///
    /// Returns the event stream and the bound address.
    pub async fn start(
        self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(mpsc::UnboundedReceiver<DiscoveryEvent>, SocketAddr), DiscoveryError> {
        let socket = UdpSocket::bind(self.config.bind_address).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        let payload = self.announcement.to_json()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(
            address = %local_addr,
            broadcast = %self.config.broadcast_address,
            interval_ms = self.config.advertisement_interval.as_millis() as u64,
            "discovery started"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.advertisement_interval);
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("discovery stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = socket.send_to(&payload, self.config.broadcast_address).await {
                            warn!(error = %e, "failed to send announcement");
                        }
                    }
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, source)) => {
                            if let Some(event) = self.handle_datagram(&buf[..len], source) {
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "discovery receive failed"),
                    }
                }
            }
        });

        Ok((event_rx, local_addr))
    }
}
