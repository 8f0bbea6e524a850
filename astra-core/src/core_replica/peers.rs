/*
    peers.rs - Trusted peer table

    One record per paired replica: pinned static key, last known
    listening address, the vector last reconciled with it and its
    reachability. Persisted as `peers.json` in the data directory,
    replaced atomically on every save.
*/

use super::ReplicaError;
use crate::core_identity::TrustKey;
use crate::core_pairing::PairingOutcome;
use crate::core_store::crdt::VectorClock;
use crate::core_store::model::{ReplicaId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const PEERS_FILE: &str = "peers.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub replica_id: ReplicaId,
    pub display_name: String,
    pub trust_key: TrustKey,
    pub last_known_address: Option<SocketAddr>,
    #[serde(default)]
    pub last_synced_vector: VectorClock,
    #[serde(default)]
    pub reachable: bool,
    pub last_seen: Option<Timestamp>,
    pub last_synced: Option<Timestamp>,
    pub paired_at: Timestamp,

    /// Set when the peer presented a different key or failed an
    /// integrity check. Flagged peers are never synced automatically.
    #[serde(default)]
    pub trust_violation: bool,
}

impl PeerRecord {
    fn from_outcome(outcome: &PairingOutcome, address: Option<SocketAddr>) -> Self {
        PeerRecord {
            replica_id: outcome.replica_id.clone(),
            display_name: outcome.display_name.clone(),
            trust_key: outcome.trust_key,
            last_known_address: address,
            last_synced_vector: VectorClock::new(),
            reachable: address.is_some(),
            last_seen: Some(Timestamp::now()),
            last_synced: None,
            paired_at: Timestamp::now(),
            trust_violation: false,
        }
    }

    /// Whether the scheduler may open sync sessions to this peer
    pub fn is_syncable(&self) -> bool {
        !self.trust_violation && self.last_known_address.is_some()
    }
}

#[derive(Debug)]
pub struct PeerTable {
    path: PathBuf,
    peers: BTreeMap<ReplicaId, PeerRecord>,
}

impl PeerTable {
    pub fn path_for(data_dir: &Path) -> PathBuf {
        data_dir.join(PEERS_FILE)
    }

    /// Load the table at `path`; a missing file is an empty table
    pub fn load(path: PathBuf) -> Result<Self, ReplicaError> {
        if !path.exists() {
            return Ok(PeerTable { path, peers: BTreeMap::new() });
        }
        let data = std::fs::read(&path)?;
        let records: Vec<PeerRecord> = serde_json::from_slice(&data).map_err(|e| {
            ReplicaError::Corruption(format!("unreadable {}: {}", path.display(), e))
        })?;
        let peers = records.into_iter().map(|r| (r.replica_id.clone(), r)).collect();
        Ok(PeerTable { path, peers })
    }

    pub fn save(&self) -> Result<(), ReplicaError> {
        let records: Vec<&PeerRecord> = self.peers.values().collect();
        let json = serde_json::to_vec_pretty(&records)
            .map_err(|e| ReplicaError::Serialization(e.to_string()))?;

        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, json)?;
        std::fs::rename(&temp, &self.path)?;
        debug!(peers = self.peers.len(), "peer table saved");
        Ok(())
    }

    pub fn get(&self, replica_id: &ReplicaId) -> Option<&PeerRecord> {
        self.peers.get(replica_id)
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Record a successful pairing. Re-pairing replaces the pinned key and
    /// clears any trust violation but keeps the sync history.
    pub fn upsert_trusted(&mut self, outcome: &PairingOutcome, address: Option<SocketAddr>) -> PeerRecord {
        let record = match self.peers.get(&outcome.replica_id) {
            Some(existing) => {
                let mut updated = PeerRecord::from_outcome(outcome, address.or(existing.last_known_address));
                updated.last_synced_vector = existing.last_synced_vector.clone();
                updated.last_synced = existing.last_synced;
                if existing.trust_key != outcome.trust_key {
                    info!(peer = %outcome.replica_id, key = %outcome.trust_key.fingerprint(), "peer re-keyed");
                }
                updated
            }
            None => PeerRecord::from_outcome(outcome, address),
        };
        self.peers.insert(record.replica_id.clone(), record.clone());
        record
    }

    /// Note a discovery announcement. Returns true when the peer was not
    /// reachable before or moved to a new address.
    pub fn mark_seen(&mut self, replica_id: &ReplicaId, address: SocketAddr, now: Timestamp) -> bool {
        let Some(peer) = self.peers.get_mut(replica_id) else {
            return false;
        };
        let changed = !peer.reachable || peer.last_known_address != Some(address);
        peer.last_known_address = Some(address);
        peer.reachable = true;
        peer.last_seen = Some(now);
        changed
    }

    pub fn set_reachable(&mut self, replica_id: &ReplicaId, reachable: bool) -> bool {
        match self.peers.get_mut(replica_id) {
            Some(peer) if peer.reachable != reachable => {
                peer.reachable = reachable;
                true
            }
            _ => false,
        }
    }

    pub fn record_sync(&mut self, replica_id: &ReplicaId, vector: VectorClock, now: Timestamp) {
        if let Some(peer) = self.peers.get_mut(replica_id) {
            peer.last_synced_vector = vector;
            peer.last_synced = Some(now);
            peer.last_seen = Some(now);
            peer.reachable = true;
        }
    }

    pub fn flag_trust_violation(&mut self, replica_id: &ReplicaId) -> bool {
        match self.peers.get_mut(replica_id) {
            Some(peer) if !peer.trust_violation => {
                peer.trust_violation = true;
                peer.reachable = false;
                true
            }
            _ => false,
        }
    }

    /// Mark peers unreachable whose last sighting is older than `timeout`
    pub fn sweep_stale(&mut self, now: Timestamp, timeout: Duration) -> Vec<ReplicaId> {
        let cutoff = now.as_millis().saturating_sub(timeout.as_millis() as u64);
        let mut stale = Vec::new();
        for peer in self.peers.values_mut() {
            let last_seen = peer.last_seen.map(|t| t.as_millis()).unwrap_or(0);
            if peer.reachable && last_seen < cutoff {
                peer.reachable = false;
                stale.push(peer.replica_id.clone());
            }
        }
        stale
    }

    pub fn forget(&mut self, replica_id: &ReplicaId) -> Option<PeerRecord> {
        self.peers.remove(replica_id)
    }
}
