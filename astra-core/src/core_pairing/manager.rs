/*
    PairingManager - pairing candidates and user confirmations

    Tracks one `PairingCandidate` per remote replica and drives its state
    machine. The pairing protocol asks for a confirmation with
    `challenge`; the UI answers through `confirm`. Everything observable
    is published as a `PairingEvent`.

    Candidates that sit in a non-terminal state for longer than the
    confirmation timeout expire to `Rejected`. Terminal candidates are
    forgotten after the same period, so a later announcement starts over.
*/

use super::code::ShortCode;
use super::state::PairingState;
use super::PairingError;
use crate::core_store::model::ReplicaId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    CandidateDiscovered { replica_id: ReplicaId, display_name: String, address: SocketAddr },

    /// Show `code` and ask the user to accept or reject.
    ///
    /// `rekey` is set when the replica is already paired under another key.
    ConfirmationRequired { replica_id: ReplicaId, display_name: String, code: ShortCode, rekey: bool },

    Trusted { replica_id: ReplicaId },
    Rejected { replica_id: ReplicaId, reason: String },
}

/// Read-only view of a candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateInfo {
    pub replica_id: ReplicaId,
    pub display_name: String,
    pub address: Option<SocketAddr>,
    pub state: PairingState,
    pub code: Option<ShortCode>,
}

struct Candidate {
    info: CandidateInfo,
    updated_at: Instant,
    confirmation: Option<oneshot::Sender<bool>>,
}

impl Candidate {
    fn new(replica_id: ReplicaId, display_name: String, address: Option<SocketAddr>) -> Self {
        Candidate {
            info: CandidateInfo {
                replica_id,
                display_name,
                address,
                state: PairingState::Discovered,
                code: None,
            },
            updated_at: Instant::now(),
            confirmation: None,
        }
    }

    fn transition(&mut self, next: PairingState) -> Result<(), PairingError> {
        self.info.state = self.info.state.transition(next)?;
        self.updated_at = Instant::now();
        Ok(())
    }
}

pub struct PairingManager {
    candidates: Mutex<HashMap<ReplicaId, Candidate>>,
    events: broadcast::Sender<PairingEvent>,
    timeout: Duration,
}

impl PairingManager {
    pub fn new(timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        PairingManager { candidates: Mutex::new(HashMap::new()), events, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PairingEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn with_candidates<T>(
        &self,
        f: impl FnOnce(&mut HashMap<ReplicaId, Candidate>) -> Result<T, PairingError>,
    ) -> Result<T, PairingError> {
        let mut candidates = self.candidates.lock().map_err(|_| PairingError::Poisoned)?;
        f(&mut candidates)
    }

    /// Record an announcement from an unpaired replica
    pub fn discovered(&self, replica_id: ReplicaId, display_name: String, address: SocketAddr) {
        let is_new = self
            .with_candidates(|candidates| {
                let fresh = match candidates.get_mut(&replica_id) {
                    Some(existing) if !existing.info.state.is_terminal() => {
                        existing.info.address = Some(address);
                        if existing.info.state == PairingState::Discovered {
                            existing.updated_at = Instant::now();
                        }
                        false
                    }
                    _ => true,
                };
                if fresh {
                    candidates.insert(
                        replica_id.clone(),
                        Candidate::new(replica_id.clone(), display_name.clone(), Some(address)),
                    );
                }
                Ok(fresh)
            })
            .unwrap_or(false);

        if is_new {
            debug!(replica_id = %replica_id, address = %address, "new pairing candidate");
            self.emit(PairingEvent::CandidateDiscovered { replica_id, display_name, address });
        }
    }

    /// Move a candidate to `PairingRequested`, creating it if needed
    pub fn begin(
        &self,
        replica_id: &ReplicaId,
        display_name: &str,
        address: Option<SocketAddr>,
    ) -> Result<(), PairingError> {
        self.with_candidates(|candidates| {
            let candidate = candidates
                .entry(replica_id.clone())
                .and_modify(|existing| {
                    if existing.info.state.is_terminal() {
                        *existing = Candidate::new(replica_id.clone(), display_name.to_string(), address);
                    }
                })
                .or_insert_with(|| Candidate::new(replica_id.clone(), display_name.to_string(), address));
            candidate.info.display_name = display_name.to_string();
            candidate.transition(PairingState::PairingRequested)
        })
    }

    /// Move to `ChallengeIssued` and wait for the user's answer on the receiver
    pub fn challenge(
        &self,
        replica_id: &ReplicaId,
        code: ShortCode,
        rekey: bool,
    ) -> Result<oneshot::Receiver<bool>, PairingError> {
        let (tx, rx) = oneshot::channel();
        let display_name = self.with_candidates(|candidates| {
            let candidate = candidates
                .get_mut(replica_id)
                .ok_or_else(|| PairingError::UnknownCandidate(replica_id.clone()))?;
            candidate.transition(PairingState::ChallengeIssued)?;
            candidate.info.code = Some(code);
            candidate.confirmation = Some(tx);
            Ok(candidate.info.display_name.clone())
        })?;

        info!(replica_id = %replica_id, code = %code, rekey, "pairing code issued");
        self.emit(PairingEvent::ConfirmationRequired {
            replica_id: replica_id.clone(),
            display_name,
            code,
            rekey,
        });
        Ok(rx)
    }

    /// The user's answer for a pending challenge
    pub fn confirm(&self, replica_id: &ReplicaId, accepted: bool) -> Result<(), PairingError> {
        let sender = self.with_candidates(|candidates| {
            candidates
                .get_mut(replica_id)
                .filter(|candidate| candidate.info.state == PairingState::ChallengeIssued)
                .and_then(|candidate| candidate.confirmation.take())
                .ok_or_else(|| PairingError::NoPendingConfirmation(replica_id.clone()))
        })?;
        sender
            .send(accepted)
            .map_err(|_| PairingError::NoPendingConfirmation(replica_id.clone()))
    }

    /// Finish a pairing attempt
    pub fn complete(&self, replica_id: &ReplicaId, trusted: bool, reason: &str) -> Result<(), PairingError> {
        let next = if trusted { PairingState::Trusted } else { PairingState::Rejected };
        self.with_candidates(|candidates| {
            let candidate = candidates
                .get_mut(replica_id)
                .ok_or_else(|| PairingError::UnknownCandidate(replica_id.clone()))?;
            candidate.confirmation = None;
            candidate.transition(next)
        })?;

        if trusted {
            info!(replica_id = %replica_id, "pairing complete");
            self.emit(PairingEvent::Trusted { replica_id: replica_id.clone() });
        } else {
            warn!(replica_id = %replica_id, reason, "pairing rejected");
            self.emit(PairingEvent::Rejected {
                replica_id: replica_id.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Expire candidates idle for longer than the timeout; returns how many expired
    pub fn expire_stale(&self) -> usize {
        self.expire_older_than(Instant::now())
    }

    fn expire_older_than(&self, now: Instant) -> usize {
        let timeout = self.timeout;
        let expired = self
            .with_candidates(|candidates| {
                let idle = |c: &Candidate| now.saturating_duration_since(c.updated_at) >= timeout;
                candidates.retain(|_, c| !(c.info.state.is_terminal() && idle(c)));

                let mut expired = Vec::new();
                for candidate in candidates.values_mut() {
                    if !candidate.info.state.is_terminal() && idle(candidate) {
                        candidate.confirmation = None;
                        candidate.transition(PairingState::Rejected)?;
                        expired.push(candidate.info.replica_id.clone());
                    }
                }
                Ok(expired)
            })
            .unwrap_or_default();

        for replica_id in &expired {
            debug!(replica_id = %replica_id, "pairing candidate expired");
            self.emit(PairingEvent::Rejected {
                replica_id: replica_id.clone(),
                reason: "confirmation timed out".to_string(),
            });
        }
        expired.len()
    }

    pub fn state(&self, replica_id: &ReplicaId) -> Option<PairingState> {
        self.candidates.lock().ok()?.get(replica_id).map(|c| c.info.state)
    }

    pub fn candidates(&self) -> Vec<CandidateInfo> {
        self.candidates
            .lock()
            .map(|candidates| candidates.values().map(|c| c.info.clone()).collect())
            .unwrap_or_default()
    }
}
