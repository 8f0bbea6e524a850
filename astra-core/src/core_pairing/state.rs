use super::PairingError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-candidate pairing state
///
/// ```text
/// Discovered -> PairingRequested -> ChallengeIssued -> Trusted
///      \               \                  \
///       +---------------+------------------+-> Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingState {
    Discovered,
    PairingRequested,
    ChallengeIssued,
    Trusted,
    Rejected,
}

impl PairingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PairingState::Trusted | PairingState::Rejected)
    }

    pub fn can_transition_to(&self, next: PairingState) -> bool {
        use PairingState::*;
        matches!(
            (self, next),
            (Discovered, PairingRequested)
                | (PairingRequested, ChallengeIssued)
                | (ChallengeIssued, Trusted)
                | (Discovered | PairingRequested | ChallengeIssued, Rejected)
        )
    }

    /// Checked transition
    pub fn transition(self, next: PairingState) -> Result<PairingState, PairingError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(PairingError::InvalidTransition { from: self, to: next })
        }
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PairingState::Discovered => "discovered",
            PairingState::PairingRequested => "pairing-requested",
            PairingState::ChallengeIssued => "challenge-issued",
            PairingState::Trusted => "trusted",
            PairingState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}
