/*
    core_router - Encrypted transport between replicas

    - transport_manager: TCP listen/dial and length-prefixed framing
    - session: Noise XX handshake, encrypted frame channel, Hello exchange
    - frame: wire frames
    - backoff: reconnect schedule ending in `Unreachable`
    - memory: in-process links and fault injection for tests
*/

pub mod backoff;
pub mod frame;
#[cfg(test)]
pub(crate) mod memory;
pub mod session;
pub mod transport_manager;

pub use backoff::{connect_with_backoff, Backoff, BackoffPolicy};
pub use frame::{Frame, Hello, ProtocolVersion, SessionPurpose};
pub use session::{FrameSink, FrameSource, Session, SessionReader, SessionWriter};
pub use transport_manager::{TransportEvent, TransportManager};

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Noise error: {0}")]
    Noise(#[from] snow::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Frame codec error: {0}")]
    Codec(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Connection closed")]
    Closed,

    #[error("Timed out")]
    Timeout,

    #[error("Peer {address} unreachable after {attempts} attempts")]
    Unreachable { address: String, attempts: u32 },

    #[error("Trust violation: expected key {expected}, peer presented {actual}")]
    TrustViolation { expected: String, actual: String },

    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: ProtocolVersion, remote: ProtocolVersion },

    #[error("Unexpected frame: expected {expected}, got {actual}")]
    UnexpectedFrame { expected: &'static str, actual: &'static str },
}

impl TransportError {
    /// Failures that a later attempt may not hit again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_)
                | TransportError::Closed
                | TransportError::Timeout
                | TransportError::Unreachable { .. }
        )
    }
}
