//! Identity management module
//!
//! - `ReplicaIdentity::load_or_create(data_dir, name)` -> loads `identity.json` or creates it
//! - `StaticKeypair` -> long-term X25519 key used as the Noise static key
//! - `TrustKey` -> public half, pinned by peers at pairing time

mod identity;
mod keypair;

pub use identity::ReplicaIdentity;
pub use keypair::{StaticKeypair, TrustKey};

/// Errors that can occur during identity operations
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
