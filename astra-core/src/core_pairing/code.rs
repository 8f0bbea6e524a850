//! Short verification codes
//!
//! Both ends of a Noise session share the same handshake hash, so a code
//! derived from it matches on both screens exactly when no one sits in
//! the middle of the handshake.

use sha2::{Digest, Sha256};
use std::fmt;

const CODE_DOMAIN: &[u8] = b"astra-pair-v1";

/// Six-digit code users compare during pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortCode(u32);

impl ShortCode {
    /// SHA-256(handshake_hash || domain) -> first 4 bytes LE -> mod 10^6
    pub fn from_handshake_hash(handshake_hash: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(handshake_hash);
        hasher.update(CODE_DOMAIN);
        let hash = hasher.finalize();
        let raw = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]);
        ShortCode(raw % 1_000_000)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ShortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}
