//! Keypair module
//!
//! Long-term X25519 static keypair of a replica. The public half is the
//! replica's *trust key*: peers pin it at pairing time and check it on
//! every later Noise handshake.
//!
//! Security: the secret key is zeroized on drop.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::IdentityError;

/// Public X25519 key pinned for a paired peer
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrustKey(pub [u8; 32]);

impl TrustKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(TrustKey(array))
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s).map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form for logs and UIs
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for TrustKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrustKey({})", self.fingerprint())
    }
}

impl fmt::Display for TrustKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for TrustKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TrustKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TrustKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Static X25519 keypair used as the Noise static key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StaticKeypair {
    #[zeroize(skip)]
    public: TrustKey,
    secret: [u8; 32],
}

impl StaticKeypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret_bytes: [u8; 32] = rand::random();
        Self::from_secret(secret_bytes)
    }

    /// Rebuild a keypair from its secret half
    pub fn from_secret(secret_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public = X25519PublicKey::from(&secret);
        StaticKeypair { public: TrustKey(public.to_bytes()), secret: secret.to_bytes() }
    }

    pub fn public(&self) -> &TrustKey {
        &self.public
    }

    /// Secret key bytes (use carefully!)
    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &self.public)
            .field("secret", &"<redacted>")
            .finish()
    }
}
