//! Replica identity persistence
//!
//! A replica identity is generated on first run and stored as
//! `identity.json` in the data directory. It never changes afterwards;
//! deleting it creates a new replica and invalidates every pairing.

use super::keypair::{StaticKeypair, TrustKey};
use super::IdentityError;
use crate::core_store::model::types::{ReplicaId, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

const IDENTITY_FILE: &str = "identity.json";

/// On-disk form of the identity
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    replica_id: ReplicaId,
    display_name: String,
    public_key: TrustKey,
    secret_key: String,
    created_at: Timestamp,
}

/// Stable identity of this replica
#[derive(Debug, Clone)]
pub struct ReplicaIdentity {
    replica_id: ReplicaId,
    display_name: String,
    keypair: StaticKeypair,
    created_at: Timestamp,
}

impl ReplicaIdentity {
    /// Create a brand new identity (not persisted)
    pub fn generate(display_name: impl Into<String>) -> Self {
        ReplicaIdentity {
            replica_id: ReplicaId::generate(),
            display_name: display_name.into(),
            keypair: StaticKeypair::generate(),
            created_at: Timestamp::now(),
        }
    }

    /// Path of the identity file inside a data directory
    pub fn identity_path(data_dir: &Path) -> PathBuf {
        data_dir.join(IDENTITY_FILE)
    }

    /// Load the identity in `data_dir`, creating and saving one if absent
    pub fn load_or_create(data_dir: &Path, display_name: &str) -> Result<Self, IdentityError> {
        let path = Self::identity_path(data_dir);
        if path.exists() {
            return Self::load(&path);
        }
        let identity = Self::generate(display_name);
        identity.save(&path)?;
        info!(
            replica_id = %identity.replica_id,
            trust_key = %identity.trust_key().fingerprint(),
            "created new replica identity"
        );
        Ok(identity)
    }

    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let data = std::fs::read_to_string(path)?;
        let stored: StoredIdentity = serde_json::from_str(&data)
            .map_err(|e| IdentityError::Serialization(e.to_string()))?;

        let secret = TrustKey::from_hex(&stored.secret_key)?;
        let keypair = StaticKeypair::from_secret(secret.0);
        if *keypair.public() != stored.public_key {
            return Err(IdentityError::InvalidKey(
                "stored public key does not match secret key".to_string(),
            ));
        }

        Ok(ReplicaIdentity {
            replica_id: stored.replica_id,
            display_name: stored.display_name,
            keypair,
            created_at: stored.created_at,
        })
    }

    /// Persist atomically (temp file, then rename)
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored = StoredIdentity {
            replica_id: self.replica_id.clone(),
            display_name: self.display_name.clone(),
            public_key: *self.keypair.public(),
            secret_key: hex::encode(self.keypair.secret_bytes()),
            created_at: self.created_at,
        };
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| IdentityError::Serialization(e.to_string()))?;

        let temp = path.with_extension("json.tmp");
        std::fs::write(&temp, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&temp, path)?;
        Ok(())
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn keypair(&self) -> &StaticKeypair {
        &self.keypair
    }

    pub fn trust_key(&self) -> &TrustKey {
        self.keypair.public()
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_or_create_is_stable() {
        let dir = tempdir().unwrap();
        let first = ReplicaIdentity::load_or_create(dir.path(), "laptop").unwrap();
        let second = ReplicaIdentity::load_or_create(dir.path(), "ignored").unwrap();

        assert_eq!(first.replica_id(), second.replica_id());
        assert_eq!(first.trust_key(), second.trust_key());
        assert_eq!(second.display_name(), "laptop");
    }

    #[test]
    fn test_tampered_public_key_rejected() {
        let dir = tempdir().unwrap();
        let path = ReplicaIdentity::identity_path(dir.path());
        ReplicaIdentity::generate("phone").save(&path).unwrap();

        let mut json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        json["public_key"] = serde_json::Value::String(StaticKeypair::generate().public().to_hex());
        std::fs::write(&path, json.to_string()).unwrap();

        assert!(matches!(ReplicaIdentity::load(&path), Err(IdentityError::InvalidKey(_))));
    }
}
