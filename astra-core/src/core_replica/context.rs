use super::ReplicaError;
use crate::config::Config;
use crate::core_identity::ReplicaIdentity;
use std::path::PathBuf;

/// Everything a replica coordinator is built from
#[derive(Debug, Clone)]
pub struct ReplicaContext {
    pub identity: ReplicaIdentity,
    pub config: Config,
    pub data_dir: PathBuf,
}

impl ReplicaContext {
    pub fn new(identity: ReplicaIdentity, config: Config) -> Self {
        let data_dir = config.replica.data_dir.clone();
        ReplicaContext { identity, config, data_dir }
    }

    /// Create the data directory if needed and load (or create) the identity in it
    pub fn load(config: Config) -> Result<Self, ReplicaError> {
        config.validate()?;
        std::fs::create_dir_all(&config.replica.data_dir)?;
        let identity =
            ReplicaIdentity::load_or_create(&config.replica.data_dir, &config.replica.display_name)?;
        Ok(Self::new(identity, config))
    }
}
