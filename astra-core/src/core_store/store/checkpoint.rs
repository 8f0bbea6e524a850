/*
    checkpoint.rs - Compacted state checkpoints for fast recovery

    Periodically writes the full store state (documents, version vector,
    pending buffer, relay index) to `checkpoint.bin`. Startup loads the
    checkpoint and then replays only the operation log tail above the
    checkpoint's local counter.

    Features:
    - Atomic replacement (write to temp, sync, then rename)
    - Versioned format with metadata
*/

use crate::core_store::model::types::{LogicalCounter, ReplicaId, Timestamp};
use crate::core_store::store::document_store::StoreState;
use crate::core_store::store::errors::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 2;

const CHECKPOINT_FILE: &str = "checkpoint.bin";

/// Checkpoint metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Format version
    pub version: u32,

    /// Replica the state belongs to
    pub replica: ReplicaId,

    /// When the checkpoint was written
    pub timestamp: Timestamp,

    /// Number of documents
    pub documents_count: usize,

    /// Local counter reflected in the state
    pub local_counter: LogicalCounter,
}

/// Checkpoint data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    pub state: StoreState,
}

/// Reads and writes the checkpoint file of a data directory
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: PathBuf) -> StoreResult<Self> {
        create_dir_all(&dir)?;
        Ok(CheckpointManager { dir })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    /// Write a new checkpoint, replacing the previous one atomically
    pub fn save(&self, replica: &ReplicaId, state: &StoreState) -> StoreResult<CheckpointMetadata> {
        let metadata = CheckpointMetadata {
            version: CHECKPOINT_VERSION,
            replica: replica.clone(),
            timestamp: Timestamp::now(),
            documents_count: state.documents.len(),
            local_counter: state.version_vector.get(replica),
        };

        #[derive(Serialize)]
        struct CheckpointRef<'a> {
            metadata: &'a CheckpointMetadata,
            state: &'a StoreState,
        }
        let data = bincode::serialize(&CheckpointRef { metadata: &metadata, state })?;

        let temp_path = self.dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, self.path())?;
        debug!(
            documents = metadata.documents_count,
            local_counter = metadata.local_counter,
            bytes = data.len(),
            "checkpoint written"
        );
        Ok(metadata)
    }

    /// Load the checkpoint, if one exists
    pub fn load(&self) -> StoreResult<Option<Checkpoint>> {
        Self::load_from(&self.path())
    }

    fn load_from(path: &Path) -> StoreResult<Option<Checkpoint>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(path)?;
        let checkpoint: Checkpoint = bincode::deserialize(&data)
            .map_err(|e| StoreError::Corruption(format!("unreadable checkpoint: {}", e)))?;

        if checkpoint.metadata.version != CHECKPOINT_VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported checkpoint version {}",
                checkpoint.metadata.version
            )));
        }
        Ok(Some(checkpoint))
    }

    /// Remove the checkpoint (used when re-seeding from a peer)
    pub fn clear(&self) -> StoreResult<()> {
        let path = self.path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}
