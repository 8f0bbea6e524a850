/*
    received.rs - Log of operations received from peers

    Every operation from another origin is appended here before it is
    applied. Local operations that were written on top of remote ones
    can then be replayed after a crash without waiting for the peer to
    come back. Writing a checkpoint makes the log redundant, so it is
    emptied right after.

    Same record layout as the operation log; the counter field holds the
    record's position in this file, starting at 1.
*/

use super::oplog::{append_record, open_records};
use crate::core_store::model::operation::Operation;
use crate::core_store::model::types::{ReplicaId, Timestamp};
use crate::core_store::store::errors::{StoreError, StoreResult};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Append-only log of applied remote operations since the last checkpoint
pub struct ReceivedLog {
    path: PathBuf,
    file: File,
    entries: Vec<Operation>,
    size: u64,
}

impl ReceivedLog {
    pub fn path_for(data_dir: &Path, replica: &ReplicaId) -> PathBuf {
        data_dir.join("oplog").join(format!("{}.received.log", replica))
    }

    pub fn open(path: PathBuf) -> StoreResult<Self> {
        let (records, file, size) = open_records(&path)?;
        let mut entries = Vec::with_capacity(records.len());
        for (position, op) in records {
            let expected = entries.len() as u64 + 1;
            if position != expected {
                return Err(StoreError::Corruption(format!(
                    "received log position gap: expected {}, found {}",
                    expected, position
                )));
            }
            entries.push(op);
        }
        debug!(path = %path.display(), entries = entries.len(), "received log opened");

        Ok(ReceivedLog { path, file, entries, size })
    }

    /// Durably append an operation before it is applied
    pub fn append(&mut self, op: &Operation) -> StoreResult<()> {
        let position = self.entries.len() as u64 + 1;
        self.size += append_record(&mut self.file, self.size, position, op)?;
        self.entries.push(op.clone());
        Ok(())
    }

    /// Everything received since the log was last emptied, in arrival order
    pub fn operations(&self) -> &[Operation] {
        &self.entries
    }

    /// Drop every record; called once a checkpoint covers them
    pub fn clear(&mut self) -> StoreResult<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.entries.clear();
        self.size = 0;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn quarantine(path: &Path) -> StoreResult<PathBuf> {
        let target = path.with_extension(format!("corrupt-{}", Timestamp::now()));
        std::fs::rename(path, &target)?;
        warn!(from = %path.display(), to = %target.display(), "quarantined received log");
        Ok(target)
    }
}
