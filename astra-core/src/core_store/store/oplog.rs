/*
    oplog.rs - Append-only operation log

    Durable, ordered record of every locally originated operation.
    Enables replay after a crash and serves the local half of the
    deltas a peer is missing.

    Record layout: [counter:8 LE][len:4 LE][bincode(Operation):len][crc32:4 LE]

    Features:
    - Append-only writes, each one flushed and synced before returning
    - Counters are contiguous from 1; a gap means the log is corrupt
    - CRC32 checksums for corruption detection
    - A torn trailing record (crash mid-write) is truncated on open
*/

use crate::core_store::crdt::VectorClock;
use crate::core_store::model::operation::Operation;
use crate::core_store::model::types::{LogicalCounter, ReplicaId, Timestamp};
use crate::core_store::store::errors::{StoreError, StoreResult};
use crate::metrics;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const HEADER_LEN: usize = 8 + 4;
const TRAILER_LEN: usize = 4;

/// Append-only log of local operations
pub struct OpLog {
    path: PathBuf,
    replica: ReplicaId,
    file: File,
    entries: Vec<Operation>,
    size: u64,
}

impl OpLog {
    /// Location of a replica's log inside a data directory
    pub fn path_for(data_dir: &Path, replica: &ReplicaId) -> PathBuf {
        data_dir.join("oplog").join(format!("{}.log", replica))
    }

    /// Open (or create) a log and replay its contents
    pub fn open(path: PathBuf, replica: ReplicaId) -> StoreResult<Self> {
        let (records, file, size) = open_records(&path)?;
        let entries = Self::check_sequence(records, &replica)?;
        debug!(path = %path.display(), entries = entries.len(), "operation log opened");

        Ok(OpLog { path, replica, file, entries, size })
    }

    /// Local records must run 1, 2, 3... and carry their own counter
    fn check_sequence(
        records: Vec<(u64, Operation)>,
        replica: &ReplicaId,
    ) -> StoreResult<Vec<Operation>> {
        let mut entries: Vec<Operation> = Vec::with_capacity(records.len());
        for (counter, op) in records {
            let expected = entries.len() as u64 + 1;
            if counter != expected || op.origin_counter != counter {
                return Err(StoreError::Corruption(format!(
                    "counter gap: expected {}, found {}",
                    expected, counter
                )));
            }
            if op.origin_replica != *replica {
                return Err(StoreError::Corruption(format!(
                    "record {} belongs to replica {}",
                    counter, op.origin_replica
                )));
            }
            entries.push(op);
        }
        Ok(entries)
    }

    /// Durably append the next local operation
    pub fn append(&mut self, op: &Operation) -> StoreResult<()> {
        if op.origin_replica != self.replica {
            return Err(StoreError::Validation(format!(
                "operation {} is not local to {}",
                op.id(),
                self.replica
            )));
        }
        let expected = self.last_counter() + 1;
        if op.origin_counter != expected {
            return Err(StoreError::Corruption(format!(
                "append out of order: expected counter {}, got {}",
                expected, op.origin_counter
            )));
        }

        let written = append_record(&mut self.file, self.size, op.origin_counter, op)?;
        self.size += written;
        self.entries.push(op.clone());
        metrics::record_oplog_append(written as usize);
        Ok(())
    }

    /// Local operations with counter above `vector[local]`, in counter order.
    ///
    /// Lazy and restartable: calling again with the same vector yields
    /// the same sequence.
    pub fn operations_since<'a>(
        &'a self,
        vector: &VectorClock,
    ) -> impl Iterator<Item = Operation> + 'a {
        let seen = vector.get(&self.replica) as usize;
        self.entries.iter().skip(seen).cloned()
    }

    pub fn last_counter(&self) -> LogicalCounter {
        self.entries.last().map(|op| op.origin_counter).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move a damaged log aside so a fresh one can be started
    pub fn quarantine(path: &Path) -> StoreResult<PathBuf> {
        let target = path.with_extension(format!("corrupt-{}", Timestamp::now()));
        std::fs::rename(path, &target)?;
        warn!(from = %path.display(), to = %target.display(), "quarantined operation log");
        Ok(target)
    }
}

/// Read every intact record of a log file, drop a torn tail, and open
/// the file for appending. Returns the records, the file and its size.
pub(crate) fn open_records(path: &Path) -> StoreResult<(Vec<(u64, Operation)>, File, u64)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let bytes = if path.exists() { std::fs::read(path)? } else { Vec::new() };
    let (records, valid_len) = decode_records(&bytes)?;

    if valid_len < bytes.len() {
        warn!(
            path = %path.display(),
            dropped_bytes = bytes.len() - valid_len,
            "truncating torn record at end of log"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len as u64)?;
        file.sync_all()?;
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok((records, file, valid_len as u64))
}

/// Parse records, returning them and the length of the valid prefix
fn decode_records(bytes: &[u8]) -> StoreResult<(Vec<(u64, Operation)>, usize)> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let rest = &bytes[offset..];
        if rest.len() < HEADER_LEN {
            break;
        }
        let counter = read_u64(&rest[0..8]);
        let len = read_u32(&rest[8..12]) as usize;
        let total = HEADER_LEN + len + TRAILER_LEN;
        if rest.len() < total {
            break;
        }

        let data = &rest[HEADER_LEN..HEADER_LEN + len];
        let checksum = read_u32(&rest[HEADER_LEN + len..total]);
        if crc32fast::hash(data) != checksum {
            return Err(StoreError::Corruption(format!(
                "checksum mismatch for counter {} at offset {}",
                counter, offset
            )));
        }

        let op = Operation::from_bytes(data).map_err(|e| {
            StoreError::Corruption(format!("undecodable record at offset {}: {}", offset, e))
        })?;

        records.push((counter, op));
        offset += total;
    }

    Ok((records, offset))
}

/// Durably write one record at the end of `file`, whose valid length is
/// `size`. Returns the number of bytes written.
pub(crate) fn append_record(
    file: &mut File,
    size: u64,
    counter: u64,
    op: &Operation,
) -> StoreResult<u64> {
    let data = op.to_bytes()?;
    let mut record = Vec::with_capacity(HEADER_LEN + data.len() + TRAILER_LEN);
    record.extend_from_slice(&counter.to_le_bytes());
    record.extend_from_slice(&(data.len() as u32).to_le_bytes());
    record.extend_from_slice(&data);
    record.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());

    let written = file.write_all(&record).and_then(|_| file.flush()).and_then(|_| file.sync_data());
    if let Err(e) = written {
        // Drop any partial record so the next append starts clean
        let _ = file.set_len(size);
        return Err(e.into());
    }
    Ok(record.len() as u64)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}
