/*
    operation.rs - The unit of replication

    An Operation is an immutable record of one change to one field of
    one document. Operations are what the log persists, what peers
    exchange, and what the store applies.

    `dependency_vector` is the originating replica's version vector at
    creation time, before the operation's own counter was assigned.
*/

use super::types::{EntityId, LogicalCounter, OpId, ReplicaId};
use super::value::Value;
use crate::core_store::crdt::sequence::Position;
use crate::core_store::crdt::vector_clock::VectorClock;
use crate::core_store::store::errors::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// CRDT kind backing a document field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldKind {
    Register,
    Set,
    Sequence,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Register => "register",
            FieldKind::Set => "set",
            FieldKind::Sequence => "sequence",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete change carried by an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Register write at Lamport clock `clock`
    Set { value: Value, clock: u64 },
    /// Observed-remove set add; the tag is the operation id
    AddElement { element: Value },
    /// Observed-remove set remove of the tags the author had seen
    RemoveElement { element: Value, observed: BTreeSet<OpId> },
    /// Sequence insert at a fractional position
    Insert { position: Position, value: Value },
    /// Sequence delete (tombstone)
    Delete { position: Position },
}

impl Payload {
    pub fn kind(&self) -> FieldKind {
        match self {
            Payload::Set { .. } => FieldKind::Register,
            Payload::AddElement { .. } | Payload::RemoveElement { .. } => FieldKind::Set,
            Payload::Insert { .. } | Payload::Delete { .. } => FieldKind::Sequence,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Payload::Set { .. } => "set",
            Payload::AddElement { .. } => "add_element",
            Payload::RemoveElement { .. } => "remove_element",
            Payload::Insert { .. } => "insert",
            Payload::Delete { .. } => "delete",
        }
    }
}

/// Local intent handed to the coordinator's `mutate`.
///
/// The store turns a mutation into a concrete [`Payload`]: it assigns the
/// register clock, collects observed tags and allocates positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Set(Value),
    AddElement(Value),
    RemoveElement(Value),
    Insert { index: usize, value: Value },
    Delete { index: usize },
}

impl Mutation {
    /// Field kind this mutation writes
    pub fn kind(&self) -> FieldKind {
        match self {
            Mutation::Set(_) => FieldKind::Register,
            Mutation::AddElement(_) | Mutation::RemoveElement(_) => FieldKind::Set,
            Mutation::Insert { .. } | Mutation::Delete { .. } => FieldKind::Sequence,
        }
    }
}

/// Immutable replicated operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub origin_replica: ReplicaId,
    pub origin_counter: LogicalCounter,
    pub entity_id: EntityId,
    pub field_path: String,
    pub payload: Payload,
    pub dependency_vector: VectorClock,
}

impl Operation {
    pub fn id(&self) -> OpId {
        OpId::new(self.origin_replica.clone(), self.origin_counter)
    }

    /// Serialize to the canonical bincode form used on disk and on the wire
    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    /// CRC32 of the canonical encoding
    pub fn checksum(&self) -> StoreResult<u32> {
        Ok(crc32fast::hash(&self.to_bytes()?))
    }

    /// Structural checks that do not depend on document state
    pub fn check_well_formed(&self) -> StoreResult<()> {
        if self.origin_counter == 0 {
            return Err(StoreError::Validation(format!("operation {} has counter 0", self.id())));
        }
        if self.dependency_vector.get(&self.origin_replica) != self.origin_counter - 1 {
            return Err(StoreError::Validation(format!(
                "operation {} depends on counter {} of its own origin",
                self.id(),
                self.dependency_vector.get(&self.origin_replica)
            )));
        }
        if self.field_path.is_empty() {
            return Err(StoreError::Validation(format!("operation {} has empty field path", self.id())));
        }
        if let Payload::Insert { position, .. } = &self.payload {
            if position.creator() != Some(self.id()) {
                return Err(StoreError::Validation(format!(
                    "insert {} carries a position allocated by another operation",
                    self.id()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{} {}", self.id(), self.entity_id, self.field_path, self.payload.name())
    }
}
