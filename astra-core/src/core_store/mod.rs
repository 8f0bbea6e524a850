/*
    core_store - Replicated document state

    The authoritative local state layer of a replica.
    Handles:
    - Data models (documents, operations, values)
    - CRDT primitives and version vectors
    - Causal delivery with a pending buffer
    - Durable operation log and checkpoints
*/

pub mod crdt;
pub mod model;
pub mod resolver;
pub mod store;

#[cfg(test)]
pub mod tests;

// Re-export commonly used types
pub use crdt::{Crdt, LWWRegister, ORSet, Position, Sequence, VectorClock};
pub use model::{
    Document, DocumentValue, EntityId, FieldKind, FieldValue, Mutation, OpId, Operation, Payload,
    ReplicaId, Value,
};
pub use store::{ApplyOutcome, DocumentStore, OpLog, StoreError, StoreResult};
