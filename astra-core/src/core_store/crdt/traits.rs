/*
    traits.rs - Core CRDT trait definitions

    Defines the unified interface that all CRDT types implement:
    - Apply operations
    - Query current state
    - Validate operations before they touch state
*/

use crate::core_store::store::errors::StoreResult;

/// Core trait that all CRDTs must implement
pub trait Crdt: Clone + Send + Sync {
    /// The type of operations this CRDT accepts
    type Operation: Clone + Send + Sync;

    /// The type of value this CRDT represents
    type Value: Clone;

    /// Apply an operation to this CRDT.
    /// Applying the same operation twice must leave the state unchanged.
    fn apply(&mut self, op: Self::Operation) -> StoreResult<()>;

    /// Get the current value/state
    fn value(&self) -> Self::Value;
}

/// Trait for CRDTs that can be validated before applying
pub trait ValidatedCrdt: Crdt {
    /// Validate an operation before applying it.
    /// A failed validation guarantees the state was not touched.
    fn validate(&self, op: &Self::Operation) -> StoreResult<()>;
}
