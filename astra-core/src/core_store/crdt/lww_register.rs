/*
    lww_register.rs - Last-Write-Wins Register CRDT

    A simple CRDT that holds a single value.
    Conflicts are resolved by taking the write with the highest logical
    clock. If clocks are equal, the replica ID is the tiebreaker.

    The clock is a Lamport timestamp assigned by the writing replica, so a
    write that causally follows another always wins over it regardless of
    wall-clock skew.

    Use cases:
    - Note title
    - Task status / due date
    - Any single-value field that can be overwritten
*/

use super::traits::{Crdt, ValidatedCrdt};
use crate::core_store::model::types::ReplicaId;
use crate::core_store::store::errors::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};

/// Largest clock a write may carry; leaves room for every replica to
/// keep counting past the highest clock it has seen
pub const MAX_CLOCK: u64 = u64::MAX >> 1;

/// Last-Write-Wins Register CRDT
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LWWRegister<T: Clone> {
    /// Current value
    value: Option<T>,

    /// Logical clock of the winning write
    clock: u64,

    /// Replica of the winning write (for tiebreaking)
    writer: Option<ReplicaId>,
}

/// Operation for LWW Register
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LWWOperation<T: Clone> {
    /// New value to set
    pub value: T,

    /// Lamport clock of the write
    pub clock: u64,

    /// Replica that issued the write
    pub writer: ReplicaId,
}

impl<T: Clone> LWWRegister<T> {
    /// Create a new empty LWW register
    pub fn new() -> Self {
        LWWRegister { value: None, clock: 0, writer: None }
    }

    /// Set a new value if `(clock, writer)` beats the current write
    pub fn set(&mut self, value: T, clock: u64, writer: ReplicaId) {
        if self.should_update(clock, &writer) {
            self.value = Some(value);
            self.clock = clock;
            self.writer = Some(writer);
        }
    }

    /// Check if we should update based on clock and replica ID
    fn should_update(&self, new_clock: u64, new_writer: &ReplicaId) -> bool {
        match &self.writer {
            None => true,
            Some(current) => (new_clock, new_writer) > (self.clock, current),
        }
    }

    /// Get the current value
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Get the logical clock of the last winning write
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Get the replica of the last winning write
    pub fn writer(&self) -> Option<&ReplicaId> {
        self.writer.as_ref()
    }
}

impl<T: Clone + Send + Sync> Crdt for LWWRegister<T> {
    type Operation = LWWOperation<T>;
    type Value = Option<T>;

    fn apply(&mut self, op: Self::Operation) -> StoreResult<()> {
        self.set(op.value, op.clock, op.writer);
        Ok(())
    }

    fn value(&self) -> Self::Value {
        self.value.clone()
    }
}

impl<T: Clone + Send + Sync> ValidatedCrdt for LWWRegister<T> {
    fn validate(&self, op: &Self::Operation) -> StoreResult<()> {
        if op.clock == 0 || op.clock > MAX_CLOCK {
            return Err(StoreError::Validation(format!("register clock {} out of range", op.clock)));
        }
        Ok(())
    }
}

impl<T: Clone> Default for LWWRegister<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(id: &str) -> ReplicaId {
        ReplicaId::from(id)
    }

    #[test]
    fn test_lww_register_creation() {
        let reg: LWWRegister<String> = LWWRegister::new();
        assert!(reg.get().is_none());
        assert_eq!(reg.clock(), 0);
        assert!(reg.writer().is_none());
    }

    #[test]
    fn test_lww_later_write_wins() {
        let mut reg: LWWRegister<i32> = LWWRegister::new();

        reg.set(42, 5, r("node1"));
        reg.set(99, 7, r("node2"));

        assert_eq!(reg.get(), Some(&99));
        assert_eq!(reg.clock(), 7);
        assert_eq!(reg.writer(), Some(&r("node2")));
    }

    #[test]
    fn test_lww_earlier_write_loses() {
        let mut reg: LWWRegister<i32> = LWWRegister::new();

        reg.set(99, 7, r("node2"));
        reg.set(42, 5, r("node1"));

        assert_eq!(reg.get(), Some(&99));
    }

    #[test]
    fn test_lww_tiebreak_by_replica() {
        let mut a: LWWRegister<&str> = LWWRegister::new();
        a.set("from-a", 3, r("a"));
        a.set("from-b", 3, r("b"));

        let mut b: LWWRegister<&str> = LWWRegister::new();
        b.set("from-b", 3, r("b"));
        b.set("from-a", 3, r("a"));

        assert_eq!(a.get(), Some(&"from-b"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_lww_validate_clock_range() {
        let reg: LWWRegister<i32> = LWWRegister::new();
        let op = |clock| LWWOperation { value: 1, clock, writer: r("a") };

        assert!(reg.validate(&op(1)).is_ok());
        assert!(reg.validate(&op(MAX_CLOCK)).is_ok());
        assert!(matches!(reg.validate(&op(0)), Err(StoreError::Validation(_))));
        assert!(matches!(reg.validate(&op(u64::MAX)), Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_lww_apply_idempotent() {
        let mut reg: LWWRegister<i32> = LWWRegister::new();
        let op = LWWOperation { value: 10, clock: 1, writer: r("a") };

        reg.apply(op.clone()).unwrap();
        let once = reg.clone();
        reg.apply(op).unwrap();

        assert_eq!(reg, once);
    }
}
