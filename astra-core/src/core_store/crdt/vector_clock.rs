/*
    vector_clock.rs - Version vector for causal ordering

    A version vector maps each replica to the highest logical counter
    from that replica reflected in some state. Used to determine:
    - Whether an operation's dependencies are satisfied
    - Which operations a peer is missing
    - Happened-before / concurrent relationships

    Components only ever grow: `set` and `merge` never lower a value.
*/

use crate::core_store::model::types::{LogicalCounter, ReplicaId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Version vector for tracking causal order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    /// Map from replica ID to highest observed counter
    clock: BTreeMap<ReplicaId, LogicalCounter>,
}

impl VectorClock {
    /// Create a new empty vector clock
    pub fn new() -> Self {
        VectorClock { clock: BTreeMap::new() }
    }

    /// Increment the component for a replica and return the new value
    pub fn increment(&mut self, replica: &ReplicaId) -> LogicalCounter {
        let counter = self.clock.entry(replica.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Get the counter for a replica (0 when absent)
    pub fn get(&self, replica: &ReplicaId) -> LogicalCounter {
        self.clock.get(replica).copied().unwrap_or(0)
    }

    /// Raise the component for a replica. Lower values are ignored.
    pub fn set(&mut self, replica: &ReplicaId, counter: LogicalCounter) {
        if counter == 0 {
            return;
        }
        let current = self.clock.entry(replica.clone()).or_insert(0);
        if counter > *current {
            *current = counter;
        }
    }

    /// Merge two vector clocks (take maximum of each entry)
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, &counter) in &other.clock {
            self.set(replica, counter);
        }
    }

    /// True when every component of `other` is <= the matching component here
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .clock
            .iter()
            .all(|(replica, &counter)| self.get(replica) >= counter)
    }

    /// Check if this clock happened before another
    /// Returns true if all entries in self <= other and at least one is strictly less
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        other.dominates(self) && self != other
    }

    /// Check if two clocks are concurrent (neither happened before the other)
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Compare two vector clocks; `None` when concurrent
    pub fn partial_cmp(&self, other: &VectorClock) -> Option<Ordering> {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }

    /// Iterate over `(replica, counter)` pairs in replica order
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, LogicalCounter)> {
        self.clock.iter().map(|(replica, &counter)| (replica, counter))
    }

    /// Get all replica IDs in this clock
    pub fn replicas(&self) -> Vec<ReplicaId> {
        self.clock.keys().cloned().collect()
    }

    /// Sum of all components (number of operations reflected)
    pub fn total(&self) -> u64 {
        self.clock.values().fold(0u64, |total, counter| total.saturating_add(*counter))
    }

    /// Check if clock is empty
    pub fn is_empty(&self) -> bool {
        self.clock.is_empty()
    }

    /// Get the number of replicas tracked
    pub fn len(&self) -> usize {
        self.clock.len()
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (replica, counter)) in self.clock.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", replica, counter)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(ReplicaId, LogicalCounter)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (ReplicaId, LogicalCounter)>>(iter: I) -> Self {
        let mut vc = VectorClock::new();
        for (replica, counter) in iter {
            vc.set(&replica, counter);
        }
        vc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(id: &str) -> ReplicaId {
        ReplicaId::from(id)
    }

    #[test]
    fn test_vector_clock_creation() {
        let vc = VectorClock::new();
        assert!(vc.is_empty());
        assert_eq!(vc.len(), 0);
    }

    #[test]
    fn test_increment() {
        let mut vc = VectorClock::new();
        assert_eq!(vc.increment(&r("node1")), 1);
        assert_eq!(vc.increment(&r("node1")), 2);
        assert_eq!(vc.increment(&r("node2")), 1);
        assert_eq!(vc.get(&r("node1")), 2);
    }

    #[test]
    fn test_get_nonexistent() {
        let vc = VectorClock::new();
        assert_eq!(vc.get(&r("unknown")), 0);
    }

    #[test]
    fn test_set_never_decreases() {
        let mut vc = VectorClock::new();
        vc.set(&r("node1"), 5);
        vc.set(&r("node1"), 3);
        assert_eq!(vc.get(&r("node1")), 5);

        vc.set(&r("node2"), 0);
        assert_eq!(vc.len(), 1);
    }

    #[test]
    fn test_merge() {
        let mut vc1: VectorClock = [(r("node1"), 3), (r("node2"), 1)].into_iter().collect();
        let vc2: VectorClock = [(r("node1"), 2), (r("node2"), 4), (r("node3"), 1)]
            .into_iter()
            .collect();

        vc1.merge(&vc2);

        assert_eq!(vc1.get(&r("node1")), 3);
        assert_eq!(vc1.get(&r("node2")), 4);
        assert_eq!(vc1.get(&r("node3")), 1);
    }

    #[test]
    fn test_happened_before() {
        let vc1: VectorClock = [(r("node1"), 1), (r("node2"), 2)].into_iter().collect();
        let vc2: VectorClock = [(r("node1"), 2), (r("node2"), 3)].into_iter().collect();

        assert!(vc1.happened_before(&vc2));
        assert!(!vc2.happened_before(&vc1));
        assert!(!vc1.happened_before(&vc1));
    }

    #[test]
    fn test_concurrent() {
        let vc1: VectorClock = [(r("node1"), 2), (r("node2"), 1)].into_iter().collect();
        let vc2: VectorClock = [(r("node1"), 1), (r("node2"), 2)].into_iter().collect();

        assert!(vc1.is_concurrent(&vc2));
        assert_eq!(vc1.partial_cmp(&vc2), None);
    }

    #[test]
    fn test_partial_cmp_with_missing_components() {
        let empty = VectorClock::new();
        let vc: VectorClock = [(r("node1"), 1)].into_iter().collect();

        assert_eq!(empty.partial_cmp(&vc), Some(Ordering::Less));
        assert_eq!(vc.partial_cmp(&empty), Some(Ordering::Greater));
        assert_eq!(vc.partial_cmp(&vc.clone()), Some(Ordering::Equal));
        assert!(vc.dominates(&empty));
    }

    #[test]
    fn test_display() {
        let vc: VectorClock = [(r("b"), 2), (r("a"), 1)].into_iter().collect();
        assert_eq!(vc.to_string(), "{a: 1, b: 2}");
        assert_eq!(vc.total(), 3);
    }
}
