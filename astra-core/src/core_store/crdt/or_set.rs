/*
    or_set.rs - Observed-Remove Set CRDT

    A set that supports add and remove operations.
    Every add is tagged with the ID of the operation that produced it, so
    concurrent adds of the same element stay distinguishable.
    A remove only suppresses the add tags its author had observed; an add
    the remover never saw survives. An element is in the set while it has
    at least one live tag.

    Use cases:
    - Note tags
    - Task collaborators
    - Any membership collection
*/

use super::traits::{Crdt, ValidatedCrdt};
use crate::core_store::model::types::OpId;
use crate::core_store::store::errors::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Observed-Remove Set CRDT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ORSet<T: Clone + Ord> {
    /// Map from element to its live add tags
    /// An element exists if it has at least one tag
    elements: BTreeMap<T, BTreeSet<OpId>>,

    /// Tombstones: removed (element, tag) pairs.
    /// Kept so a remove that arrives before its add still wins.
    tombstones: BTreeSet<(T, OpId)>,
}

/// Operations for OR-Set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ORSetOperation<T: Clone> {
    /// Add an element with a unique tag
    Add { element: T, tag: OpId },
    /// Remove the observed tags of an element
    Remove { element: T, observed: BTreeSet<OpId> },
}

impl<T: Clone + Ord> ORSet<T> {
    /// Create a new empty OR-Set
    pub fn new() -> Self {
        ORSet { elements: BTreeMap::new(), tombstones: BTreeSet::new() }
    }

    /// Add an element under the given tag unless that tag was already removed
    pub fn add(&mut self, element: T, tag: OpId) {
        if self.tombstones.contains(&(element.clone(), tag.clone())) {
            return;
        }
        self.elements.entry(element).or_default().insert(tag);
    }

    /// Remove the given tags of an element, recording tombstones
    pub fn remove(&mut self, element: &T, observed: &BTreeSet<OpId>) {
        for tag in observed {
            self.tombstones.insert((element.clone(), tag.clone()));
        }
        if let Some(tags) = self.elements.get_mut(element) {
            tags.retain(|tag| !observed.contains(tag));
            if tags.is_empty() {
                self.elements.remove(element);
            }
        }
    }

    /// Check if an element is in the set
    pub fn contains(&self, element: &T) -> bool {
        self.elements.contains_key(element)
    }

    /// Get all elements in the set, in element order
    pub fn elements(&self) -> Vec<T> {
        self.elements.keys().cloned().collect()
    }

    /// Get the number of elements
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Live tags for an element; this is what a local remove observes
    pub fn tags(&self, element: &T) -> BTreeSet<OpId> {
        self.elements.get(element).cloned().unwrap_or_default()
    }
}

impl<T: Clone + Ord + Send + Sync> Crdt for ORSet<T> {
    type Operation = ORSetOperation<T>;
    type Value = Vec<T>;

    fn apply(&mut self, op: Self::Operation) -> StoreResult<()> {
        match op {
            ORSetOperation::Add { element, tag } => self.add(element, tag),
            ORSetOperation::Remove { element, observed } => self.remove(&element, &observed),
        }
        Ok(())
    }

    fn value(&self) -> Self::Value {
        self.elements()
    }
}

impl<T: Clone + Ord + Send + Sync> ValidatedCrdt for ORSet<T> {
    fn validate(&self, op: &Self::Operation) -> StoreResult<()> {
        match op {
            ORSetOperation::Remove { observed, .. } if observed.is_empty() => Err(
                StoreError::Validation("remove must name at least one observed tag".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

impl<T: Clone + Ord> Default for ORSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::model::types::ReplicaId;

    fn tag(replica: &str, counter: u64) -> OpId {
        OpId::new(ReplicaId::from(replica), counter)
    }

    #[test]
    fn test_or_set_creation() {
        let set: ORSet<String> = ORSet::new();
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_or_set_add_remove() {
        let mut set: ORSet<&str> = ORSet::new();
        set.add("hello", tag("a", 1));
        assert!(set.contains(&"hello"));

        let observed = set.tags(&"hello");
        set.remove(&"hello", &observed);
        assert!(!set.contains(&"hello"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_concurrent_add_survives_remove() {
        let mut set: ORSet<&str> = ORSet::new();
        set.add("urgent", tag("x", 1));

        // Remover only saw a different, older tag
        let observed: BTreeSet<OpId> = [tag("y", 1)].into_iter().collect();
        set.remove(&"urgent", &observed);

        assert!(set.contains(&"urgent"));
    }

    #[test]
    fn test_remove_before_add_wins() {
        let mut set: ORSet<&str> = ORSet::new();
        let observed: BTreeSet<OpId> = [tag("x", 1)].into_iter().collect();

        set.remove(&"urgent", &observed);
        set.add("urgent", tag("x", 1));

        assert!(!set.contains(&"urgent"));
    }

    #[test]
    fn test_concurrent_add_survives_remove_any_order() {
        let add_one = ORSetOperation::Add { element: "one", tag: tag("a", 1) };
        let remove_one =
            ORSetOperation::Remove { element: "one", observed: [tag("a", 1)].into_iter().collect() };
        let re_add = ORSetOperation::Add { element: "one", tag: tag("b", 1) };

        let mut forward: ORSet<&str> = ORSet::new();
        for op in [add_one.clone(), remove_one.clone(), re_add.clone()] {
            forward.apply(op).unwrap();
        }
        let mut backward: ORSet<&str> = ORSet::new();
        for op in [add_one, re_add, remove_one] {
            backward.apply(op).unwrap();
        }

        assert_eq!(forward, backward);
        assert_eq!(forward.tags(&"one"), [tag("b", 1)].into_iter().collect());
    }

    #[test]
    fn test_validate_rejects_empty_remove() {
        let set: ORSet<&str> = ORSet::new();
        let op = ORSetOperation::Remove { element: "x", observed: BTreeSet::new() };
        assert!(matches!(set.validate(&op), Err(StoreError::Validation(_))));
    }
}
