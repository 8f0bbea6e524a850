/*
    sequence.rs - Ordered sequence CRDT with fractional positions

    Each element carries a unique position key drawn from a dense total
    order, so an insert between two neighbours never renumbers anything
    and concurrent inserts at the same spot interleave deterministically.

    A position is a path of levels. Each level is a digit plus the
    (replica, counter) of the operation that created it; comparison is
    lexicographic over levels, so two replicas allocating the same digit
    still get distinct, consistently ordered keys.

    Use cases:
    - Checklist items
    - Ordered note content
    - Conversation history

    Properties:
    - Deletions leave tombstones so late inserts and deletes commute
    - A delete that arrives before its insert still hides the element
*/

use super::traits::{Crdt, ValidatedCrdt};
use crate::core_store::model::types::{LogicalCounter, OpId, ReplicaId};
use crate::core_store::store::errors::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Exclusive upper bound of a level digit
const DIGIT_BASE: u32 = 1 << 16;

/// Largest gap left after an appended digit
const APPEND_STEP: u32 = 32;

/// One level of a position path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionLevel {
    pub digit: u32,
    pub replica: ReplicaId,
    pub counter: LogicalCounter,
}

/// Dense, totally ordered position key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position(pub Vec<PositionLevel>);

impl Position {
    /// Allocate a position strictly between `left` and `right`.
    ///
    /// `None` stands for the start (left) or end (right) of the sequence.
    /// The last level records `(replica, counter)`, the creating operation.
    pub fn between(
        left: Option<&Position>,
        right: Option<&Position>,
        replica: &ReplicaId,
        counter: LogicalCounter,
    ) -> Position {
        let lower: &[PositionLevel] = left.map(|p| p.0.as_slice()).unwrap_or(&[]);
        let upper: &[PositionLevel] = right.map(|p| p.0.as_slice()).unwrap_or(&[]);
        let mut open = right.is_none();
        let mut path = Vec::new();
        let mut depth = 0;

        loop {
            let lo = lower.get(depth).map(|l| l.digit).unwrap_or(0);
            let hi = if open {
                DIGIT_BASE
            } else {
                upper.get(depth).map(|l| l.digit).unwrap_or(0)
            };

            if hi > lo + 1 {
                let gap = (hi - lo) / 2;
                let step = if open { gap.min(APPEND_STEP) } else { gap };
                path.push(PositionLevel {
                    digit: lo + step.max(1),
                    replica: replica.clone(),
                    counter,
                });
                return Position(path);
            }

            // No room at this depth: follow a bound and descend
            let level = match lower.get(depth) {
                Some(level) => level.clone(),
                None => match upper.get(depth) {
                    Some(level) if !open && level.digit == lo => level.clone(),
                    _ => PositionLevel { digit: lo, replica: replica.clone(), counter },
                },
            };
            if !open && upper.get(depth) != Some(&level) {
                open = true;
            }
            path.push(level);
            depth += 1;
        }
    }

    /// The operation that allocated this position
    pub fn creator(&self) -> Option<OpId> {
        self.0.last().map(|l| OpId::new(l.replica.clone(), l.counter))
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SequenceEntry<T> {
    value: Option<T>,
    deleted: bool,
}

/// Ordered sequence CRDT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence<T: Clone> {
    entries: BTreeMap<Position, SequenceEntry<T>>,
}

/// Operations for Sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SequenceOperation<T: Clone> {
    Insert { position: Position, value: T },
    Delete { position: Position },
}

impl<T: Clone> Sequence<T> {
    pub fn new() -> Self {
        Sequence { entries: BTreeMap::new() }
    }

    pub fn insert(&mut self, position: Position, value: T) {
        let entry = self
            .entries
            .entry(position)
            .or_insert(SequenceEntry { value: None, deleted: false });
        if entry.value.is_none() {
            entry.value = Some(value);
        }
    }

    pub fn delete(&mut self, position: Position) {
        let entry = self
            .entries
            .entry(position)
            .or_insert(SequenceEntry { value: None, deleted: false });
        entry.deleted = true;
    }

    /// Visible values in position order
    pub fn to_vec(&self) -> Vec<T> {
        self.visible().map(|(_, value)| value.clone()).collect()
    }

    /// Visible `(position, value)` pairs in order
    pub fn visible(&self) -> impl Iterator<Item = (&Position, &T)> {
        self.entries.iter().filter_map(|(pos, entry)| match (&entry.value, entry.deleted) {
            (Some(value), false) => Some((pos, value)),
            _ => None,
        })
    }

    /// Position of the visible element at `index`
    pub fn position_at(&self, index: usize) -> Option<&Position> {
        self.visible().nth(index).map(|(pos, _)| pos)
    }

    /// Neighbouring positions for an insert at visible `index`.
    /// `index == len()` appends.
    pub fn neighbours(&self, index: usize) -> (Option<&Position>, Option<&Position>) {
        let left = if index == 0 { None } else { self.position_at(index - 1) };
        (left, self.position_at(index))
    }

    pub fn len(&self) -> usize {
        self.visible().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + Sync> Crdt for Sequence<T> {
    type Operation = SequenceOperation<T>;
    type Value = Vec<T>;

    fn apply(&mut self, op: Self::Operation) -> StoreResult<()> {
        match op {
            SequenceOperation::Insert { position, value } => self.insert(position, value),
            SequenceOperation::Delete { position } => self.delete(position),
        }
        Ok(())
    }

    fn value(&self) -> Self::Value {
        self.to_vec()
    }
}

impl<T: Clone + Send + Sync> ValidatedCrdt for Sequence<T> {
    fn validate(&self, op: &Self::Operation) -> StoreResult<()> {
        let position = match op {
            SequenceOperation::Insert { position, .. } => position,
            SequenceOperation::Delete { position } => position,
        };
        if position.0.is_empty() {
            return Err(StoreError::Validation("empty sequence position".to_string()));
        }
        if position.0.iter().any(|level| level.digit >= DIGIT_BASE) {
            return Err(StoreError::Validation("sequence digit out of range".to_string()));
        }
        Ok(())
    }
}

impl<T: Clone> Default for Sequence<T> {
    fn default() -> Self {
        Self::new()
    }
}
