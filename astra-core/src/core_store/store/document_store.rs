/*
    document_store.rs - CRDT document store with causal delivery

    Holds the applied state of every document together with the
    version vector describing it and a pending buffer for operations
    that arrived before their dependencies.

    apply(op):
    - Duplicate: already reflected in the version vector, or already buffered
    - Buffered: a dependency or an earlier operation from the same origin is missing
    - Applied: merged through the resolver, version vector advanced,
      then the buffer is rescanned until nothing more is ready

    A remote operation that fails validation against the current
    document is applied as a no-op so its origin's sequence keeps moving.
    Local writes must match the kind a field currently shows; remote
    writes of another kind are kept and ordered by the document.
*/

use crate::core_store::crdt::{Position, VectorClock};
use crate::core_store::model::document::{Document, DocumentValue, Field};
use crate::core_store::model::operation::{Mutation, Operation, Payload};
use crate::core_store::model::types::{EntityId, OpId, ReplicaId};
use crate::core_store::resolver;
use crate::core_store::store::errors::{StoreError, StoreResult};
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Result classification of a single `apply`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Buffered,
    Duplicate,
}

/// Everything an `apply` call changed
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub outcome: ApplyOutcome,

    /// Operations applied by this call in apply order, including
    /// buffered operations it released
    pub applied: Vec<Operation>,

    /// Entities whose materialized value changed
    pub changed: BTreeSet<EntityId>,

    /// Applied operations that failed validation and became no-ops
    pub rejected: usize,
}

impl ApplyReport {
    fn new(outcome: ApplyOutcome) -> Self {
        ApplyReport { outcome, applied: Vec::new(), changed: BTreeSet::new(), rejected: 0 }
    }
}

/// Serializable replica state; this is what a checkpoint stores
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    /// Applied documents by entity
    pub documents: BTreeMap<EntityId, Document>,

    /// Operations reflected in `documents`
    pub version_vector: VectorClock,

    /// Operations waiting for their dependencies, in arrival order
    pub pending: Vec<Operation>,

    /// Applied operations from other origins, kept for relaying to peers
    pub relay_index: BTreeMap<OpId, Operation>,

    /// Highest register clock applied so far (Lamport clock)
    pub register_clock: u64,
}

/// In-memory document store for one replica
#[derive(Debug, Clone)]
pub struct DocumentStore {
    local: ReplicaId,
    state: StoreState,
}

impl DocumentStore {
    pub fn new(local: ReplicaId) -> Self {
        DocumentStore { local, state: StoreState::default() }
    }

    /// Rebuild a store from checkpointed state
    pub fn from_state(local: ReplicaId, state: StoreState) -> Self {
        DocumentStore { local, state }
    }

    pub fn local_replica(&self) -> &ReplicaId {
        &self.local
    }

    pub fn state(&self) -> &StoreState {
        &self.state
    }

    pub fn version_vector(&self) -> &VectorClock {
        &self.state.version_vector
    }

    pub fn pending_len(&self) -> usize {
        self.state.pending.len()
    }

    pub fn document(&self, entity_id: &EntityId) -> Option<&Document> {
        self.state.documents.get(entity_id)
    }

    /// Materialized value of a document
    pub fn snapshot(&self, entity_id: &EntityId) -> Option<DocumentValue> {
        self.state.documents.get(entity_id).map(Document::value)
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.state.documents.keys().cloned().collect()
    }

    /// Applied operations from other origins that `vector` does not cover
    pub fn relayed_since<'a>(
        &'a self,
        vector: &'a VectorClock,
    ) -> impl Iterator<Item = &'a Operation> + 'a {
        self.state
            .relay_index
            .values()
            .filter(move |op| op.origin_counter > vector.get(&op.origin_replica))
    }

    /// True when `op` is already applied or waiting in the buffer
    pub fn is_duplicate(&self, op: &Operation) -> bool {
        if op.origin_counter <= self.state.version_vector.get(&op.origin_replica) {
            return true;
        }
        let id = op.id();
        self.state.pending.iter().any(|pending| pending.id() == id)
    }

    fn is_ready(&self, op: &Operation) -> bool {
        let vv = &self.state.version_vector;
        op.origin_counter == vv.get(&op.origin_replica) + 1 && vv.dominates(&op.dependency_vector)
    }

    /// Apply an operation from any origin
    pub fn apply(&mut self, op: Operation) -> StoreResult<ApplyReport> {
        op.check_well_formed()?;

        if self.is_duplicate(&op) {
            debug!(op = %op, "duplicate operation discarded");
            metrics::record_apply_outcome(ApplyOutcome::Duplicate);
            return Ok(ApplyReport::new(ApplyOutcome::Duplicate));
        }

        if !self.is_ready(&op) {
            debug!(op = %op, vector = %self.state.version_vector, "operation buffered");
            metrics::record_apply_outcome(ApplyOutcome::Buffered);
            self.state.pending.push(op);
            return Ok(ApplyReport::new(ApplyOutcome::Buffered));
        }

        let mut report = ApplyReport::new(ApplyOutcome::Applied);
        self.apply_ready(op, &mut report);
        self.drain_pending(&mut report);
        Ok(report)
    }

    fn apply_ready(&mut self, op: Operation, report: &mut ApplyReport) {
        let mut document = self.state.documents.remove(&op.entity_id).unwrap_or_default();
        let before = document.value();

        match resolver::merge_into(&mut document, &op) {
            Ok(()) => {
                if document.value() != before {
                    report.changed.insert(op.entity_id.clone());
                }
                if let Payload::Set { clock, .. } = &op.payload {
                    self.state.register_clock = self.state.register_clock.max(*clock);
                }
            }
            Err(e) => {
                warn!(op = %op, error = %e, "operation failed validation, applied as no-op");
                report.rejected += 1;
            }
        }
        if !document.is_empty() {
            self.state.documents.insert(op.entity_id.clone(), document);
        }

        self.state.version_vector.set(&op.origin_replica, op.origin_counter);
        if op.origin_replica != self.local {
            self.state.relay_index.insert(op.id(), op.clone());
        }

        debug!(op = %op, "operation applied");
        metrics::record_apply_outcome(ApplyOutcome::Applied);
        report.applied.push(op);
    }

    /// Apply buffered operations until none is ready
    fn drain_pending(&mut self, report: &mut ApplyReport) {
        while let Some(index) = self.state.pending.iter().position(|op| self.is_ready(op)) {
            let op = self.state.pending.remove(index);
            debug!(op = %op, "releasing buffered operation");
            self.apply_ready(op, report);
        }
    }

    /// Turn a local mutation into the operation that would express it.
    ///
    /// Nothing is changed: the caller persists the operation first and
    /// then hands it to `apply`.
    pub fn prepare_local(
        &self,
        entity_id: &EntityId,
        field_path: &str,
        mutation: Mutation,
    ) -> StoreResult<Operation> {
        let counter = self.state.version_vector.get(&self.local) + 1;
        let empty = Document::new();
        let document = self.state.documents.get(entity_id).unwrap_or(&empty);
        resolver::check_kind(document, field_path, mutation.kind())?;

        let payload = match mutation {
            Mutation::Set(value) => {
                let clock = self.state.register_clock.checked_add(1).ok_or_else(|| {
                    StoreError::Validation("register clock exhausted".to_string())
                })?;
                Payload::Set { value, clock }
            }
            Mutation::AddElement(element) => Payload::AddElement { element },
            Mutation::RemoveElement(element) => {
                let observed = match document.field(field_path) {
                    Some(Field::Set(set)) => set.tags(&element),
                    _ => BTreeSet::new(),
                };
                if observed.is_empty() {
                    return Err(StoreError::NotFound(format!(
                        "element {} in {}.{}",
                        element, entity_id, field_path
                    )));
                }
                Payload::RemoveElement { element, observed }
            }
            Mutation::Insert { index, value } => {
                let position = match document.field(field_path) {
                    Some(Field::Sequence(seq)) => {
                        if index > seq.len() {
                            return Err(StoreError::Validation(format!(
                                "insert index {} beyond length {}",
                                index,
                                seq.len()
                            )));
                        }
                        let (left, right) = seq.neighbours(index);
                        Position::between(left, right, &self.local, counter)
                    }
                    _ if index > 0 => {
                        return Err(StoreError::Validation(format!(
                            "insert index {} into empty sequence",
                            index
                        )))
                    }
                    _ => Position::between(None, None, &self.local, counter),
                };
                Payload::Insert { position, value }
            }
            Mutation::Delete { index } => {
                let position = match document.field(field_path) {
                    Some(Field::Sequence(seq)) => seq.position_at(index).cloned(),
                    _ => None,
                };
                let position = position.ok_or_else(|| {
                    StoreError::NotFound(format!("index {} in {}.{}", index, entity_id, field_path))
                })?;
                Payload::Delete { position }
            }
        };

        let op = Operation {
            origin_replica: self.local.clone(),
            origin_counter: counter,
            entity_id: entity_id.clone(),
            field_path: field_path.to_string(),
            payload,
            dependency_vector: self.state.version_vector.clone(),
        };
        resolver::validate(document, &op)?;
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::crdt::lww_register::MAX_CLOCK;
    use crate::core_store::model::value::Value;

    fn local_set(store: &mut DocumentStore, entity: &str, field: &str, value: &str) -> Operation {
        let op = store
            .prepare_local(&EntityId::from(entity), field, Mutation::Set(Value::text(value)))
            .unwrap();
        store.apply(op.clone()).unwrap();
        op
    }

    #[test]
    fn test_local_mutation_applies() {
        let mut store = DocumentStore::new(ReplicaId::from("x"));
        let op = local_set(&mut store, "note", "title", "shopping");

        assert_eq!(op.origin_counter, 1);
        assert_eq!(store.version_vector().get(&ReplicaId::from("x")), 1);
        let value = store.snapshot(&EntityId::from("note")).unwrap();
        assert_eq!(value.register("title"), Some(&Value::text("shopping")));
        // Local operations are not relayed from the index
        assert!(store.state().relay_index.is_empty());
    }

    #[test]
    fn test_prepare_local_does_not_mutate() {
        let store = DocumentStore::new(ReplicaId::from("x"));
        let op = store
            .prepare_local(&EntityId::from("note"), "title", Mutation::Set(Value::text("a")))
            .unwrap();

        assert_eq!(op.dependency_vector, VectorClock::new());
        assert!(store.snapshot(&EntityId::from("note")).is_none());
        assert!(store.version_vector().is_empty());
    }

    #[test]
    fn test_register_clock_is_lamport() {
        let mut x = DocumentStore::new(ReplicaId::from("x"));
        let mut y = DocumentStore::new(ReplicaId::from("y"));

        let first = local_set(&mut x, "task", "status", "open");
        local_set(&mut x, "task", "status", "started");
        let third = local_set(&mut x, "task", "status", "blocked");

        y.apply(first).unwrap();
        let reply = y
            .prepare_local(&EntityId::from("task"), "status", Mutation::Set(Value::text("done")))
            .unwrap();

        match (&third.payload, &reply.payload) {
            (Payload::Set { clock: x_clock, .. }, Payload::Set { clock: y_clock, .. }) => {
                assert_eq!(*x_clock, 3);
                assert_eq!(*y_clock, 2);
            }
            _ => panic!("expected register writes"),
        }
    }

    #[test]
    fn test_duplicate_detection() {
        let mut x = DocumentStore::new(ReplicaId::from("x"));
        let mut y = DocumentStore::new(ReplicaId::from("y"));
        let op = local_set(&mut x, "note", "title", "a");

        assert_eq!(y.apply(op.clone()).unwrap().outcome, ApplyOutcome::Applied);
        assert_eq!(y.apply(op).unwrap().outcome, ApplyOutcome::Duplicate);
    }

    #[test]
    fn test_buffer_until_predecessor_arrives() {
        let mut x = DocumentStore::new(ReplicaId::from("x"));
        let mut y = DocumentStore::new(ReplicaId::from("y"));
        let first = local_set(&mut x, "note", "title", "a");
        let second = local_set(&mut x, "note", "title", "b");

        let report = y.apply(second.clone()).unwrap();
        assert_eq!(report.outcome, ApplyOutcome::Buffered);
        assert_eq!(y.pending_len(), 1);
        assert!(y.snapshot(&EntityId::from("note")).is_none());

        // Same op again while buffered is a duplicate
        assert_eq!(y.apply(second).unwrap().outcome, ApplyOutcome::Duplicate);

        let report = y.apply(first).unwrap();
        assert_eq!(report.outcome, ApplyOutcome::Applied);
        assert_eq!(report.applied.len(), 2);
        assert_eq!(y.pending_len(), 0);
        assert_eq!(
            y.snapshot(&EntityId::from("note")).unwrap().register("title"),
            Some(&Value::text("b"))
        );
    }

    #[test]
    fn test_concurrent_kinds_on_one_field_converge() {
        let mut x = DocumentStore::new(ReplicaId::from("x"));
        let mut y = DocumentStore::new(ReplicaId::from("y"));
        let set = local_set(&mut x, "task1", "tags", "urgent");
        let add = y
            .prepare_local(&EntityId::from("task1"), "tags", Mutation::AddElement(Value::text("home")))
            .unwrap();
        y.apply(add.clone()).unwrap();

        let report = x.apply(add).unwrap();
        assert_eq!(report.rejected, 0);
        assert_eq!(y.apply(set).unwrap().rejected, 0);

        assert_eq!(x.version_vector(), y.version_vector());
        assert_eq!(x.document(&EntityId::from("task1")), y.document(&EntityId::from("task1")));
        assert_eq!(
            x.snapshot(&EntityId::from("task1")).unwrap().elements("tags"),
            &[Value::text("home")]
        );
    }

    #[test]
    fn test_remote_invalid_op_is_noop_but_advances() {
        let mut x = DocumentStore::new(ReplicaId::from("x"));
        let mut y = DocumentStore::new(ReplicaId::from("y"));
        local_set(&mut y, "note", "title", "kept");

        let mut bad = x
            .prepare_local(&EntityId::from("note"), "title", Mutation::Set(Value::text("huge")))
            .unwrap();
        bad.payload = Payload::Set { value: Value::text("huge"), clock: u64::MAX };

        let before = y.snapshot(&EntityId::from("note"));
        let report = y.apply(bad).unwrap();

        assert_eq!(report.outcome, ApplyOutcome::Applied);
        assert_eq!(report.rejected, 1);
        assert!(report.changed.is_empty());
        assert_eq!(y.snapshot(&EntityId::from("note")), before);
        assert_eq!(y.version_vector().get(&ReplicaId::from("x")), 1);
        assert_eq!(y.state().register_clock, 1);

        // Local writes keep working after the rejected clock
        let next = local_set(&mut y, "note", "title", "still fine");
        assert!(matches!(next.payload, Payload::Set { clock: 2, .. }));
    }

    #[test]
    fn test_local_kind_mismatch_rejected() {
        let mut store = DocumentStore::new(ReplicaId::from("x"));
        local_set(&mut store, "note", "title", "a");

        let err = store
            .prepare_local(&EntityId::from("note"), "title", Mutation::AddElement(Value::text("b")))
            .unwrap_err();
        assert!(matches!(err, StoreError::KindMismatch { .. }));
    }

    #[test]
    fn test_exhausted_register_clock_is_an_error() {
        for register_clock in [u64::MAX, MAX_CLOCK] {
            let state = StoreState { register_clock, ..StoreState::default() };
            let store = DocumentStore::from_state(ReplicaId::from("x"), state);

            let err = store
                .prepare_local(&EntityId::from("note"), "title", Mutation::Set(Value::text("a")))
                .unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)));
        }
    }

    #[test]
    fn test_remove_requires_observed_element() {
        let store = DocumentStore::new(ReplicaId::from("x"));
        let err = store
            .prepare_local(&EntityId::from("note"), "tags", Mutation::RemoveElement(Value::text("a")))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_sequence_mutations() {
        let mut store = DocumentStore::new(ReplicaId::from("x"));
        let entity = EntityId::from("list");
        for (index, item) in [(0, "eggs"), (0, "milk"), (2, "bread")] {
            let op = store
                .prepare_local(&entity, "items", Mutation::Insert { index, value: Value::text(item) })
                .unwrap();
            store.apply(op).unwrap();
        }
        let op = store.prepare_local(&entity, "items", Mutation::Delete { index: 1 }).unwrap();
        store.apply(op).unwrap();

        let value = store.snapshot(&entity).unwrap();
        assert_eq!(value.elements("items"), &[Value::text("milk"), Value::text("bread")]);

        assert!(store
            .prepare_local(&entity, "items", Mutation::Insert { index: 5, value: Value::Null })
            .is_err());
    }

    #[test]
    fn test_relayed_since_filters_by_vector() {
        let mut x = DocumentStore::new(ReplicaId::from("x"));
        let mut y = DocumentStore::new(ReplicaId::from("y"));
        let a = local_set(&mut x, "note", "title", "a");
        let b = local_set(&mut x, "note", "title", "b");
        y.apply(a).unwrap();
        y.apply(b.clone()).unwrap();

        let empty = VectorClock::new();
        assert_eq!(y.relayed_since(&empty).count(), 2);

        let seen_one: VectorClock = [(ReplicaId::from("x"), 1)].into_iter().collect();
        let relayed: Vec<_> = y.relayed_since(&seen_one).collect();
        assert_eq!(relayed, vec![&b]);
    }

    #[test]
    fn test_malformed_operation_rejected() {
        let mut x = DocumentStore::new(ReplicaId::from("x"));
        let mut op = local_set(&mut x, "note", "title", "a");
        op.origin_counter = 0;

        let mut y = DocumentStore::new(ReplicaId::from("y"));
        assert!(y.apply(op).is_err());
        assert_eq!(y.pending_len(), 0);
    }
}
