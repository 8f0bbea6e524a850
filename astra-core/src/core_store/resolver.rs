/*
    resolver.rs - Deterministic merge policy

    Pure functions that fold one operation into one document. No I/O,
    no clocks, no randomness: the same document and operation always
    produce the same result on every replica.

    Every operation is validated against the primitive of its own kind
    before any state is touched, so a rejected operation leaves the
    document exactly as it was. Operations of different kinds on one
    path never reject each other; the document decides which kind shows.
*/

use crate::core_store::crdt::{
    Crdt, LWWOperation, ORSetOperation, SequenceOperation, ValidatedCrdt,
};
use crate::core_store::model::document::{Document, Field, KindStamp};
use crate::core_store::model::operation::{FieldKind, Operation, Payload};
use crate::core_store::model::value::Value;
use crate::core_store::store::errors::{StoreError, StoreResult};

/// Primitive-level operation derived from a replicated operation
enum PrimitiveOp {
    Register(LWWOperation<Value>),
    Set(ORSetOperation<Value>),
    Sequence(SequenceOperation<Value>),
}

fn primitive_op(op: &Operation) -> PrimitiveOp {
    match &op.payload {
        Payload::Set { value, clock } => PrimitiveOp::Register(LWWOperation {
            value: value.clone(),
            clock: *clock,
            writer: op.origin_replica.clone(),
        }),
        Payload::AddElement { element } => PrimitiveOp::Set(ORSetOperation::Add {
            element: element.clone(),
            tag: op.id(),
        }),
        Payload::RemoveElement { element, observed } => PrimitiveOp::Set(ORSetOperation::Remove {
            element: element.clone(),
            observed: observed.clone(),
        }),
        Payload::Insert { position, value } => PrimitiveOp::Sequence(SequenceOperation::Insert {
            position: position.clone(),
            value: value.clone(),
        }),
        Payload::Delete { position } => PrimitiveOp::Sequence(SequenceOperation::Delete {
            position: position.clone(),
        }),
    }
}

fn validate_field(field: &Field, op: &PrimitiveOp) -> StoreResult<()> {
    match (field, op) {
        (Field::Register(reg), PrimitiveOp::Register(op)) => reg.validate(op),
        (Field::Set(set), PrimitiveOp::Set(op)) => set.validate(op),
        (Field::Sequence(seq), PrimitiveOp::Sequence(op)) => seq.validate(op),
        _ => Err(StoreError::Validation("operation does not match field kind".to_string())),
    }
}

fn apply_field(field: &mut Field, op: PrimitiveOp) -> StoreResult<()> {
    match (field, op) {
        (Field::Register(reg), PrimitiveOp::Register(op)) => reg.apply(op),
        (Field::Set(set), PrimitiveOp::Set(op)) => set.apply(op),
        (Field::Sequence(seq), PrimitiveOp::Sequence(op)) => seq.apply(op),
        _ => Err(StoreError::Validation("operation does not match field kind".to_string())),
    }
}

/// Stamp an operation gives the kind it writes
pub fn kind_stamp(op: &Operation) -> KindStamp {
    KindStamp::new(op.dependency_vector.total().saturating_add(1), op.origin_replica.clone())
}

/// Refuse a local write whose kind differs from the field's visible kind
pub fn check_kind(document: &Document, field_path: &str, kind: FieldKind) -> StoreResult<()> {
    match document.field(field_path) {
        Some(field) if field.kind() != kind => Err(StoreError::KindMismatch {
            field: field_path.to_string(),
            expected: field.kind().as_str(),
            actual: kind.as_str(),
        }),
        _ => Ok(()),
    }
}

/// Validate `op` against `document` without changing anything
pub fn validate(document: &Document, op: &Operation) -> StoreResult<()> {
    op.check_well_formed()?;
    let kind = op.payload.kind();
    let primitive = primitive_op(op);
    match document.field_of_kind(&op.field_path, kind) {
        Some(field) => validate_field(field, &primitive),
        None => validate_field(&Field::empty(kind), &primitive),
    }
}

/// Merge `op` into `document` in place
pub fn merge_into(document: &mut Document, op: &Operation) -> StoreResult<()> {
    validate(document, op)?;
    let field = document.field_mut_or_insert(&op.field_path, op.payload.kind(), kind_stamp(op));
    apply_field(field, primitive_op(op))
}

/// Pure variant: return the merged document, leaving the input untouched
pub fn resolve(document: &Document, op: &Operation) -> StoreResult<Document> {
    let mut next = document.clone();
    merge_into(&mut next, op)?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::crdt::{Position, VectorClock};
    use crate::core_store::model::types::{EntityId, OpId, ReplicaId};
    use std::collections::BTreeSet;

    fn op(replica: &str, counter: u64, field: &str, payload: Payload) -> Operation {
        let origin = ReplicaId::from(replica);
        let dependency_vector: VectorClock = [(origin.clone(), counter - 1)].into_iter().collect();
        Operation {
            origin_replica: origin,
            origin_counter: counter,
            entity_id: EntityId::from("task1"),
            field_path: field.to_string(),
            payload,
            dependency_vector,
        }
    }

    #[test]
    fn test_resolve_is_pure() {
        let doc = Document::new();
        let set = op("x", 1, "title", Payload::Set { value: Value::text("a"), clock: 1 });

        let merged = resolve(&doc, &set).unwrap();

        assert!(doc.is_empty());
        assert_eq!(merged.value().register("title"), Some(&Value::text("a")));
    }

    #[test]
    fn test_higher_clock_wins_any_order() {
        let x = op("x", 1, "status", Payload::Set { value: Value::text("open"), clock: 5 });
        let y = op("y", 1, "status", Payload::Set { value: Value::text("done"), clock: 7 });

        let xy = resolve(&resolve(&Document::new(), &x).unwrap(), &y).unwrap();
        let yx = resolve(&resolve(&Document::new(), &y).unwrap(), &x).unwrap();

        assert_eq!(xy, yx);
        assert_eq!(xy.value().register("status"), Some(&Value::text("done")));
    }

    #[test]
    fn test_concurrent_kinds_converge() {
        let set = op("x", 1, "tags", Payload::Set { value: Value::text("urgent"), clock: 1 });
        let add = op("y", 1, "tags", Payload::AddElement { element: Value::text("home") });

        let xy = resolve(&resolve(&Document::new(), &set).unwrap(), &add).unwrap();
        let yx = resolve(&resolve(&Document::new(), &add).unwrap(), &set).unwrap();

        assert_eq!(xy, yx);
        // Equal depth: the higher writer id shows
        assert_eq!(xy.value().elements("tags"), &[Value::text("home")]);
        assert_eq!(xy.value().register("tags"), None);
    }

    #[test]
    fn test_later_kind_replaces_observed_one() {
        let add = op("x", 1, "tags", Payload::AddElement { element: Value::text("home") });
        let mut set = op("y", 1, "tags", Payload::Set { value: Value::text("urgent"), clock: 1 });
        set.dependency_vector.set(&ReplicaId::from("x"), 1);

        let doc = resolve(&resolve(&Document::new(), &add).unwrap(), &set).unwrap();
        assert_eq!(doc.value().register("tags"), Some(&Value::text("urgent")));
    }

    #[test]
    fn test_check_kind_refuses_other_kind() {
        let doc = resolve(
            &Document::new(),
            &op("x", 1, "tags", Payload::AddElement { element: Value::text("urgent") }),
        )
        .unwrap();

        let err = check_kind(&doc, "tags", FieldKind::Register).unwrap_err();
        assert!(matches!(err, StoreError::KindMismatch { .. }));
        assert!(check_kind(&doc, "tags", FieldKind::Set).is_ok());
        assert!(check_kind(&doc, "title", FieldKind::Register).is_ok());
    }

    #[test]
    fn test_invalid_op_does_not_create_field() {
        let mut doc = Document::new();
        let bad = op(
            "x",
            1,
            "tags",
            Payload::RemoveElement { element: Value::text("a"), observed: BTreeSet::new() },
        );

        assert!(merge_into(&mut doc, &bad).is_err());
        assert!(doc.is_empty());
    }

    #[test]
    fn test_sequence_insert_and_delete() {
        let origin = ReplicaId::from("x");
        let position = Position::between(None, None, &origin, 1);
        let insert = op(
            "x",
            1,
            "items",
            Payload::Insert { position: position.clone(), value: Value::text("milk") },
        );
        let delete = op("x", 2, "items", Payload::Delete { position });

        let doc = resolve(&Document::new(), &insert).unwrap();
        assert_eq!(doc.value().elements("items"), &[Value::text("milk")]);

        let doc = resolve(&doc, &delete).unwrap();
        assert!(doc.value().elements("items").is_empty());
    }

    #[test]
    fn test_remove_only_observed_tags() {
        let add = op("x", 1, "tags", Payload::AddElement { element: Value::text("urgent") });
        let remove = op(
            "y",
            1,
            "tags",
            Payload::RemoveElement {
                element: Value::text("urgent"),
                observed: [OpId::new(ReplicaId::from("y"), 9)].into_iter().collect(),
            },
        );

        let doc = resolve(&resolve(&Document::new(), &add).unwrap(), &remove).unwrap();
        assert_eq!(doc.value().elements("tags"), &[Value::text("urgent")]);
    }
}
