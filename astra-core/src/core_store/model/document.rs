/*
    document.rs - Replicated document aggregate

    A document (one note, one task) is a map from field path to a CRDT
    primitive:
    - registers for single-value fields (title, status)
    - observed-remove sets for tags/collaborators
    - sequences for ordered content

    Replicas may write different kinds to the same path concurrently.
    Each kind keeps its own primitive, stamped with the highest
    (causal depth, writer) of the operations applied to it; the field
    shows the kind with the highest stamp. Stamps only grow and are
    merged with max, so every replica picks the same visible kind.
*/

use super::operation::FieldKind;
use super::types::ReplicaId;
use super::value::Value;
use crate::core_store::crdt::{Crdt, LWWRegister, ORSet, Sequence};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One CRDT-backed field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    Register(LWWRegister<Value>),
    Set(ORSet<Value>),
    Sequence(Sequence<Value>),
}

impl Field {
    pub fn empty(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Register => Field::Register(LWWRegister::new()),
            FieldKind::Set => Field::Set(ORSet::new()),
            FieldKind::Sequence => Field::Sequence(Sequence::new()),
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Register(_) => FieldKind::Register,
            Field::Set(_) => FieldKind::Set,
            Field::Sequence(_) => FieldKind::Sequence,
        }
    }

    pub fn value(&self) -> FieldValue {
        match self {
            Field::Register(reg) => FieldValue::Register(reg.value()),
            Field::Set(set) => FieldValue::Set(set.value()),
            Field::Sequence(seq) => FieldValue::Sequence(seq.value()),
        }
    }
}

/// Materialized value of a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Register(Option<Value>),
    Set(Vec<Value>),
    Sequence(Vec<Value>),
}

impl FieldValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Register(value) => {
                value.as_ref().map(Value::to_json).unwrap_or(serde_json::Value::Null)
            }
            FieldValue::Set(items) | FieldValue::Sequence(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }
}

/// Materialized value of a whole document, as handed to readers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentValue {
    pub fields: BTreeMap<String, FieldValue>,
}

impl DocumentValue {
    pub fn get(&self, field_path: &str) -> Option<&FieldValue> {
        self.fields.get(field_path)
    }

    /// Register value of a field, if the field is a register and set
    pub fn register(&self, field_path: &str) -> Option<&Value> {
        match self.fields.get(field_path) {
            Some(FieldValue::Register(value)) => value.as_ref(),
            _ => None,
        }
    }

    /// Elements of a set or sequence field (empty when absent)
    pub fn elements(&self, field_path: &str) -> &[Value] {
        match self.fields.get(field_path) {
            Some(FieldValue::Set(items)) | Some(FieldValue::Sequence(items)) => items,
            _ => &[],
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .fields
            .iter()
            .map(|(path, value)| (path.clone(), value.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

/// Orders writes of different kinds to the same field path.
///
/// `depth` is one above the total of the writing operation's dependency
/// vector, so an operation always outranks everything it had observed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindStamp {
    pub depth: u64,
    pub writer: ReplicaId,
}

impl KindStamp {
    pub fn new(depth: u64, writer: ReplicaId) -> Self {
        KindStamp { depth, writer }
    }
}

/// Every kind ever written to one field path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSlot {
    states: BTreeMap<FieldKind, (KindStamp, Field)>,
}

impl FieldSlot {
    /// Primitive of the kind with the highest stamp
    pub fn visible(&self) -> Option<&Field> {
        self.states.values().max_by(|a, b| a.0.cmp(&b.0)).map(|(_, field)| field)
    }

    pub fn get(&self, kind: FieldKind) -> Option<&Field> {
        self.states.get(&kind).map(|(_, field)| field)
    }

    /// Primitive for `kind`, created when absent; its stamp is raised to `stamp`
    fn get_mut_or_insert(&mut self, kind: FieldKind, stamp: KindStamp) -> &mut Field {
        let (current, field) = self
            .states
            .entry(kind)
            .or_insert_with(|| (stamp.clone(), Field::empty(kind)));
        if stamp > *current {
            *current = stamp;
        }
        field
    }

    fn fields(&self) -> impl Iterator<Item = &Field> {
        self.states.values().map(|(_, field)| field)
    }
}

/// Replicated document state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<String, FieldSlot>,
}

impl Document {
    pub fn new() -> Self {
        Document { fields: BTreeMap::new() }
    }

    /// Visible primitive of a field
    pub fn field(&self, field_path: &str) -> Option<&Field> {
        self.fields.get(field_path).and_then(FieldSlot::visible)
    }

    /// Primitive of one kind, whether visible or not
    pub fn field_of_kind(&self, field_path: &str, kind: FieldKind) -> Option<&Field> {
        self.fields.get(field_path).and_then(|slot| slot.get(kind))
    }

    /// Primitive of `kind` for `field_path`, created when absent and
    /// stamped with at least `stamp`
    pub fn field_mut_or_insert(
        &mut self,
        field_path: &str,
        kind: FieldKind,
        stamp: KindStamp,
    ) -> &mut Field {
        self.fields
            .entry(field_path.to_string())
            .or_default()
            .get_mut_or_insert(kind, stamp)
    }

    /// Highest register clock held by any field of this document
    pub fn max_register_clock(&self) -> u64 {
        self.fields
            .values()
            .flat_map(FieldSlot::fields)
            .filter_map(|field| match field {
                Field::Register(reg) => Some(reg.clock()),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn value(&self) -> DocumentValue {
        DocumentValue {
            fields: self
                .fields
                .iter()
                .filter_map(|(path, slot)| slot.visible().map(|field| (path.clone(), field.value())))
                .collect(),
        }
    }
}
