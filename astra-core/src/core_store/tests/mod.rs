/*
    Integration tests for core_store subsystem

    Test suite covering:
    - Convergence of replicas that saw the same operations in any order
    - Idempotent and commutative apply
    - Causal buffering and release
    - Recovery from checkpoint plus operation log tail
*/

pub mod causal_tests;

use crate::core_store::model::{EntityId, Mutation, Operation, ReplicaId, Value};
use crate::core_store::store::DocumentStore;

pub(crate) fn replica(id: &str) -> DocumentStore {
    DocumentStore::new(ReplicaId::from(id))
}

/// Perform a local mutation and return the operation it produced
pub(crate) fn mutate(
    store: &mut DocumentStore,
    entity: &str,
    field: &str,
    mutation: Mutation,
) -> Operation {
    let op = store
        .prepare_local(&EntityId::from(entity), field, mutation)
        .expect("local mutation should validate");
    store.apply(op.clone()).expect("local operation should apply");
    op
}

pub(crate) fn deliver(store: &mut DocumentStore, ops: &[Operation]) {
    for op in ops {
        store.apply(op.clone()).expect("remote operation should apply");
    }
}

pub(crate) fn text(s: &str) -> Value {
    Value::text(s)
}

/// Three replicas editing two documents with partial exchange in between.
/// Returns every operation produced, in creation order.
pub(crate) fn three_replica_workload() -> Vec<Operation> {
    let mut x = replica("x");
    let mut y = replica("y");
    let mut z = replica("z");
    let mut all = Vec::new();

    let x1 = vec![
        mutate(&mut x, "note", "title", Mutation::Set(text("shopping"))),
        mutate(&mut x, "note", "tags", Mutation::AddElement(text("home"))),
        mutate(&mut x, "note", "items", Mutation::Insert { index: 0, value: text("milk") }),
    ];
    let y1 = vec![
        mutate(&mut y, "note", "title", Mutation::Set(text("groceries"))),
        mutate(&mut y, "note", "tags", Mutation::AddElement(text("urgent"))),
        mutate(&mut y, "note", "items", Mutation::Insert { index: 0, value: text("eggs") }),
    ];
    deliver(&mut y, &x1);
    let y2 = vec![
        mutate(&mut y, "note", "tags", Mutation::RemoveElement(text("home"))),
        mutate(&mut y, "note", "items", Mutation::Insert { index: 1, value: text("bread") }),
        mutate(&mut y, "task1", "status", Mutation::Set(text("open"))),
    ];
    let z1 = vec![
        mutate(&mut z, "note", "tags", Mutation::AddElement(text("home"))),
        mutate(&mut z, "task1", "status", Mutation::Set(text("done"))),
    ];
    deliver(&mut x, &y1);
    deliver(&mut x, &y2);
    let x2 = vec![mutate(&mut x, "note", "items", Mutation::Delete { index: 0 })];

    all.extend(x1);
    all.extend(y1);
    all.extend(y2);
    all.extend(z1);
    all.extend(x2);
    all
}
