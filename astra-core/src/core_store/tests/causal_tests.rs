/*
    Causal delivery tests

    Tests:
    1. Operations wait for cross-replica dependencies
    2. Released operations cascade until a fixpoint
    3. Buffered operations are never visible early
*/

use super::{deliver, mutate, replica, text};
use crate::core_store::model::{EntityId, Mutation, ReplicaId};
use crate::core_store::store::ApplyOutcome;

#[test]
fn test_waits_for_foreign_dependency() {
    let mut x = replica("x");
    let mut y = replica("y");
    let mut z = replica("z");

    let add = mutate(&mut x, "note", "tags", Mutation::AddElement(text("draft")));
    deliver(&mut y, &[add.clone()]);
    let remove = mutate(&mut y, "note", "tags", Mutation::RemoveElement(text("draft")));

    // Z hears about the remove first
    let report = z.apply(remove.clone()).unwrap();
    assert_eq!(report.outcome, ApplyOutcome::Buffered);
    assert!(z.snapshot(&EntityId::from("note")).is_none());
    assert_eq!(z.version_vector().get(&ReplicaId::from("y")), 0);

    let report = z.apply(add).unwrap();
    assert_eq!(report.outcome, ApplyOutcome::Applied);
    assert_eq!(report.applied.len(), 2);
    assert_eq!(report.applied[1], remove);

    let note = z.snapshot(&EntityId::from("note")).unwrap();
    assert!(note.elements("tags").is_empty());
}

#[test]
fn test_chain_released_to_fixpoint() {
    let mut x = replica("x");
    let mut y = replica("y");
    let mut z = replica("z");

    let a = mutate(&mut x, "doc", "title", Mutation::Set(text("a")));
    deliver(&mut y, &[a.clone()]);
    let b = mutate(&mut y, "doc", "title", Mutation::Set(text("b")));
    deliver(&mut x, &[b.clone()]);
    let c = mutate(&mut x, "doc", "title", Mutation::Set(text("c")));

    // Deliver newest first: c needs b, b needs a
    assert_eq!(z.apply(c).unwrap().outcome, ApplyOutcome::Buffered);
    assert_eq!(z.apply(b).unwrap().outcome, ApplyOutcome::Buffered);
    assert_eq!(z.pending_len(), 2);

    let report = z.apply(a).unwrap();
    assert_eq!(report.applied.len(), 3);
    assert_eq!(z.pending_len(), 0);
    assert!(report.changed.contains(&EntityId::from("doc")));

    let doc = z.snapshot(&EntityId::from("doc")).unwrap();
    assert_eq!(doc.register("title"), Some(&text("c")));
}

#[test]
fn test_same_origin_gap_buffers() {
    let mut x = replica("x");
    let mut y = replica("y");
    let ops: Vec<_> = (0..3)
        .map(|i| mutate(&mut x, "doc", "items", Mutation::Insert { index: i, value: text("i") }))
        .collect();

    assert_eq!(y.apply(ops[2].clone()).unwrap().outcome, ApplyOutcome::Buffered);
    assert_eq!(y.apply(ops[1].clone()).unwrap().outcome, ApplyOutcome::Buffered);
    assert_eq!(y.version_vector().get(&ReplicaId::from("x")), 0);

    y.apply(ops[0].clone()).unwrap();
    assert_eq!(y.version_vector().get(&ReplicaId::from("x")), 3);
    assert_eq!(y.snapshot(&EntityId::from("doc")).unwrap().elements("items").len(), 3);
}
