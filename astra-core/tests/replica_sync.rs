/*
    replica_sync.rs - Pairing and sync between replicas over loopback TCP

    Tests:
    1. Edits made before pairing reach the new peer
    2. Concurrent register writes: higher clock wins on both sides
    3. Concurrent add survives a remove that never observed it
    4. Operations are relayed through an intermediate replica
    5. Declined pairing leaves both peer tables empty
    6. A session presenting the wrong key flags the peer
    7. Incompatible protocol versions are refused
*/

mod common;

use astra_core::core_identity::StaticKeypair;
use astra_core::core_router::{Hello, ProtocolVersion, Session, SessionPurpose, TransportError};
use astra_core::core_store::Payload;
use astra_core::{EntityId, Mutation, ReplicaError, Value};
use common::{answer_next_challenge, pair, wait_for, TestReplica};
use tokio::net::TcpStream;

fn set(replica: &TestReplica, entity: &str, field: &str, value: &str) -> u64 {
    let op = replica
        .replica
        .mutate(&EntityId::from(entity), field, Mutation::Set(Value::text(value)))
        .unwrap();
    match op.payload {
        Payload::Set { clock, .. } => clock,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_offline_edits_reach_new_peer() {
    let x = TestReplica::start("x").await;
    let y = TestReplica::start("y").await;
    let note = EntityId::from("shopping");

    x.replica.mutate(&note, "title", Mutation::Set(Value::text("shopping"))).unwrap();
    x.replica
        .mutate(&note, "items", Mutation::Insert { index: 0, value: Value::text("milk") })
        .unwrap();
    assert!(y.replica.read(&note).unwrap().is_none());

    pair(&y, &x).await;
    let mut changes = y.replica.subscribe();
    let report = y.replica.sync_with(x.id()).await.unwrap();

    assert_eq!(report.received, 2);
    assert_eq!(report.applied, 2);
    assert_eq!(report.sent, 0);
    assert_eq!(y.replica.read(&note).unwrap(), x.replica.read(&note).unwrap());
    assert_eq!(y.replica.version_vector().unwrap(), x.replica.version_vector().unwrap());

    let change = changes.recv().await.unwrap();
    assert_eq!(change.entity_id, note);

    let peer = y.replica.peer(x.id()).unwrap();
    assert!(peer.last_synced.is_some());
    assert!(peer.reachable);

    x.stop().await;
    y.stop().await;
}

#[tokio::test]
async fn test_higher_register_clock_wins_after_sync() {
    let x = TestReplica::start("x").await;
    let y = TestReplica::start("y").await;

    for i in 0..4 {
        set(&x, "scratch", "line", &format!("x{}", i));
    }
    for i in 0..6 {
        set(&y, "scratch", "line", &format!("y{}", i));
    }
    assert_eq!(set(&x, "task1", "status", "from-x"), 5);
    assert_eq!(set(&y, "task1", "status", "from-y"), 7);

    pair(&x, &y).await;
    x.replica.sync_with(y.id()).await.unwrap();
    let y_id = y.id().clone();
    let expected = x.replica.version_vector().unwrap();
    wait_for(|| y.replica.version_vector().unwrap() == expected).await;

    for replica in [&x, &y] {
        let task = replica.replica.read(&EntityId::from("task1")).unwrap().unwrap();
        assert_eq!(task.register("status"), Some(&Value::text("from-y")));
    }
    assert!(x.replica.peer(&y_id).unwrap().last_synced.is_some());

    x.stop().await;
    y.stop().await;
}

#[tokio::test]
async fn test_concurrent_add_survives_unobserved_remove() {
    let x = TestReplica::start("x").await;
    let y = TestReplica::start("y").await;
    let task = EntityId::from("task1");
    let urgent = Value::text("urgent");

    x.replica.mutate(&task, "tags", Mutation::AddElement(urgent.clone())).unwrap();
    y.replica.mutate(&task, "tags", Mutation::AddElement(urgent.clone())).unwrap();
    y.replica.mutate(&task, "tags", Mutation::RemoveElement(urgent.clone())).unwrap();
    assert!(y.replica.read(&task).unwrap().map_or(true, |doc| doc.elements("tags").is_empty()));

    pair(&x, &y).await;
    x.replica.sync_with(y.id()).await.unwrap();
    let expected = x.replica.version_vector().unwrap();
    wait_for(|| y.replica.version_vector().unwrap() == expected).await;

    for replica in [&x, &y] {
        let doc = replica.replica.read(&task).unwrap().unwrap();
        assert_eq!(doc.elements("tags"), &[urgent.clone()]);
    }

    x.stop().await;
    y.stop().await;
}

#[tokio::test]
async fn test_operations_relay_through_intermediate_replica() {
    let x = TestReplica::start("x").await;
    let y = TestReplica::start("y").await;
    let z = TestReplica::start("z").await;
    let note = EntityId::from("note");

    pair(&y, &x).await;
    pair(&z, &y).await;

    x.replica.mutate(&note, "title", Mutation::Set(Value::text("from x"))).unwrap();
    y.replica.sync_with(x.id()).await.unwrap();
    let report = z.replica.sync_with(y.id()).await.unwrap();

    assert_eq!(report.received, 1);
    let doc = z.replica.read(&note).unwrap().unwrap();
    assert_eq!(doc.register("title"), Some(&Value::text("from x")));
    assert!(z.replica.peer(x.id()).is_err());

    // Nothing new the second time around
    let report = z.replica.sync_with(y.id()).await.unwrap();
    assert_eq!(report.received, 0);
    assert_eq!(report.sent, 0);

    x.stop().await;
    y.stop().await;
    z.stop().await;
}

#[tokio::test]
async fn test_declined_pairing_trusts_nobody() {
    let x = TestReplica::start("x").await;
    let y = TestReplica::start("y").await;

    let x_answer = answer_next_challenge(&x.replica, true);
    let y_answer = answer_next_challenge(&y.replica, false);

    let err = x.replica.pair_with(y.address, false).await.unwrap_err();
    assert!(matches!(err, ReplicaError::PairingRejected(_)), "{:?}", err);
    assert!(x_answer.await.unwrap().is_some());
    assert!(y_answer.await.unwrap().is_some());

    assert!(x.replica.peers().unwrap().is_empty());
    assert!(y.replica.peers().unwrap().is_empty());
    assert!(matches!(x.replica.sync_with(y.id()).await, Err(ReplicaError::UnknownPeer(_))));

    x.stop().await;
    y.stop().await;
}

#[tokio::test]
async fn test_wrong_key_flags_peer() {
    let x = TestReplica::start("x").await;
    let y = TestReplica::start("y").await;
    pair(&y, &x).await;

    // Someone else claims to be y
    let stream = TcpStream::connect(x.address).await.unwrap();
    let mut impostor = Session::initiate(stream, &StaticKeypair::generate()).await.unwrap();
    impostor
        .exchange_hello(Hello::new(y.id().clone(), "y", SessionPurpose::Sync))
        .await
        .unwrap();
    assert!(impostor.receive().await.is_err());

    let y_id = y.id().clone();
    wait_for(|| x.replica.peer(&y_id).map(|peer| peer.trust_violation).unwrap_or(false)).await;

    // Flagged peers are never synced automatically
    assert!(x.replica.sync_all().await.is_empty());
    assert!(matches!(
        x.replica.sync_with(&y_id).await,
        Err(ReplicaError::TrustViolation(_))
    ));

    // The genuine peer is turned away too until it pairs again
    assert!(y.replica.sync_with(x.id()).await.is_err());

    x.stop().await;
    y.stop().await;
}

#[tokio::test]
async fn test_incompatible_version_is_refused() {
    let x = TestReplica::start("x").await;

    let stream = TcpStream::connect(x.address).await.unwrap();
    let mut session = Session::initiate(stream, &StaticKeypair::generate()).await.unwrap();
    let mut hello = Hello::new("future".into(), "future", SessionPurpose::Pair);
    hello.protocol_version = ProtocolVersion { major: ProtocolVersion::CURRENT.major + 1, minor: 0 };

    let err = session.exchange_hello(hello).await.unwrap_err();
    assert!(matches!(err, TransportError::VersionMismatch { .. }));
    assert!(x.replica.pairing_candidates().is_empty());

    x.stop().await;
}
