//! Shared helpers for replica integration tests

#![allow(dead_code)]

use astra_core::config::Config;
use astra_core::core_pairing::{PairingEvent, ShortCode};
use astra_core::{ReplicaContext, ReplicaCoordinator, ReplicaId};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Loopback-only config: no discovery, no background syncs, short retries
pub fn test_config(dir: &Path, name: &str) -> Config {
    let mut config = Config::default();
    config.replica.display_name = name.to_string();
    config.replica.data_dir = dir.to_path_buf();
    config.replica.listen_address = SocketAddr::from(([127, 0, 0, 1], 0));
    config.discovery.enabled = false;
    config.sync.auto_sync = false;
    config.sync.initial_backoff = Duration::from_millis(10);
    config.sync.retry_ceiling = Duration::from_millis(50);
    config.sync.session_timeout = Duration::from_secs(10);
    config.pairing.confirmation_timeout = Duration::from_secs(5);
    config
}

pub fn open(dir: &Path, name: &str) -> ReplicaCoordinator {
    let context = ReplicaContext::load(test_config(dir, name)).unwrap();
    ReplicaCoordinator::open(context).unwrap()
}

pub struct TestReplica {
    pub replica: ReplicaCoordinator,
    pub address: SocketAddr,
    pub dir: TempDir,
}

impl TestReplica {
    pub async fn start(name: &str) -> Self {
        Self::start_in(TempDir::new().unwrap(), name).await
    }

    pub async fn start_in(dir: TempDir, name: &str) -> Self {
        let replica = open(dir.path(), name);
        let address = replica.start().await.unwrap();
        TestReplica { replica, address, dir }
    }

    pub fn id(&self) -> &ReplicaId {
        self.replica.replica_id()
    }

    /// Shut down and hand back the data directory
    pub async fn stop(self) -> TempDir {
        self.replica.shutdown().await;
        self.dir
    }
}

/// Answer the next confirmation request with `accept`; yields the code shown
pub fn answer_next_challenge(replica: &ReplicaCoordinator, accept: bool) -> JoinHandle<Option<ShortCode>> {
    let mut events = replica.pairing_events();
    let replica = replica.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let PairingEvent::ConfirmationRequired { replica_id, code, .. } = event {
                // The peer may have given up already
                let _ = replica.confirm_pairing(&replica_id, accept);
                return Some(code);
            }
        }
        None
    })
}

/// `requester` dials `responder`; both users accept the same code
pub async fn pair(requester: &TestReplica, responder: &TestReplica) {
    let requester_answer = answer_next_challenge(&requester.replica, true);
    let responder_answer = answer_next_challenge(&responder.replica, true);

    requester.replica.pair_with(responder.address, false).await.unwrap();

    let requester_code = requester_answer.await.unwrap();
    let responder_code = responder_answer.await.unwrap();
    assert!(requester_code.is_some());
    assert_eq!(requester_code, responder_code);

    let requester_id = requester.id().clone();
    wait_for(|| responder.replica.peer(&requester_id).is_ok()).await;
}

pub async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
