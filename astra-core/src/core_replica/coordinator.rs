/*
    coordinator.rs - Replica coordinator

    Owns one replica's state and wires the subsystems around it:

    - Recovery: checkpoint, then the operation log tail, then the remote
      operations received since that checkpoint. A damaged operation log
      is quarantined and the replica waits to be re-seeded by a peer; so
      does a replica whose own operations cannot all be applied.
    - Local writes: prepare, append to the log, apply, notify.
    - Remote writes: append to the received log, apply, notify.
    - Background tasks: connection listener, discovery, sync scheduler,
      periodic checkpoints. All of them stop on shutdown.

    Lock order is oplog, then received log, then store. No std lock is
    held across an await.
*/

use super::context::ReplicaContext;
use super::peers::{PeerRecord, PeerTable};
use super::registry::StoreHandle;
use super::ReplicaError;
use crate::core_discovery::{self, DiscoveryEvent, DiscoveryService, KnownPeers, PeerAnnouncement};
use crate::core_identity::ReplicaIdentity;
use crate::core_pairing::{
    run_requester, run_responder, CandidateInfo, LocalPeer, PairingError, PairingEvent,
    PairingManager, PairingOutcome,
};
use crate::core_router::{
    connect_with_backoff, BackoffPolicy, FrameSink, Hello, Session, SessionPurpose,
    TransportEvent, TransportManager,
};
use crate::core_store::crdt::VectorClock;
use crate::core_store::model::{DocumentValue, EntityId, Mutation, Operation, ReplicaId, Timestamp};
use crate::core_store::store::{
    ApplyOutcome, ApplyReport, CheckpointManager, CheckpointMetadata, DocumentStore, OpLog,
    ReceivedLog, StoreError, StoreResult,
};
use crate::core_sync::{SyncError, SyncReport, SyncSession, SyncStore};
use crate::shutdown::ShutdownCoordinator;
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 256;
const CONNECTION_CHANNEL_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Emitted after any operation changes a document's materialized value
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub entity_id: EntityId,
    /// New value; `None` once every field is empty
    pub value: Option<DocumentValue>,
}

fn poisoned() -> StoreError {
    StoreError::Storage("replica state lock poisoned".to_string())
}

struct Recovered {
    store: DocumentStore,
    oplog: OpLog,
    received: ReceivedLog,
    needs_reseed: bool,
    replayed: usize,
}

fn recover(
    data_dir: &Path,
    replica: &ReplicaId,
    checkpoints: &CheckpointManager,
) -> Result<Recovered, ReplicaError> {
    let mut store = match checkpoints.load() {
        Ok(Some(checkpoint)) if checkpoint.metadata.replica == *replica => {
            debug!(
                local_counter = checkpoint.metadata.local_counter,
                documents = checkpoint.metadata.documents_count,
                "checkpoint loaded"
            );
            DocumentStore::from_state(replica.clone(), checkpoint.state)
        }
        Ok(Some(checkpoint)) => {
            warn!(owner = %checkpoint.metadata.replica, "checkpoint belongs to another replica, ignoring it");
            DocumentStore::new(replica.clone())
        }
        Ok(None) => DocumentStore::new(replica.clone()),
        Err(StoreError::Corruption(reason)) => {
            warn!(%reason, "checkpoint unreadable, rebuilding from the operation log");
            checkpoints.clear()?;
            DocumentStore::new(replica.clone())
        }
        Err(e) => return Err(e.into()),
    };

    let path = OpLog::path_for(data_dir, replica);
    let mut needs_reseed = false;
    let oplog = match OpLog::open(path.clone(), replica.clone()) {
        Ok(oplog) => oplog,
        Err(StoreError::Corruption(reason)) => {
            error!(%reason, "operation log corrupted");
            OpLog::quarantine(&path)?;
            needs_reseed = true;
            OpLog::open(path, replica.clone())?
        }
        Err(e) => return Err(e.into()),
    };

    let checkpoint_counter = store.version_vector().get(replica);
    if checkpoint_counter > oplog.last_counter() {
        warn!(
            checkpoint = checkpoint_counter,
            log = oplog.last_counter(),
            "checkpoint is ahead of the operation log, discarding it"
        );
        checkpoints.clear()?;
        store = DocumentStore::new(replica.clone());
        needs_reseed = true;
    }

    let tail: Vec<Operation> = oplog.operations_since(store.version_vector()).collect();
    let mut replayed = tail.len();
    for op in tail {
        store
            .apply(op)
            .map_err(|e| ReplicaError::Corruption(format!("operation log replay failed: {}", e)))?;
    }

    let received_path = ReceivedLog::path_for(data_dir, replica);
    let received = match ReceivedLog::open(received_path.clone()) {
        Ok(received) => received,
        Err(StoreError::Corruption(reason)) => {
            warn!(%reason, "received log corrupted, peers will resend what it held");
            ReceivedLog::quarantine(&received_path)?;
            ReceivedLog::open(received_path)?
        }
        Err(e) => return Err(e.into()),
    };
    for op in received.operations() {
        if let Err(e) = store.apply(op.clone()) {
            warn!(op = %op, error = %e, "skipping unreadable received operation");
        }
    }
    replayed += received.len();

    let applied_local = store.version_vector().get(replica);
    if applied_local < oplog.last_counter() {
        warn!(
            applied = applied_local,
            log = oplog.last_counter(),
            pending = store.pending_len(),
            "local operations wait on remote ones that were not kept"
        );
        needs_reseed = true;
    }

    Ok(Recovered { store, oplog, received, needs_reseed, replayed })
}

/// Removes the peer from the in-flight set when the session ends
struct SessionGuard<'a> {
    sessions: &'a Mutex<HashSet<ReplicaId>>,
    replica_id: ReplicaId,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&self.replica_id);
        }
    }
}

struct Inner {
    context: ReplicaContext,
    store: RwLock<DocumentStore>,
    oplog: Mutex<OpLog>,
    received: Mutex<ReceivedLog>,
    checkpoints: CheckpointManager,
    peers: Mutex<PeerTable>,
    known: KnownPeers,
    pairing: PairingManager,
    changes: broadcast::Sender<ChangeNotification>,
    in_flight: Mutex<HashSet<ReplicaId>>,
    needs_reseed: AtomicBool,
    sync_requested: Notify,
    shutdown: ShutdownCoordinator,
    listen_address: Mutex<Option<SocketAddr>>,
}

impl Inner {
    fn replica_id(&self) -> &ReplicaId {
        self.context.identity.replica_id()
    }

    fn store_read(&self) -> StoreResult<RwLockReadGuard<'_, DocumentStore>> {
        self.store.read().map_err(|_| poisoned())
    }

    fn store_write(&self) -> StoreResult<RwLockWriteGuard<'_, DocumentStore>> {
        self.store.write().map_err(|_| poisoned())
    }

    fn oplog(&self) -> StoreResult<MutexGuard<'_, OpLog>> {
        self.oplog.lock().map_err(|_| poisoned())
    }

    fn received(&self) -> StoreResult<MutexGuard<'_, ReceivedLog>> {
        self.received.lock().map_err(|_| poisoned())
    }

    fn peers(&self) -> Result<MutexGuard<'_, PeerTable>, ReplicaError> {
        self.peers.lock().map_err(|_| ReplicaError::Store(poisoned()))
    }

    fn notify(&self, report: &ApplyReport) {
        if report.changed.is_empty() || self.changes.receiver_count() == 0 {
            return;
        }
        let Ok(store) = self.store.read() else { return };
        for entity_id in &report.changed {
            // Subscribers that went away are not an error
            let _ = self.changes.send(ChangeNotification {
                entity_id: entity_id.clone(),
                value: store.snapshot(entity_id),
            });
        }
    }

    /// Apply an operation that arrived from a peer.
    ///
    /// Operations from other origins are durable before they are applied.
    /// Our own operations only come back this way after local history was
    /// lost; they are written to the fresh log in counter order.
    fn apply_remote_op(&self, op: Operation) -> StoreResult<ApplyOutcome> {
        op.check_well_formed()?;
        let local = self.replica_id();

        let report = {
            let mut received = self.received()?;
            if op.origin_replica != *local && !self.store_read()?.is_duplicate(&op) {
                received.append(&op)?;
            }
            self.store_write()?.apply(op)?
        };

        let own: Vec<&Operation> =
            report.applied.iter().filter(|op| &op.origin_replica == local).collect();
        if !own.is_empty() {
            let mut oplog = self.oplog()?;
            for op in own {
                if op.origin_counter == oplog.last_counter() + 1 {
                    oplog.append(op)?;
                    debug!(op = %op, "recovered local operation from peer");
                } else {
                    warn!(op = %op, log = oplog.last_counter(), "local operation out of log order, not persisted");
                }
            }
        }

        self.notify(&report);
        Ok(report.outcome)
    }

    fn begin_session(&self, replica_id: &ReplicaId) -> Result<SessionGuard<'_>, ReplicaError> {
        let mut sessions = self.in_flight.lock().map_err(|_| ReplicaError::Store(poisoned()))?;
        if !sessions.insert(replica_id.clone()) {
            return Err(ReplicaError::AlreadySyncing(replica_id.clone()));
        }
        Ok(SessionGuard { sessions: &self.in_flight, replica_id: replica_id.clone() })
    }

    fn flag_trust_violation(&self, replica_id: &ReplicaId) {
        error!(peer = %replica_id, "trust violation, peer flagged and excluded from sync");
        match self.peers() {
            Ok(mut peers) => {
                if peers.flag_trust_violation(replica_id) {
                    if let Err(e) = peers.save() {
                        warn!(error = %e, "failed to save peer table");
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to flag peer"),
        }
    }

    fn record_pairing(
        &self,
        outcome: &PairingOutcome,
        address: Option<SocketAddr>,
    ) -> Result<PeerRecord, ReplicaError> {
        let record = {
            let mut peers = self.peers()?;
            let record = peers.upsert_trusted(outcome, address);
            peers.save()?;
            record
        };
        self.known.insert(record.replica_id.clone());
        info!(
            peer = %record.replica_id,
            name = %record.display_name,
            key = %record.trust_key.fingerprint(),
            "peer trusted"
        );
        Ok(record)
    }
}

impl SyncStore for Inner {
    fn version_vector(&self) -> Result<VectorClock, SyncError> {
        Ok(self.store_read()?.version_vector().clone())
    }

    fn operations_since(&self, vector: &VectorClock) -> Result<Vec<Operation>, SyncError> {
        let mut ops: Vec<Operation> = self.oplog()?.operations_since(vector).collect();
        let store = self.store_read()?;
        ops.extend(store.relayed_since(vector).cloned());
        Ok(ops)
    }

    fn apply_remote(&self, op: Operation) -> Result<ApplyOutcome, SyncError> {
        Ok(self.apply_remote_op(op)?)
    }
}

/// Handle to a running replica; clones share the same state
#[derive(Clone)]
pub struct ReplicaCoordinator {
    inner: Arc<Inner>,
}

impl ReplicaCoordinator {
    /// Recover the replica stored under the context's data directory
    pub fn open(context: ReplicaContext) -> Result<Self, ReplicaError> {
        std::fs::create_dir_all(&context.data_dir)?;
        let replica = context.identity.replica_id().clone();
        let checkpoints = CheckpointManager::new(context.data_dir.clone())?;
        let recovered = recover(&context.data_dir, &replica, &checkpoints)?;

        let peers = PeerTable::load(PeerTable::path_for(&context.data_dir))?;
        let known = KnownPeers::default();
        for peer in peers.list() {
            known.insert(peer.replica_id);
        }

        info!(
            replica = %replica,
            name = %context.identity.display_name(),
            key = %context.identity.trust_key().fingerprint(),
            documents = recovered.store.entity_ids().len(),
            vector = %recovered.store.version_vector(),
            replayed = recovered.replayed,
            peers = peers.len(),
            "replica opened"
        );
        if recovered.needs_reseed {
            warn!("local history incomplete; local writes are refused until a peer re-seeds this replica");
        }

        let pairing = PairingManager::new(context.config.pairing.confirmation_timeout);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(ReplicaCoordinator {
            inner: Arc::new(Inner {
                context,
                store: RwLock::new(recovered.store),
                oplog: Mutex::new(recovered.oplog),
                received: Mutex::new(recovered.received),
                checkpoints,
                peers: Mutex::new(peers),
                known,
                pairing,
                changes,
                in_flight: Mutex::new(HashSet::new()),
                needs_reseed: AtomicBool::new(recovered.needs_reseed),
                sync_requested: Notify::new(),
                shutdown: ShutdownCoordinator::new(SHUTDOWN_GRACE),
                listen_address: Mutex::new(None),
            }),
        })
    }

    pub fn identity(&self) -> &ReplicaIdentity {
        &self.inner.context.identity
    }

    pub fn replica_id(&self) -> &ReplicaId {
        self.inner.replica_id()
    }

    pub fn display_name(&self) -> &str {
        self.inner.context.identity.display_name()
    }

    pub fn context(&self) -> &ReplicaContext {
        &self.inner.context
    }

    /// Address the sync listener is bound to, once started
    pub fn listen_address(&self) -> Option<SocketAddr> {
        self.inner.listen_address.lock().ok().and_then(|address| *address)
    }

    /// True while local history is incomplete after a corrupted log
    pub fn needs_reseed(&self) -> bool {
        self.inner.needs_reseed.load(Ordering::SeqCst)
    }

    pub fn store_handle(&self) -> StoreHandle {
        StoreHandle::new(self.clone())
    }

    pub fn version_vector(&self) -> Result<VectorClock, ReplicaError> {
        Ok(self.inner.store_read()?.version_vector().clone())
    }

    pub fn read(&self, entity_id: &EntityId) -> Result<Option<DocumentValue>, ReplicaError> {
        Ok(self.inner.store_read()?.snapshot(entity_id))
    }

    pub fn entities(&self) -> Result<Vec<EntityId>, ReplicaError> {
        Ok(self.inner.store_read()?.entity_ids())
    }

    /// Operations received but still waiting for their dependencies
    pub fn pending_len(&self) -> Result<usize, ReplicaError> {
        Ok(self.inner.store_read()?.pending_len())
    }

    /// Apply a local mutation. The operation is durable before it is visible.
    pub fn mutate(
        &self,
        entity_id: &EntityId,
        field_path: &str,
        mutation: Mutation,
    ) -> Result<Operation, ReplicaError> {
        if self.needs_reseed() {
            return Err(ReplicaError::Corruption(
                "local history is incomplete; waiting to re-seed from a peer".to_string(),
            ));
        }

        let mut oplog = self.inner.oplog()?;
        let op = self.inner.store_read()?.prepare_local(entity_id, field_path, mutation)?;
        oplog.append(&op)?;
        let report = self.inner.store_write()?.apply(op.clone())?;
        drop(oplog);

        debug!(op = %op, "local mutation applied");
        self.inner.notify(&report);
        self.inner.sync_requested.notify_one();
        Ok(op)
    }

    /// Apply an operation received outside a sync session
    pub fn apply_remote(&self, op: Operation) -> Result<ApplyOutcome, ReplicaError> {
        Ok(self.inner.apply_remote_op(op)?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.inner.changes.subscribe()
    }

    pub fn pairing_events(&self) -> broadcast::Receiver<PairingEvent> {
        self.inner.pairing.subscribe()
    }

    pub fn pairing_candidates(&self) -> Vec<CandidateInfo> {
        self.inner.pairing.candidates()
    }

    /// The user's answer to a `ConfirmationRequired` event
    pub fn confirm_pairing(&self, replica_id: &ReplicaId, accepted: bool) -> Result<(), ReplicaError> {
        self.inner.pairing.confirm(replica_id, accepted).map_err(Into::into)
    }

    pub fn peers(&self) -> Result<Vec<PeerRecord>, ReplicaError> {
        Ok(self.inner.peers()?.list())
    }

    pub fn peer(&self, replica_id: &ReplicaId) -> Result<PeerRecord, ReplicaError> {
        self.inner
            .peers()?
            .get(replica_id)
            .cloned()
            .ok_or_else(|| ReplicaError::UnknownPeer(replica_id.clone()))
    }

    /// Drop trust in a peer; it shows up as a pairing candidate again
    pub fn forget_peer(&self, replica_id: &ReplicaId) -> Result<PeerRecord, ReplicaError> {
        let record = {
            let mut peers = self.inner.peers()?;
            let record = peers
                .forget(replica_id)
                .ok_or_else(|| ReplicaError::UnknownPeer(replica_id.clone()))?;
            peers.save()?;
            record
        };
        self.inner.known.remove(replica_id);
        info!(peer = %replica_id, "peer forgotten");
        Ok(record)
    }

    /// Write a checkpoint of the current state and empty the received log
    pub fn checkpoint(&self) -> Result<CheckpointMetadata, ReplicaError> {
        let mut received = self.inner.received()?;
        let state = self.inner.store_read()?.state().clone();
        let metadata = self.inner.checkpoints.save(self.replica_id(), &state)?;
        received.clear()?;
        Ok(metadata)
    }

    fn local_peer(&self) -> LocalPeer {
        LocalPeer { replica_id: self.replica_id().clone(), display_name: self.display_name().to_string() }
    }

    fn hello(&self, purpose: SessionPurpose) -> Hello {
        Hello::new(self.replica_id().clone(), self.display_name(), purpose)
    }

    fn backoff_policy(&self) -> BackoffPolicy {
        let sync = &self.inner.context.config.sync;
        BackoffPolicy { initial: sync.initial_backoff, ceiling: sync.retry_ceiling }
    }

    /// Bound one network step by the session timeout
    async fn within<F, T, E>(&self, future: F) -> Result<T, ReplicaError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<ReplicaError>,
    {
        match tokio::time::timeout(self.inner.context.config.sync.session_timeout, future).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(ReplicaError::TransientNetwork("session timed out".to_string())),
        }
    }

    /// Bind the listener and start discovery and the background schedulers.
    /// Returns the bound sync address.
    pub async fn start(&self) -> Result<SocketAddr, ReplicaError> {
        let config = &self.inner.context.config;
        let (event_tx, mut event_rx) = mpsc::channel(CONNECTION_CHANNEL_CAPACITY);
        let transport = TransportManager::new(event_tx);
        let listen_address = transport
            .listen(&config.replica.listen_address.to_string(), self.inner.shutdown.subscribe())
            .await?;
        if let Ok(mut address) = self.inner.listen_address.lock() {
            *address = Some(listen_address);
        }

        let coordinator = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        self.inner.shutdown.spawn("connections", async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = event_rx.recv() => match event {
                        Some(TransportEvent::Connected { stream, remote_addr }) => {
                            let coordinator = coordinator.clone();
                            tokio::spawn(async move {
                                if let Err(e) = coordinator.handle_incoming(stream, remote_addr).await {
                                    log_session_error(&remote_addr.to_string(), &e);
                                }
                            });
                        }
                        None => break,
                    }
                }
            }
        });

        if config.discovery.enabled {
            self.start_discovery(listen_address).await?;
        }

        let coordinator = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let sync_interval = config.sync.sync_interval;
        let auto_sync = config.sync.auto_sync;
        self.inner.shutdown.spawn("sync-scheduler", async move {
            let mut ticker = tokio::time::interval(sync_interval);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => coordinator.heartbeat(),
                    _ = coordinator.inner.sync_requested.notified(), if auto_sync => {}
                }
                if !auto_sync {
                    continue;
                }
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = coordinator.sync_all() => {}
                }
            }
        });

        let coordinator = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let checkpoint_interval = config.sync.checkpoint_interval;
        self.inner.shutdown.spawn("checkpointer", async move {
            let mut ticker = tokio::time::interval(checkpoint_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.checkpoint() {
                            warn!(error = %e, "periodic checkpoint failed");
                        }
                    }
                }
            }
        });

        info!(replica = %self.replica_id(), address = %listen_address, "replica started");
        Ok(listen_address)
    }

    async fn start_discovery(&self, listen_address: SocketAddr) -> Result<(), ReplicaError> {
        let config = &self.inner.context.config.discovery;
        let announcement =
            PeerAnnouncement::new(self.replica_id().clone(), self.display_name(), listen_address);
        let service = DiscoveryService::new(
            announcement,
            core_discovery::DiscoveryConfig {
                bind_address: config.bind_address,
                broadcast_address: config.broadcast_address,
                advertisement_interval: config.advertisement_interval,
            },
            self.inner.known.clone(),
        );
        let (mut events, _) = service.start(self.inner.shutdown.subscribe()).await?;

        let coordinator = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        self.inner.shutdown.spawn("discovery-events", async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = events.recv() => match event {
                        Some(event) => coordinator.on_discovery(event),
                        None => break,
                    }
                }
            }
        });
        Ok(())
    }

    fn on_discovery(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PairingCandidate { replica_id, display_name, address } => {
                self.inner.pairing.discovered(replica_id, display_name, address);
            }
            DiscoveryEvent::PeerSeen { replica_id, address } => {
                let changed = match self.inner.peers() {
                    Ok(mut peers) => {
                        let changed = peers.mark_seen(&replica_id, address, Timestamp::now());
                        if changed {
                            if let Err(e) = peers.save() {
                                warn!(error = %e, "failed to save peer table");
                            }
                        }
                        changed
                    }
                    Err(_) => false,
                };
                if changed {
                    debug!(peer = %replica_id, %address, "peer reachable");
                    self.inner.sync_requested.notify_one();
                }
            }
        }
    }

    /// Periodic housekeeping: stale peers and expired pairing candidates
    fn heartbeat(&self) {
        let config = &self.inner.context.config;
        if config.discovery.enabled {
            if let Ok(mut peers) = self.inner.peers() {
                let stale = peers.sweep_stale(Timestamp::now(), config.discovery.peer_stale_timeout);
                if !stale.is_empty() {
                    debug!(peers = ?stale, "peers went silent");
                    if let Err(e) = peers.save() {
                        warn!(error = %e, "failed to save peer table");
                    }
                }
            }
        }
        let expired = self.inner.pairing.expire_stale();
        if expired > 0 {
            debug!(expired, "pairing candidates expired");
        }
    }

    /// Sync with every trusted peer that has a known address, concurrently
    pub async fn sync_all(&self) -> Vec<(ReplicaId, Result<SyncReport, ReplicaError>)> {
        let targets: Vec<ReplicaId> = match self.inner.peers() {
            Ok(peers) => peers
                .list()
                .into_iter()
                .filter(PeerRecord::is_syncable)
                .map(|peer| peer.replica_id)
                .collect(),
            Err(_) => Vec::new(),
        };

        let mut tasks = JoinSet::new();
        for replica_id in targets {
            let coordinator = self.clone();
            tasks.spawn(async move {
                let result = coordinator.sync_with(&replica_id).await;
                (replica_id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((replica_id, result)) => {
                    if let Err(e) = &result {
                        log_session_error(replica_id.as_str(), e);
                    }
                    results.push((replica_id, result));
                }
                Err(e) => warn!(error = %e, "sync task failed"),
            }
        }
        results
    }

    /// Open a sync session to a trusted peer and run one full exchange
    pub async fn sync_with(&self, replica_id: &ReplicaId) -> Result<SyncReport, ReplicaError> {
        let peer = self.peer(replica_id)?;
        if peer.trust_violation {
            return Err(ReplicaError::TrustViolation(format!(
                "peer {} is flagged; pair again to restore trust",
                replica_id
            )));
        }
        let address = peer.last_known_address.ok_or_else(|| {
            ReplicaError::TransientNetwork(format!("no known address for {}", replica_id))
        })?;
        let _guard = self.inner.begin_session(replica_id)?;

        let result = self.sync_outgoing(&peer, address).await;
        self.finish_sync(replica_id, &result);
        result
    }

    async fn sync_outgoing(
        &self,
        peer: &PeerRecord,
        address: SocketAddr,
    ) -> Result<SyncReport, ReplicaError> {
        let stream = connect_with_backoff(address, self.backoff_policy()).await?;
        let mut session =
            self.within(Session::initiate(stream, self.inner.context.identity.keypair())).await?;
        if let Err(e) = session.verify_trust(&peer.trust_key) {
            self.inner.flag_trust_violation(&peer.replica_id);
            return Err(e.into());
        }

        let hello = self.within(session.exchange_hello(self.hello(SessionPurpose::Sync))).await?;
        if hello.replica_id != peer.replica_id {
            self.inner.flag_trust_violation(&peer.replica_id);
            return Err(ReplicaError::TrustViolation(format!(
                "{} answered as {}",
                peer.replica_id, hello.replica_id
            )));
        }
        self.run_sync(session, &peer.replica_id).await
    }

    async fn run_sync(&self, session: Session, peer: &ReplicaId) -> Result<SyncReport, ReplicaError> {
        let (mut writer, mut reader) = session.split();
        let mut sync = SyncSession::new(peer.clone());
        let result = self.within(sync.run(&*self.inner, &mut writer, &mut reader)).await;
        let _ = writer.close().await;

        if let Err(ReplicaError::TrustViolation(_)) = &result {
            self.inner.flag_trust_violation(peer);
        }
        result
    }

    fn finish_sync(&self, replica_id: &ReplicaId, result: &Result<SyncReport, ReplicaError>) {
        match result {
            Ok(report) => {
                if let Ok(mut peers) = self.inner.peers() {
                    peers.record_sync(replica_id, report.remote_vector.clone(), Timestamp::now());
                    if let Err(e) = peers.save() {
                        warn!(error = %e, "failed to save peer table");
                    }
                }
                if self.inner.needs_reseed.swap(false, Ordering::SeqCst) {
                    info!(peer = %replica_id, vector = %report.local_vector, "re-seeded from peer");
                }
            }
            Err(e) if e.is_transient() => {
                if let Ok(mut peers) = self.inner.peers() {
                    if peers.set_reachable(replica_id, false) {
                        if let Err(e) = peers.save() {
                            warn!(error = %e, "failed to save peer table");
                        }
                    }
                }
            }
            Err(_) => {}
        }
    }

    /// Pair with the replica listening at `address`.
    ///
    /// Both users must confirm the short code through `confirm_pairing`.
    /// A known peer presenting a new key is refused unless `allow_rekey`.
    pub async fn pair_with(&self, address: SocketAddr, allow_rekey: bool) -> Result<PeerRecord, ReplicaError> {
        let stream = connect_with_backoff(address, self.backoff_policy()).await?;
        let mut session =
            self.within(Session::initiate(stream, self.inner.context.identity.keypair())).await?;
        let hello = self.within(session.exchange_hello(self.hello(SessionPurpose::Pair))).await?;
        if &hello.replica_id == self.replica_id() {
            return Err(ReplicaError::Protocol("refusing to pair with ourselves".to_string()));
        }

        let remote_key = *session.remote_static();
        let rekey = match self.inner.peers()?.get(&hello.replica_id) {
            Some(existing) => existing.trust_key != remote_key,
            None => false,
        };
        if rekey && !allow_rekey {
            return Err(PairingError::RekeyNotAllowed(hello.replica_id.clone()).into());
        }

        let outcome = run_requester(
            &mut session,
            &self.local_peer(),
            &hello,
            Some(address),
            rekey,
            &self.inner.pairing,
        )
        .await?;
        let _ = session.close().await;
        self.inner.record_pairing(&outcome, Some(address))
    }

    async fn handle_incoming(&self, stream: TcpStream, remote_addr: SocketAddr) -> Result<(), ReplicaError> {
        let mut session =
            self.within(Session::respond(stream, self.inner.context.identity.keypair())).await?;
        let hello = self
            .within(session.answer_hello(self.replica_id().clone(), self.display_name()))
            .await?;
        debug!(peer = %hello.replica_id, purpose = ?hello.purpose, remote = %remote_addr, "session opened");

        match hello.purpose {
            SessionPurpose::Pair => self.accept_pairing(session, hello).await,
            SessionPurpose::Sync => self.accept_sync(session, hello).await,
        }
    }

    async fn accept_pairing(&self, mut session: Session, hello: Hello) -> Result<(), ReplicaError> {
        let remote_key = *session.remote_static();
        let rekey = match self.inner.peers()?.get(&hello.replica_id) {
            Some(existing) => existing.trust_key != remote_key,
            None => false,
        };

        let limit = self.inner.pairing.timeout() + self.inner.context.config.sync.session_timeout;
        let outcome = tokio::time::timeout(
            limit,
            run_responder(&mut session, &self.local_peer(), &hello, None, rekey, &self.inner.pairing),
        )
        .await
        .map_err(|_| PairingError::Timeout)??;
        let _ = session.close().await;

        // The discovered listening address, if the peer announced one
        let address = self
            .inner
            .pairing
            .candidates()
            .into_iter()
            .find(|candidate| candidate.replica_id == outcome.replica_id)
            .and_then(|candidate| candidate.address);
        self.inner.record_pairing(&outcome, address)?;
        Ok(())
    }

    async fn accept_sync(&self, session: Session, hello: Hello) -> Result<(), ReplicaError> {
        let peer = self.peer(&hello.replica_id)?;
        if peer.trust_violation {
            return Err(ReplicaError::TrustViolation(format!("peer {} is flagged", peer.replica_id)));
        }
        if let Err(e) = session.verify_trust(&peer.trust_key) {
            self.inner.flag_trust_violation(&peer.replica_id);
            return Err(e.into());
        }

        // Both sides dialed at once: the session opened by the lower replica id wins
        let _guard = match self.inner.begin_session(&peer.replica_id) {
            Ok(guard) => Some(guard),
            Err(ReplicaError::AlreadySyncing(_)) if peer.replica_id < *self.replica_id() => None,
            Err(e) => return Err(e),
        };

        let result = self.run_sync(session, &peer.replica_id).await;
        self.finish_sync(&peer.replica_id, &result);
        result.map(|_| ())
    }

    /// Stop background tasks and write a final checkpoint
    pub async fn shutdown(&self) {
        self.inner.shutdown.shutdown().await;
        match self.checkpoint() {
            Ok(metadata) => debug!(local_counter = metadata.local_counter, "final checkpoint written"),
            Err(e) => warn!(error = %e, "final checkpoint failed"),
        }
    }
}

fn log_session_error(peer: &str, error: &ReplicaError) {
    match error {
        ReplicaError::TrustViolation(reason) => error!(peer, %reason, "session refused"),
        ReplicaError::VersionMismatch { local, remote } => {
            warn!(peer, %local, %remote, "incompatible protocol version")
        }
        ReplicaError::AlreadySyncing(_) => debug!(peer, "sync already in progress"),
        e if e.is_transient() => debug!(peer, error = %e, "session failed"),
        e => warn!(peer, error = %e, "session failed"),
    }
}
