/*
    SyncSession - delta exchange with one peer

    Idle -> VectorExchange -> DeltaPush -> DeltaPull -> Reconciled -> Idle
    (any failure returns straight to Idle)

    1. Send our version vector, read the peer's.
    2. Push every operation the peer's vector does not cover, then `Ack`.
    3. Apply the peer's operations until its `Ack` arrives.

    Both sides run the same steps at the same time; the frame reader
    buffers incoming frames, so pushing never waits on the peer pulling.
    A session cut short leaves both stores consistent: the next session
    starts again from whatever the vectors then say.
*/

use super::SyncError;
use crate::core_router::frame::Frame;
use crate::core_router::session::{FrameSink, FrameSource};
use crate::core_store::crdt::VectorClock;
use crate::core_store::model::{Operation, ReplicaId};
use crate::core_store::store::ApplyOutcome;
use crate::metrics::{self, Timer};
use std::fmt;
use tracing::{debug, info};

/// What the sync engine needs from a replica
pub trait SyncStore: Send + Sync {
    /// Vector of the applied state
    fn version_vector(&self) -> Result<VectorClock, SyncError>;

    /// Every applied operation (local or relayed) not covered by `vector`
    fn operations_since(&self, vector: &VectorClock) -> Result<Vec<Operation>, SyncError>;

    /// Apply an operation received from a peer
    fn apply_remote(&self, op: Operation) -> Result<ApplyOutcome, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    VectorExchange,
    DeltaPush,
    DeltaPull,
    Reconciled,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Counters for one finished session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub sent: usize,
    pub received: usize,
    pub applied: usize,
    pub buffered: usize,
    pub duplicates: usize,
    /// Peer's vector from its `Ack`
    pub remote_vector: VectorClock,
    /// Our vector after applying everything received
    pub local_vector: VectorClock,
}

pub struct SyncSession {
    peer: ReplicaId,
    state: SyncState,
}

impl SyncSession {
    pub fn new(peer: ReplicaId) -> Self {
        SyncSession { peer, state: SyncState::Idle }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    fn enter(&mut self, next: SyncState) {
        debug!(peer = %self.peer, from = %self.state, to = %next, "sync state");
        self.state = next;
    }

    /// Run one full exchange; the session is `Idle` again afterwards
    pub async fn run<S>(
        &mut self,
        store: &S,
        sink: &mut dyn FrameSink,
        source: &mut dyn FrameSource,
    ) -> Result<SyncReport, SyncError>
    where
        S: SyncStore + ?Sized,
    {
        metrics::record_sync_started();
        let timer = Timer::new("sync.session.duration_ms");

        let result = self.exchange(store, sink, source).await;
        timer.stop();
        metrics::record_sync_session(result.is_ok());

        match &result {
            Ok(report) => {
                self.enter(SyncState::Reconciled);
                info!(
                    peer = %self.peer,
                    sent = report.sent,
                    received = report.received,
                    applied = report.applied,
                    "sync reconciled"
                );
            }
            Err(e) => debug!(peer = %self.peer, state = %self.state, error = %e, "sync session failed"),
        }
        self.enter(SyncState::Idle);
        result
    }

    async fn exchange<S>(
        &mut self,
        store: &S,
        sink: &mut dyn FrameSink,
        source: &mut dyn FrameSource,
    ) -> Result<SyncReport, SyncError>
    where
        S: SyncStore + ?Sized,
    {
        let mut report = SyncReport::default();

        self.enter(SyncState::VectorExchange);
        sink.send(Frame::VectorExchange { vector: store.version_vector()? }).await?;
        let remote_vector = match source.receive().await? {
            Frame::VectorExchange { vector } => vector,
            other => {
                return Err(SyncError::UnexpectedFrame { expected: "VectorExchange", actual: other.kind() })
            }
        };

        self.enter(SyncState::DeltaPush);
        for op in store.operations_since(&remote_vector)? {
            sink.send(Frame::operation(op)?).await?;
            report.sent += 1;
        }
        sink.send(Frame::Ack { vector: store.version_vector()? }).await?;

        self.enter(SyncState::DeltaPull);
        loop {
            match source.receive().await? {
                Frame::Operation { operation, checksum } => {
                    let actual = operation.checksum()?;
                    if actual != checksum {
                        return Err(SyncError::Integrity(format!(
                            "operation {} checksum {:08x} does not match {:08x}",
                            operation.id(),
                            actual,
                            checksum
                        )));
                    }
                    report.received += 1;
                    match store.apply_remote(operation)? {
                        ApplyOutcome::Applied => report.applied += 1,
                        ApplyOutcome::Buffered => report.buffered += 1,
                        ApplyOutcome::Duplicate => report.duplicates += 1,
                    }
                }
                Frame::Ack { vector } => {
                    report.remote_vector = vector;
                    break;
                }
                other => {
                    return Err(SyncError::UnexpectedFrame { expected: "Operation", actual: other.kind() })
                }
            }
        }

        report.local_vector = store.version_vector()?;
        Ok(report)
    }
}
