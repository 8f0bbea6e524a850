//! Metrics for replication observability
//!
//! Uses the `metrics` facade; no recorder is installed here, embedding
//! applications pick their own exporter.

use crate::core_store::store::ApplyOutcome;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Store metrics
    describe_counter!("store.operations.applied", "Operations merged into the document store");
    describe_counter!("store.operations.buffered", "Operations held for missing dependencies");
    describe_counter!("store.operations.duplicate", "Operations discarded as already seen");
    describe_counter!("store.oplog.appends", "Durable operation log appends");
    describe_counter!("store.oplog.bytes", "Bytes written to the operation log");

    // Sync metrics
    describe_counter!("sync.sessions.started", "Sync sessions started");
    describe_counter!("sync.sessions.reconciled", "Sync sessions that reached reconciliation");
    describe_counter!("sync.sessions.failed", "Sync sessions that ended in an error");
    describe_histogram!("sync.session.duration_ms", "Sync session duration in milliseconds");

    // Network metrics
    describe_counter!("network.frames.sent", "Frames sent over transport sessions");
    describe_counter!("network.frames.received", "Frames received over transport sessions");
}

pub fn record_apply_outcome(outcome: ApplyOutcome) {
    let name = match outcome {
        ApplyOutcome::Applied => "store.operations.applied",
        ApplyOutcome::Buffered => "store.operations.buffered",
        ApplyOutcome::Duplicate => "store.operations.duplicate",
    };
    counter!(name).increment(1);
}

pub fn record_oplog_append(bytes: usize) {
    counter!("store.oplog.appends").increment(1);
    counter!("store.oplog.bytes").increment(bytes as u64);
}

pub fn record_frame_sent() {
    counter!("network.frames.sent").increment(1);
}

pub fn record_frame_received() {
    counter!("network.frames.received").increment(1);
}

/// Sync session outcome
pub fn record_sync_session(reconciled: bool) {
    if reconciled {
        counter!("sync.sessions.reconciled").increment(1);
    } else {
        counter!("sync.sessions.failed").increment(1);
    }
}

pub fn record_sync_started() {
    counter!("sync.sessions.started").increment(1);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self { name, start: Instant::now() }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        init_metrics();
        record_apply_outcome(ApplyOutcome::Applied);
        record_oplog_append(32);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new("sync.session.duration_ms");
        timer.stop();
    }
}
