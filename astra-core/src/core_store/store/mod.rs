/*
    Store subsystem - Applied state and persistence
*/

pub mod checkpoint;
pub mod document_store;
pub mod errors;
pub mod oplog;
pub mod received;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointMetadata};
pub use document_store::{ApplyOutcome, ApplyReport, DocumentStore, StoreState};
pub use errors::*;
pub use oplog::OpLog;
pub use received::ReceivedLog;
