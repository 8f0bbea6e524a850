//! Replica coordination
//!
//! Ties the document store, operation log, discovery, pairing and sync
//! together behind `ReplicaCoordinator`, and exposes the capability
//! registry through which features reach replicated state.

mod context;
mod coordinator;
mod error;
mod peers;
mod registry;

pub use context::ReplicaContext;
pub use coordinator::{ChangeNotification, ReplicaCoordinator};
pub use error::ReplicaError;
pub use peers::{PeerRecord, PeerTable};
pub use registry::{CapabilityRegistry, FeatureHandler, StoreHandle, TagsFeature};
