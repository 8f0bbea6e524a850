//! Astra - local-first replication and sync
//!
//! Each device runs a replica holding CRDT documents. Replicas find each
//! other on the local network, pair with a short confirmation code, and
//! exchange operations over Noise-encrypted sessions until their states
//! converge.

pub mod config;
pub mod core_discovery;
pub mod core_identity;
pub mod core_pairing;
pub mod core_replica;
pub mod core_router;
pub mod core_store;
pub mod core_sync;
pub mod logging;
pub mod metrics;
pub mod shutdown;

pub use config::Config;
pub use core_replica::{ChangeNotification, ReplicaContext, ReplicaCoordinator, ReplicaError};
pub use core_store::{DocumentValue, EntityId, Mutation, Operation, ReplicaId, Value};
pub use logging::{init_logging, LogLevel};
