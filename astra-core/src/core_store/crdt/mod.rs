/*
    CRDT subsystem - Conflict-Free Replicated Data Types

    Primitives that documents are built from, plus the version vector
    used for causal bookkeeping.
*/

pub mod lww_register;
pub mod or_set;
pub mod sequence;
pub mod traits;
pub mod vector_clock;

pub use lww_register::{LWWOperation, LWWRegister};
pub use or_set::{ORSet, ORSetOperation};
pub use sequence::{Position, PositionLevel, Sequence, SequenceOperation};
pub use traits::{Crdt, ValidatedCrdt};
pub use vector_clock::VectorClock;
