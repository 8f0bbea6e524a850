/*
    Model subsystem - Data structures for replicated entities
*/

pub mod document;
pub mod operation;
pub mod types;
pub mod value;

pub use document::*;
pub use operation::*;
pub use types::*;
pub use value::*;
