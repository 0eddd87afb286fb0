//! Logical clocks: Lamport scalars and per-node vector clocks.
//!
//! Both clock types are internally locked so a node can expose them to
//! concurrent `snapshot()` calls while its tick mutates them. All operations
//! are total — there is no failure mode.

mod lamport;
mod vector;

pub use lamport::LamportClock;
pub use vector::{compare_vector_clocks, CausalRelation, VectorClock, VectorSnapshot};
