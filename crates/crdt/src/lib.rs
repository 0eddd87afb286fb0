//! State-based CRDTs for the replication teaching projects.
//!
//! All merges are commutative, associative, and idempotent, so replicas that
//! exchange full state in any order converge to the same value.

mod counters;
mod lww;

pub use counters::{GCounter, PNCounter};
pub use lww::{Bias, LwwRegister, LwwSet};
