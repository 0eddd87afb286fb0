//! In-memory network transport with configurable unreliability.
//!
//! Every node in a session shares one [`NetworkTransport`]. Sends are
//! non-blocking and best-effort: a directed partition matrix, a stochastic
//! loss probability, and a uniform latency window decide whether and when a
//! registered delivery handler sees the envelope.
//!
//! The transport is an *unreliable, reorderable* link. There is no FIFO
//! guarantee between two nodes; algorithms that need ordering build it on
//! top.

mod transport;

pub use transport::{DeliveryHandler, DropHook, DropReason, NetworkTransport};
