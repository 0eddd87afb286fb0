//! Typed event bus for simulation observability.
//!
//! Every step-observable action in a session publishes an [`Event`] here.
//! Two subscription styles are supported:
//!
//! - **Listeners**: functions fired asynchronously per event, best-effort.
//! - **Pull buffers**: bounded channels drained by the subscriber; full
//!   buffers drop the newest events silently.
//!
//! The bus can record events into a buffer for deterministic [`Replay`] in
//! tests. It is not a durable log — the session timeline is the canonical
//! bounded trace.

mod bus;
mod event;
mod replay;

pub use bus::{EventBus, EventStream, Listener};
pub use event::{kind, Event};
pub use replay::Replay;
