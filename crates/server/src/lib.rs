//! Session endpoint: WebSocket protocol, session manager, and hub.
//!
//! The only external boundary of the simulator is one bidirectional
//! JSON-framed channel per observer. Commands arrive as `{type: ...}`
//! frames; state snapshots, timeline events, and typed event mirrors flow
//! back to every connected observer.

pub mod hub;
pub mod protocol;
pub mod session;
pub mod ws;

pub use hub::Hub;
pub use protocol::{ClientCommand, StartConfig, TimelineEvent};
pub use session::{Broadcaster, SessionError, SessionManager, SessionOptions};
