//! Node lifecycle: the engine-facing contract and the reusable helper that
//! algorithm plugins compose.
//!
//! The lifecycle layer knows nothing about specific message kinds. A plugin
//! node embeds a [`BaseNode`] by delegation, adds its own algorithm state,
//! and implements [`TickNode`] so the engine can drive it.

use distlab_events::{kind, Event, EventBus};
use distlab_types::{Envelope, Inbox, NodeId, NodeStatus, StateMap};
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Default inbox capacity per node.
pub const DEFAULT_INBOX_CAPACITY: usize = 1000;

/// Closure handing an envelope to the session's transport.
///
/// Nodes never hold the transport directly; the session wires this seam when
/// it builds the plugin, keeping back-references id-based.
pub type SendFn = Arc<dyn Fn(Envelope) + Send + Sync>;

/// The contract every simulated node fulfils for the engine.
///
/// `tick` performs exactly one scheduling quantum of local work — typically
/// at most one inbox pop followed by zero or more sends. All methods must be
/// cheap and non-blocking; `snapshot` must be safe to call concurrently with
/// `tick`.
pub trait TickNode: Send + Sync {
    fn id(&self) -> &NodeId;

    /// Called once when the engine starts.
    fn start(&self) {}

    /// Called once when the engine stops.
    fn stop(&self) {}

    /// One quantum of local work. Crashed nodes treat this as a no-op.
    fn tick(&self);

    /// Human-readable state fields for observers.
    fn snapshot(&self) -> StateMap;

    fn crash(&self);

    fn recover(&self);
}

/// Reusable lifecycle core: identity, status, bounded inbox, send seam,
/// event-bus handle.
///
/// Invariant: a node in any state other than `Running` silently discards
/// inbound envelopes and produces no outbound ones.
pub struct BaseNode {
    id: NodeId,
    status: RwLock<NodeStatus>,
    inbox: Inbox,
    send_fn: SendFn,
    bus: Arc<EventBus>,
}

impl BaseNode {
    pub fn new(id: NodeId, send_fn: SendFn, bus: Arc<EventBus>) -> Self {
        Self::with_capacity(id, send_fn, bus, DEFAULT_INBOX_CAPACITY)
    }

    pub fn with_capacity(
        id: NodeId,
        send_fn: SendFn,
        bus: Arc<EventBus>,
        inbox_capacity: usize,
    ) -> Self {
        Self {
            id,
            status: RwLock::new(NodeStatus::Running),
            inbox: Inbox::new(inbox_capacity),
            send_fn,
            bus,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    pub fn is_running(&self) -> bool {
        self.status() == NodeStatus::Running
    }

    /// Transition to a new status, emitting `node_state_changed` once per
    /// actual transition.
    pub fn set_status(&self, status: NodeStatus) {
        let old = {
            let mut current = self.status.write();
            let old = *current;
            if old == status {
                return;
            }
            *current = status;
            old
        };
        debug!(node = %self.id, from = %old, to = %status, "node state changed");
        self.emit(
            kind::NODE_STATE_CHANGED,
            [
                ("nodeId", json!(self.id)),
                ("oldState", json!(old.as_str())),
                ("newState", json!(status.as_str())),
            ],
        );
    }

    /// Idempotent crash transition.
    pub fn crash(&self) {
        self.set_status(NodeStatus::Crashed);
    }

    /// Idempotent recovery transition.
    pub fn recover(&self) {
        self.set_status(NodeStatus::Running);
    }

    /// Deliver an envelope into the inbox. Silently dropped unless running;
    /// silently dropped on overflow.
    pub fn receive(&self, env: Envelope) {
        if !self.is_running() {
            return;
        }
        self.inbox.push(env);
    }

    /// Take the oldest inbound envelope. Crashed nodes never dequeue.
    pub fn pop_message(&self) -> Option<Envelope> {
        if !self.is_running() {
            return None;
        }
        self.inbox.pop()
    }

    /// Hand an envelope to the transport. No-op unless running.
    /// Returns whether the envelope was actually handed over.
    pub fn send(&self, env: Envelope) -> bool {
        if !self.is_running() {
            return false;
        }
        (self.send_fn)(env);
        true
    }

    /// Publish an event on the session bus.
    pub fn emit<I>(&self, event_type: &str, fields: I)
    where
        I: IntoIterator<Item = (&'static str, serde_json::Value)>,
    {
        self.bus.emit(Event::with_fields(event_type, fields));
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn inbox_len(&self) -> usize {
        self.inbox.len()
    }

    /// Common snapshot fields; plugins extend with their own.
    pub fn snapshot_base(&self) -> StateMap {
        let mut map = StateMap::new();
        map.insert("id".into(), json!(self.id));
        map.insert("status".into(), json!(self.status().as_str()));
        map.insert("inboxSize".into(), json!(self.inbox.len()));
        map
    }
}

impl std::fmt::Debug for BaseNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseNode")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("inbox", &self.inbox)
            .finish()
    }
}
