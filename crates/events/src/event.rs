//! Event record and the wire-stable event-type vocabulary.

use distlab_types::{now_millis, StateMap};
use serde::Serialize;

/// Wire-stable event type tags.
///
/// Plugins may emit additional project-specific tags (e.g.
/// `"conflict_detected"`); these constants cover the core vocabulary.
pub mod kind {
    // Message events
    pub const MESSAGE_SENT: &str = "message_sent";
    pub const MESSAGE_RECEIVED: &str = "message_received";
    pub const MESSAGE_DROPPED: &str = "message_dropped";

    // Node events
    pub const NODE_STATE_CHANGED: &str = "node_state_changed";
    pub const NODE_CRASHED: &str = "node_crashed";
    pub const NODE_RECOVERED: &str = "node_recovered";

    // Network events
    pub const PARTITION_CREATED: &str = "partition_created";
    pub const PARTITION_HEALED: &str = "partition_healed";

    // Algorithm events
    pub const LEADER_ELECTED: &str = "leader_elected";
    pub const VOTE_REQUESTED: &str = "vote_requested";
    pub const VOTE_CAST: &str = "vote_cast";
    pub const CONSENSUS_REACHED: &str = "consensus_reached";
    pub const LOG_APPENDED: &str = "log_appended";
    pub const LOG_COMMITTED: &str = "log_committed";

    // Transaction events
    pub const TRANSACTION_STARTED: &str = "transaction_started";
    pub const TRANSACTION_PREPARED: &str = "transaction_prepared";
    pub const TRANSACTION_COMMITTED: &str = "transaction_committed";
    pub const TRANSACTION_ABORTED: &str = "transaction_aborted";

    // Clock events
    pub const CLOCK_TICK: &str = "clock_tick";
    pub const CLOCK_MERGE: &str = "clock_merge";
    pub const CLOCK_UPDATE: &str = "clock_update";

    // Simulation lifecycle
    pub const SIMULATION_STARTED: &str = "simulation_started";
    pub const SIMULATION_STOPPED: &str = "simulation_stopped";
    pub const SIMULATION_PAUSED: &str = "simulation_paused";
    pub const SIMULATION_RESUMED: &str = "simulation_resumed";
    pub const SIMULATION_TICK: &str = "simulation_tick";
}

/// One observable event: a type tag, a timestamp, and a typed data map.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Epoch milliseconds at publication.
    pub timestamp: u64,
    pub data: StateMap,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: StateMap) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: now_millis(),
            data,
        }
    }

    /// Build an event from `(key, value)` pairs.
    pub fn with_fields<I>(event_type: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, serde_json::Value)>,
    {
        let data = fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self::new(event_type, data)
    }
}
