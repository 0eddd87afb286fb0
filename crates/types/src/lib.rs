//! Core types shared by every distlab crate.
//!
//! This crate sits at the root of the workspace dependency graph and defines
//! the vocabulary the rest of the simulator speaks:
//!
//! - [`NodeId`]: stable string identity of a simulated node
//! - [`NodeStatus`]: lifecycle state of a node
//! - [`Envelope`]: one message in flight, with routing and clock metadata
//! - [`Inbox`]: the bounded per-node delivery queue

mod envelope;
mod inbox;
mod state;

pub use envelope::{now_millis, Envelope};
pub use inbox::Inbox;
pub use state::{LogEntry, NodeState};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Map of human-readable state fields exposed by nodes and sessions for
/// observers. Keys are wire-stable camelCase names.
pub type StateMap = serde_json::Map<String, serde_json::Value>;

/// Stable string identity of a simulated node (e.g. `"general-1"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state of a node.
///
/// Anything other than `Running` makes the node inert: inbound envelopes are
/// silently discarded and no outbound envelopes are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Crashed,
    Partitioned,
    Byzantine,
}

impl NodeStatus {
    /// Wire name, matching the lowercase serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Running => "running",
            NodeStatus::Crashed => "crashed",
            NodeStatus::Partitioned => "partitioned",
            NodeStatus::Byzantine => "byzantine",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display_and_eq() {
        let a = NodeId::new("node-1");
        let b = NodeId::from("node-1");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "node-1");
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(NodeStatus::Running.as_str(), "running");
        assert_eq!(NodeStatus::Byzantine.as_str(), "byzantine");
        assert_eq!(
            serde_json::to_string(&NodeStatus::Crashed).unwrap(),
            "\"crashed\""
        );
    }
}
