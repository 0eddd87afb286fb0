//! Observer-facing node state snapshot.

use crate::{NodeId, StateMap};
use serde::Serialize;
use std::collections::BTreeMap;

/// One entry in a replicated log (quorum/consensus projects).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: serde_json::Value,
}

/// Per-node snapshot published in `simulation_state` frames.
///
/// Only the fields a project actually fills are serialized; everything else
/// is elided from the frame.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voted_for: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<Vec<LogEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock: Option<BTreeMap<NodeId, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_state: Option<StateMap>,
}

impl NodeState {
    pub fn new(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
            ..Default::default()
        }
    }
}
