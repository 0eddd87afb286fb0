//! Wire frames for the session endpoint.
//!
//! Every frame is a UTF-8 JSON object carrying a `type` string. Consumers
//! must accept multiple concatenated objects separated by newlines — the
//! hub's write pump coalesces pending frames.

use distlab_types::StateMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Client → server commands.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    StartSimulation {
        project: String,
        #[serde(default)]
        scenario: Option<String>,
        #[serde(default)]
        config: StartConfig,
    },
    PauseSimulation,
    ResumeSimulation,
    StopSimulation,
    StepForward,
    SetSpeed {
        speed: f64,
    },
    InjectCrash {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    RecoverNode {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    InjectPartition {
        from: String,
        to: String,
        #[serde(default)]
        bidirectional: bool,
    },
    HealPartition {
        from: String,
        to: String,
        #[serde(default)]
        bidirectional: bool,
    },
    GetState,
}

/// Optional `config` object on `start_simulation`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartConfig {
    #[serde(default, rename = "nodeCount")]
    pub node_count: Option<usize>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default, rename = "stepMode")]
    pub step_mode: bool,
}

/// One bounded-timeline entry.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TimelineEvent {
    /// Arrival time at the manager, epoch milliseconds.
    pub time: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StateMap,
}

/// `error{code,message}` frame.
pub fn error_frame(code: &str, message: &str) -> serde_json::Value {
    json!({ "type": "error", "code": code, "message": message })
}

/// `timeline_event` wrapper frame.
pub fn timeline_frame(event: &TimelineEvent) -> serde_json::Value {
    json!({ "type": "timeline_event", "event": event })
}

/// Typed mirror frame for event kinds observers consume directly, or `None`
/// for events that only travel inside the timeline.
pub fn mirror_frame(event_type: &str, data: &StateMap) -> Option<serde_json::Value> {
    let frame = |frame_type: &str| {
        let mut object = serde_json::Map::new();
        object.insert("type".into(), json!(frame_type));
        for (key, value) in data {
            object.insert(key.clone(), value.clone());
        }
        serde_json::Value::Object(object)
    };

    match event_type {
        "message_sent" | "message_received" | "message_dropped" | "leader_elected"
        | "consensus_reached" | "clock_update" => Some(frame(event_type)),
        "node_state_changed" => Some(frame("node_state_update")),
        "transaction_started" | "transaction_prepared" | "transaction_committed"
        | "transaction_aborted" => {
            let mut object = frame("transaction_state");
            if let Some(map) = object.as_object_mut() {
                map.insert(
                    "state".into(),
                    json!(event_type.trim_start_matches("transaction_")),
                );
            }
            Some(object)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_simulation() {
        let frame = r#"{"type":"start_simulation","project":"two-generals","scenario":"no_loss","config":{"nodeCount":2,"speed":2.0,"stepMode":true}}"#;
        let cmd: ClientCommand = serde_json::from_str(frame).unwrap();
        match cmd {
            ClientCommand::StartSimulation {
                project,
                scenario,
                config,
            } => {
                assert_eq!(project, "two-generals");
                assert_eq!(scenario.as_deref(), Some("no_loss"));
                assert_eq!(config.node_count, Some(2));
                assert_eq!(config.speed, Some(2.0));
                assert!(config.step_mode);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_commands_without_optional_fields() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"start_simulation","project":"clocks"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::StartSimulation { .. }));

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"inject_partition","from":"a","to":"b"}"#).unwrap();
        match cmd {
            ClientCommand::InjectPartition { bidirectional, .. } => assert!(!bidirectional),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frame_is_an_error() {
        assert!(serde_json::from_str::<ClientCommand>("not json").is_err());
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"warp_drive"}"#).is_err());
    }

    #[test]
    fn test_mirror_frames() {
        let mut data = StateMap::new();
        data.insert("nodeId".into(), json!("n1"));

        let mirrored = mirror_frame("node_state_changed", &data).unwrap();
        assert_eq!(mirrored["type"], json!("node_state_update"));
        assert_eq!(mirrored["nodeId"], json!("n1"));

        let tx = mirror_frame("transaction_committed", &data).unwrap();
        assert_eq!(tx["type"], json!("transaction_state"));
        assert_eq!(tx["state"], json!("committed"));

        assert!(mirror_frame("simulation_tick", &data).is_none());
    }
}
