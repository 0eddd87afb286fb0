//! Message envelope: routing metadata plus optional clock stamps.

use crate::NodeId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

static ENVELOPE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One message in flight.
///
/// Immutable after creation; the transport stamps `received_at` on the
/// delivery clone, never on the sender's copy. The payload is shared between
/// clones — only clock maps and metadata are deep-copied.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique per-process id (`"msg-<n>"`).
    pub id: String,
    pub from: NodeId,
    pub to: NodeId,
    /// Message type tag, defined by the sending plugin.
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: Arc<serde_json::Value>,
    /// Send time, epoch milliseconds.
    pub sent_at: u64,
    /// Delivery time, epoch milliseconds. `None` until delivered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<u64>,
    /// Sender's Lamport clock at send time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lamport_time: Option<u64>,
    /// Sender's vector clock snapshot at send time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_clock: Option<BTreeMap<NodeId, u64>>,
    /// Free-form per-message metadata.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Envelope {
    /// Create an envelope with a fresh unique id and the current send time.
    pub fn new(
        from: NodeId,
        to: NodeId,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("msg-{}", ENVELOPE_SEQ.fetch_add(1, Ordering::Relaxed)),
            from,
            to,
            message_type: message_type.into(),
            payload: Arc::new(payload),
            sent_at: now_millis(),
            received_at: None,
            lamport_time: None,
            vector_clock: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a Lamport timestamp before handing to the transport.
    pub fn with_lamport(mut self, time: u64) -> Self {
        self.lamport_time = Some(time);
        self
    }

    /// Attach a vector clock snapshot before handing to the transport.
    pub fn with_vector_clock(mut self, clock: BTreeMap<NodeId, u64>) -> Self {
        self.vector_clock = Some(clock);
        self
    }

    /// Clone for delivery: deep-copies clock map and metadata, shares the
    /// payload allocation, and stamps the receive time.
    pub fn clone_for_delivery(&self, received_at: u64) -> Self {
        let mut clone = self.clone();
        clone.received_at = Some(received_at);
        clone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = Envelope::new("a".into(), "b".into(), "ping", serde_json::json!({}));
        let b = Envelope::new("a".into(), "b".into(), "ping", serde_json::json!({}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_delivery_clone_shares_payload() {
        let env = Envelope::new(
            "a".into(),
            "b".into(),
            "ping",
            serde_json::json!({"n": 1}),
        )
        .with_vector_clock(BTreeMap::from([("a".into(), 3u64)]));

        let delivered = env.clone_for_delivery(env.sent_at + 5);
        assert!(Arc::ptr_eq(&env.payload, &delivered.payload));
        assert_eq!(delivered.received_at, Some(env.sent_at + 5));
        assert!(env.received_at.is_none());

        // The clock map is an independent copy.
        let mut mutated = delivered.clone();
        mutated
            .vector_clock
            .as_mut()
            .unwrap()
            .insert("b".into(), 9);
        assert_eq!(env.vector_clock.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_receive_not_before_send() {
        let env = Envelope::new("a".into(), "b".into(), "ping", serde_json::json!(null));
        let delivered = env.clone_for_delivery(now_millis());
        assert!(delivered.received_at.unwrap() >= delivered.sent_at);
    }
}
