//! Connection hub: tracks observers and fans frames out to them.

use crate::session::Broadcaster;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-client outbound queue depth. A slow consumer that falls this far
/// behind starts losing frames; the simulation never blocks on it.
const CLIENT_QUEUE_CAPACITY: usize = 256;

/// Registry of connected observers with per-client bounded send queues.
pub struct Hub {
    clients: DashMap<u64, mpsc::Sender<String>>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a client; returns its id and the receiving end of its queue.
    pub fn register(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        self.clients.insert(id, tx);
        debug!(client = id, "client connected");
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        self.clients.remove(&id);
        debug!(client = id, "client disconnected");
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Queue a frame to every client. Full queues drop the frame for that
    /// client only.
    pub fn broadcast(&self, frame: String) {
        for entry in self.clients.iter() {
            let _ = entry.value().try_send(frame.clone());
        }
    }

    /// Queue a frame to one client.
    pub fn send_to(&self, id: u64, frame: String) {
        if let Some(tx) = self.clients.get(&id) {
            let _ = tx.try_send(frame);
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster for Hub {
    fn broadcast_json(&self, frame: serde_json::Value) {
        match serde_json::to_string(&frame) {
            Ok(text) => self.broadcast(text),
            Err(e) => warn!(error = %e, "failed to serialize broadcast frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_all_clients() {
        let hub = Hub::new();
        let (_a, mut rx_a) = hub.register();
        let (_b, mut rx_b) = hub.register();
        assert_eq!(hub.client_count(), 2);

        hub.broadcast("hello".to_string());
        assert_eq!(rx_a.recv().await.unwrap(), "hello");
        assert_eq!(rx_b.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_send_to_targets_one_client() {
        let hub = Hub::new();
        let (a, mut rx_a) = hub.register();
        let (_b, mut rx_b) = hub.register();

        hub.send_to(a, "direct".to_string());
        assert_eq!(rx_a.recv().await.unwrap(), "direct");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregistered_client_is_skipped() {
        let hub = Hub::new();
        let (a, mut rx_a) = hub.register();
        hub.unregister(a);
        hub.broadcast("gone".to_string());
        assert!(rx_a.recv().await.is_none());
    }
}
