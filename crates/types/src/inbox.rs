//! Bounded per-node delivery queue.

use crate::Envelope;
use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError};

/// Bounded FIFO buffer of envelopes.
///
/// Both ends are non-blocking: `push` fails silently on overflow (callers
/// must not depend on capacity) and `pop` returns `None` when empty. Safe to
/// share between the transport's delivery tasks and the owning node's tick.
pub struct Inbox {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    capacity: usize,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Enqueue an envelope. Returns `false` when the inbox is full.
    pub fn push(&self, env: Envelope) -> bool {
        self.tx.try_send(env).is_ok()
    }

    /// Dequeue the oldest envelope, if any.
    pub fn pop(&self) -> Option<Envelope> {
        match self.rx.try_recv() {
            Ok(env) => Some(env),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(n: u64) -> Envelope {
        Envelope::new("a".into(), "b".into(), "ping", serde_json::json!(n))
    }

    #[test]
    fn test_fifo_order() {
        let inbox = Inbox::new(8);
        assert!(inbox.push(env(1)));
        assert!(inbox.push(env(2)));
        assert_eq!(*inbox.pop().unwrap().payload, serde_json::json!(1));
        assert_eq!(*inbox.pop().unwrap().payload, serde_json::json!(2));
        assert!(inbox.pop().is_none());
    }

    #[test]
    fn test_overflow_fails_silently() {
        let inbox = Inbox::new(2);
        assert!(inbox.push(env(1)));
        assert!(inbox.push(env(2)));
        assert!(!inbox.push(env(3)));
        assert_eq!(inbox.len(), 2);
    }
}
