//! Event distribution: listeners, pull buffers, recording.

use crate::Event;
use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Function listener fired per event.
pub type Listener = Arc<dyn Fn(Event) + Send + Sync>;

/// Pull-style subscription: a bounded buffer the subscriber drains.
pub struct EventStream {
    rx: Receiver<Event>,
}

impl EventStream {
    /// Non-blocking pop of the next buffered event.
    pub fn try_next(&self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Fan-out bus for simulation events.
///
/// Emission never blocks: listeners are detached onto the runtime (invoked
/// inline when no runtime is present, e.g. in synchronous tests) and full
/// pull buffers drop the event for that subscriber. The subscriber set is
/// snapshotted before dispatch so no lock is held while running foreign code.
pub struct EventBus {
    listeners: RwLock<Vec<Listener>>,
    sync_listeners: RwLock<Vec<Listener>>,
    channels: RwLock<Vec<Sender<Event>>>,
    recording: Mutex<Option<Vec<Event>>>,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            sync_listeners: RwLock::new(Vec::new()),
            channels: RwLock::new(Vec::new()),
            recording: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a function listener.
    pub fn subscribe(&self, listener: Listener) {
        self.listeners.write().push(listener);
    }

    /// Register an inline listener, invoked on the emitter's thread in
    /// publication order. Must be cheap and non-blocking — the session
    /// manager uses this to keep its timeline causally consistent with
    /// event publication.
    pub fn subscribe_sync(&self, listener: Listener) {
        self.sync_listeners.write().push(listener);
    }

    /// Register a pull-style subscriber with the given buffer capacity.
    pub fn subscribe_channel(&self, capacity: usize) -> EventStream {
        let (tx, rx) = bounded(capacity);
        self.channels.write().push(tx);
        EventStream { rx }
    }

    /// Broadcast an event to every subscriber.
    pub fn emit(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        if let Some(buffer) = self.recording.lock().as_mut() {
            buffer.push(event.clone());
        }

        // Snapshot subscribers, then dispatch without holding any lock.
        let sync_listeners: Vec<Listener> = self.sync_listeners.read().clone();
        let listeners: Vec<Listener> = self.listeners.read().clone();
        let channels: Vec<Sender<Event>> = self.channels.read().clone();

        for listener in sync_listeners {
            listener(event.clone());
        }

        for listener in listeners {
            let event = event.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { listener(event) });
                }
                Err(_) => listener(event),
            }
        }

        for channel in channels {
            // Full buffer: drop the event for this subscriber.
            let _ = channel.try_send(event.clone());
        }
    }

    /// Begin buffering emitted events for later replay.
    pub fn start_recording(&self) {
        *self.recording.lock() = Some(Vec::new());
    }

    /// Stop recording and return the captured buffer.
    pub fn stop_recording(&self) -> Vec<Event> {
        self.recording.lock().take().unwrap_or_default()
    }

    /// Copy of the events captured so far, without stopping.
    pub fn recorded_events(&self) -> Vec<Event> {
        self.recording.lock().clone().unwrap_or_default()
    }

    /// Shut the bus down; subsequent emits are no-ops and pull subscribers
    /// observe disconnection once their buffers drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.listeners.write().clear();
        self.sync_listeners.write().clear();
        self.channels.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind;
    use distlab_types::StateMap;

    fn event(n: u64) -> Event {
        let mut data = StateMap::new();
        data.insert("n".into(), serde_json::json!(n));
        Event::new(kind::CLOCK_TICK, data)
    }

    #[test]
    fn test_channel_subscriber_receives_in_order() {
        let bus = EventBus::new();
        let stream = bus.subscribe_channel(8);
        bus.emit(event(1));
        bus.emit(event(2));
        let drained = stream.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].data["n"], serde_json::json!(1));
        assert_eq!(drained[1].data["n"], serde_json::json!(2));
    }

    #[test]
    fn test_full_buffer_drops_newest() {
        let bus = EventBus::new();
        let stream = bus.subscribe_channel(1);
        bus.emit(event(1));
        bus.emit(event(2)); // dropped
        let drained = stream.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].data["n"], serde_json::json!(1));
    }

    #[test]
    fn test_recording_captures_everything() {
        let bus = EventBus::new();
        bus.start_recording();
        bus.emit(event(1));
        bus.emit(event(2));
        let recorded = bus.stop_recording();
        assert_eq!(recorded.len(), 2);
        // A second stop returns nothing.
        assert!(bus.stop_recording().is_empty());
    }

    #[test]
    fn test_closed_bus_ignores_emit() {
        let bus = EventBus::new();
        let stream = bus.subscribe_channel(8);
        bus.close();
        bus.emit(event(1));
        assert!(stream.try_next().is_none());
    }

    #[tokio::test]
    async fn test_listener_fires_detached() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(Arc::new(move |event: Event| {
            let _ = tx.send(event.event_type);
        }));
        bus.emit(event(1));
        let received = rx.recv().await.unwrap();
        assert_eq!(received, kind::CLOCK_TICK);
    }
}
