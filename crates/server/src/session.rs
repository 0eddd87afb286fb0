//! Per-endpoint session facade.
//!
//! One manager owns the live engine + transport + plugin, funnels every
//! published event into a bounded timeline, and fans state out to all
//! observers. Starting a new session tears the previous one down first;
//! commands racing a teardown no-op cleanly.

use crate::protocol::{mirror_frame, timeline_frame, TimelineEvent};
use distlab_engine::{Engine, EngineConfig};
use distlab_events::{Event, EventBus};
use distlab_injector::{Injector, LinkFaults, NodeFaults};
use distlab_network::{DropReason, NetworkTransport};
use distlab_projects::{build_project, Project, ProjectConfig, ProjectContext, ProjectError};
use distlab_types::{now_millis, Envelope, NodeId};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Default timeline length; the oldest entry is dropped beyond the cap.
const DEFAULT_TIMELINE_CAP: usize = 100;

/// Sink for server → client frames. Implemented by the hub; tests plug in
/// collectors.
pub trait Broadcaster: Send + Sync {
    fn broadcast_json(&self, frame: serde_json::Value);
}

/// Errors surfaced to the commanding observer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown node: {0}")]
    UnknownNode(String),
}

impl From<ProjectError> for SessionError {
    fn from(e: ProjectError) -> Self {
        match e {
            ProjectError::UnknownNode(node) => SessionError::UnknownNode(node.to_string()),
        }
    }
}

/// Options resolved from the `start_simulation` command. The seed is an
/// internal knob (tests, reproduction) — it is not part of the wire config.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub node_count: Option<usize>,
    pub speed: Option<f64>,
    pub step_mode: bool,
    pub seed: Option<u64>,
}

struct ActiveSession {
    engine: Arc<Engine>,
    transport: Arc<NetworkTransport>,
    bus: Arc<EventBus>,
    project: Arc<dyn Project>,
    injector: Arc<Injector>,
    project_id: String,
    scenario: String,
}

/// The session facade: builds, owns, and tears down one simulation at a
/// time, and publishes its state and timeline.
pub struct SessionManager {
    broadcaster: Arc<dyn Broadcaster>,
    active: Mutex<Option<ActiveSession>>,
    timeline: Mutex<VecDeque<TimelineEvent>>,
    timeline_cap: usize,
}

/// Forwards injector crash/recover calls to the active plugin. Unknown
/// targets are ignored here — the command layer validates first.
struct ProjectFaults(Arc<dyn Project>);

impl NodeFaults for ProjectFaults {
    fn crash_node(&self, node: &NodeId) {
        let _ = self.0.crash_node(node);
    }
    fn recover_node(&self, node: &NodeId) {
        let _ = self.0.recover_node(node);
    }
}

/// Forwards injector link mutations to the transport.
struct TransportFaults(Arc<NetworkTransport>);

impl LinkFaults for TransportFaults {
    fn create_partition(&self, from: &NodeId, to: &NodeId) {
        self.0.set_partition(from.clone(), to.clone(), true);
    }
    fn heal_partition(&self, from: &NodeId, to: &NodeId) {
        self.0.set_partition(from.clone(), to.clone(), false);
    }
    fn set_latency(&self, min: Duration, max: Duration) {
        self.0.set_latency(min, max);
    }
}

impl SessionManager {
    pub fn new(broadcaster: Arc<dyn Broadcaster>) -> Arc<Self> {
        Self::with_timeline_cap(broadcaster, DEFAULT_TIMELINE_CAP)
    }

    pub fn with_timeline_cap(broadcaster: Arc<dyn Broadcaster>, timeline_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            broadcaster,
            active: Mutex::new(None),
            timeline: Mutex::new(VecDeque::new()),
            timeline_cap,
        })
    }

    // ─── Event Funnel ───

    /// Every plugin- and injector-emitted event lands here: appended to the
    /// bounded timeline, wrapped as a `timeline_event` frame, and mirrored
    /// as a typed frame where observers consume one directly.
    fn handle_event(&self, event: Event) {
        let entry = TimelineEvent {
            time: now_millis(),
            event_type: event.event_type.clone(),
            data: event.data.clone(),
        };
        {
            let mut timeline = self.timeline.lock();
            timeline.push_back(entry.clone());
            if timeline.len() > self.timeline_cap {
                timeline.pop_front();
            }
        }

        self.broadcaster.broadcast_json(timeline_frame(&entry));
        if let Some(mirror) = mirror_frame(&event.event_type, &event.data) {
            self.broadcaster.broadcast_json(mirror);
        }
    }

    // ─── Lifecycle Commands ───

    /// Build and start a session, tearing down any prior one first.
    pub fn start(
        self: &Arc<Self>,
        project_id: &str,
        scenario: &str,
        options: SessionOptions,
    ) -> Result<(), SessionError> {
        self.teardown();
        self.timeline.lock().clear();

        let bus = Arc::new(EventBus::new());
        let manager = Arc::clone(self);
        bus.subscribe_sync(Arc::new(move |event| manager.handle_event(event)));

        let transport = Arc::new(match options.seed {
            Some(seed) => NetworkTransport::with_seed(seed),
            None => NetworkTransport::new(),
        });

        // Network drops surface as observable events, not errors.
        let drop_bus = Arc::clone(&bus);
        transport.on_drop(Arc::new(move |env: &Envelope, reason: DropReason| {
            drop_bus.emit(Event::with_fields(
                distlab_events::kind::MESSAGE_DROPPED,
                [
                    ("messageId", json!(env.id)),
                    ("from", json!(env.from)),
                    ("to", json!(env.to)),
                    ("messageType", json!(env.message_type)),
                    ("reason", json!(reason.as_str())),
                ],
            ));
        }));

        let engine = Arc::new(Engine::new(
            Arc::clone(&bus),
            EngineConfig {
                speed: options.speed.unwrap_or(1.0),
                tick_rate: Duration::from_millis(100),
                step_mode: options.step_mode,
            },
        ));

        let project = build_project(
            project_id,
            ProjectConfig {
                node_count: options.node_count,
                scenario: Some(scenario.to_string()),
                seed: options.seed,
            },
            ProjectContext {
                engine: Arc::clone(&engine),
                transport: Arc::clone(&transport),
                bus: Arc::clone(&bus),
            },
        );

        let injector = Arc::new(Injector::new(
            Arc::new(ProjectFaults(Arc::clone(&project))),
            Arc::new(TransportFaults(Arc::clone(&transport))),
            Arc::clone(&bus),
            engine.virtual_time(),
        ));
        injector.start();

        project.start();
        info!(project = project_id, scenario, "session started");

        *self.active.lock() = Some(ActiveSession {
            engine,
            transport,
            bus,
            project,
            injector,
            project_id: project_id.to_string(),
            scenario: scenario.to_string(),
        });

        self.broadcast_state();
        Ok(())
    }

    /// Tear the session down and tell observers it is gone.
    pub fn stop(&self) {
        self.teardown();
        self.broadcast_state();
    }

    fn teardown(&self) {
        let Some(session) = self.active.lock().take() else {
            return;
        };
        info!(project = %session.project_id, "session stopped");
        session.project.stop();
        session.injector.stop();
        session.transport.close();
        session.bus.close();
    }

    // ─── Engine Commands ───

    pub fn pause(&self) {
        if let Some(session) = &*self.active.lock() {
            session.engine.pause();
        }
        self.broadcast_state();
    }

    pub fn resume(&self) {
        if let Some(session) = &*self.active.lock() {
            session.engine.resume();
        }
        self.broadcast_state();
    }

    pub fn step(&self) {
        if let Some(session) = &*self.active.lock() {
            session.engine.step();
        }
        self.broadcast_state();
    }

    pub fn set_speed(&self, speed: f64) {
        if let Some(session) = &*self.active.lock() {
            session.engine.set_speed(speed);
        }
    }

    // ─── Fault Commands ───

    pub fn crash_node(&self, node: &NodeId) -> Result<(), SessionError> {
        let injector = {
            let active = self.active.lock();
            let Some(session) = &*active else {
                return Ok(());
            };
            if !session.project.node_ids().contains(node) {
                return Err(SessionError::UnknownNode(node.to_string()));
            }
            Arc::clone(&session.injector)
        };
        injector.inject_crash(node);
        self.broadcast_state();
        Ok(())
    }

    pub fn recover_node(&self, node: &NodeId) -> Result<(), SessionError> {
        let injector = {
            let active = self.active.lock();
            let Some(session) = &*active else {
                return Ok(());
            };
            if !session.project.node_ids().contains(node) {
                return Err(SessionError::UnknownNode(node.to_string()));
            }
            Arc::clone(&session.injector)
        };
        injector.recover_node(node);
        self.broadcast_state();
        Ok(())
    }

    pub fn inject_partition(&self, from: &NodeId, to: &NodeId, bidirectional: bool) {
        let injector = {
            let active = self.active.lock();
            match &*active {
                Some(session) => Arc::clone(&session.injector),
                None => return,
            }
        };
        injector.inject_partition(from, to, bidirectional);
        self.broadcast_state();
    }

    pub fn heal_partition(&self, from: &NodeId, to: &NodeId, bidirectional: bool) {
        let injector = {
            let active = self.active.lock();
            match &*active {
                Some(session) => Arc::clone(&session.injector),
                None => return,
            }
        };
        injector.heal_partition(from, to, bidirectional);
        self.broadcast_state();
    }

    // ─── State ───

    /// Full `simulation_state` frame.
    pub fn get_state(&self) -> serde_json::Value {
        let timeline: Vec<TimelineEvent> = self.timeline.lock().iter().cloned().collect();
        let active = self.active.lock();
        match &*active {
            Some(session) => json!({
                "type": "simulation_state",
                "virtualTime": session.engine.virtual_time().now_millis(),
                "mode": session.engine.mode().as_str(),
                "speed": session.engine.speed(),
                "running": session.engine.is_running(),
                "project": session.project_id,
                "scenario": session.scenario,
                "nodes": session.project.node_states(),
                "timeline": timeline,
            }),
            None => json!({
                "type": "simulation_state",
                "virtualTime": now_millis(),
                "mode": "paused",
                "speed": 1.0,
                "running": false,
                "nodes": {},
                "timeline": timeline,
            }),
        }
    }

    /// Causality query forwarded to the active plugin.
    pub fn compare_events(&self, event_a: &str, event_b: &str) -> &'static str {
        match &*self.active.lock() {
            Some(session) => session.project.compare_events(event_a, event_b),
            None => "unknown",
        }
    }

    pub fn broadcast_state(&self) {
        self.broadcaster.broadcast_json(self.get_state());
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .map(|s| s.engine.is_running())
            .unwrap_or(false)
    }

    /// Timeline snapshot, oldest first.
    pub fn timeline(&self) -> Vec<TimelineEvent> {
        self.timeline.lock().iter().cloned().collect()
    }

    // Test and tooling accessors; the wire protocol never exposes these.

    pub fn project(&self) -> Option<Arc<dyn Project>> {
        self.active.lock().as_ref().map(|s| Arc::clone(&s.project))
    }

    pub fn engine(&self) -> Option<Arc<Engine>> {
        self.active.lock().as_ref().map(|s| Arc::clone(&s.engine))
    }

    pub fn transport(&self) -> Option<Arc<NetworkTransport>> {
        self.active.lock().as_ref().map(|s| Arc::clone(&s.transport))
    }

    pub fn bus(&self) -> Option<Arc<EventBus>> {
        self.active.lock().as_ref().map(|s| Arc::clone(&s.bus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    pub(crate) struct Collector {
        pub frames: PlMutex<Vec<serde_json::Value>>,
    }

    impl Collector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: PlMutex::new(Vec::new()),
            })
        }
    }

    impl Broadcaster for Collector {
        fn broadcast_json(&self, frame: serde_json::Value) {
            self.frames.lock().push(frame);
        }
    }

    #[tokio::test]
    async fn test_start_broadcasts_initial_state() {
        let collector = Collector::new();
        let manager = SessionManager::new(collector.clone());
        manager
            .start(
                "two-generals",
                "no_loss",
                SessionOptions {
                    step_mode: true,
                    seed: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();

        let frames = collector.frames.lock();
        let state = frames
            .iter()
            .find(|f| f["type"] == json!("simulation_state"))
            .expect("initial state frame");
        assert_eq!(state["running"], json!(true));
        assert!(state["nodes"]["general-1"].is_object());
        drop(frames);
        manager.stop();
    }

    #[tokio::test]
    async fn test_restart_replaces_session() {
        let collector = Collector::new();
        let manager = SessionManager::new(collector.clone());
        manager
            .start("clocks", "", SessionOptions {
                step_mode: true,
                seed: Some(1),
                ..Default::default()
            })
            .unwrap();
        let first_engine = manager.engine().unwrap();

        manager
            .start("byzantine", "", SessionOptions {
                step_mode: true,
                seed: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert!(!first_engine.is_running(), "old engine must be stopped");
        assert!(manager.is_running());
        assert_eq!(manager.project().unwrap().node_ids().len(), 4);
        manager.stop();
    }

    #[tokio::test]
    async fn test_crash_unknown_node_is_an_error() {
        let collector = Collector::new();
        let manager = SessionManager::new(collector.clone());
        manager
            .start("clocks", "", SessionOptions {
                step_mode: true,
                seed: Some(1),
                ..Default::default()
            })
            .unwrap();

        assert!(matches!(
            manager.crash_node(&"node-99".into()),
            Err(SessionError::UnknownNode(_))
        ));
        assert!(manager.crash_node(&"node-1".into()).is_ok());
        manager.stop();
    }

    #[tokio::test]
    async fn test_commands_after_stop_are_noops() {
        let collector = Collector::new();
        let manager = SessionManager::new(collector.clone());
        manager
            .start("clocks", "", SessionOptions {
                step_mode: true,
                seed: Some(1),
                ..Default::default()
            })
            .unwrap();
        manager.stop();

        // None of these may panic or resurrect the session.
        manager.pause();
        manager.resume();
        manager.step();
        manager.set_speed(4.0);
        assert!(manager.crash_node(&"node-1".into()).is_ok());
        manager.inject_partition(&"node-1".into(), &"node-2".into(), true);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_timeline_is_bounded() {
        let collector = Collector::new();
        let manager = SessionManager::new(collector.clone());
        manager
            .start("clocks", "", SessionOptions {
                step_mode: true,
                seed: Some(1),
                ..Default::default()
            })
            .unwrap();

        let bus = manager.bus().unwrap();
        for i in 0..300 {
            bus.emit(Event::with_fields(
                distlab_events::kind::CLOCK_TICK,
                [("i", json!(i))],
            ));
        }
        let timeline = manager.timeline();
        assert!(timeline.len() <= DEFAULT_TIMELINE_CAP);
        // Oldest entries were dropped: the tail is the most recent emit.
        assert_eq!(timeline.last().unwrap().data["i"], json!(299));
        manager.stop();
    }

    #[tokio::test]
    async fn test_dropped_messages_become_events() {
        let collector = Collector::new();
        let manager = SessionManager::new(collector.clone());
        manager
            .start(
                "two-generals",
                "high_loss",
                SessionOptions {
                    step_mode: true,
                    seed: Some(7),
                    ..Default::default()
                },
            )
            .unwrap();

        let transport = manager.transport().unwrap();
        transport.set_packet_loss(1.0);
        transport.send(Envelope::new(
            "general-1".into(),
            "general-2".into(),
            "propose",
            json!({}),
        ));

        let frames = collector.frames.lock();
        let dropped = frames
            .iter()
            .find(|f| f["type"] == json!("message_dropped"))
            .expect("mirror frame for drop");
        assert_eq!(dropped["reason"], json!("packet_loss"));
        drop(frames);
        manager.stop();
    }
}
