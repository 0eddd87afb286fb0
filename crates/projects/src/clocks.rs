//! Logical Clocks visualization.
//!
//! N nodes mix local events, random sends, and receives; every event is
//! stamped with both clocks and recorded as a causal event for the
//! space-time diagram and the causality quiz. The network has latency but
//! no loss — the scenario teaches ordering, not fault tolerance.

use crate::{Project, ProjectConfig, ProjectContext, ProjectError};
use distlab_clock::{compare_vector_clocks, CausalRelation, LamportClock, VectorClock, VectorSnapshot};
use distlab_engine::Engine;
use distlab_node::{BaseNode, TickNode};
use distlab_types::{now_millis, Envelope, NodeId, NodeState, StateMap};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MSG_EVENT: &str = "event";

/// Probability that an idle tick performs any activity at all.
const ACTIVITY_PROBABILITY: f64 = 0.3;

/// Clocks scenario parameters.
#[derive(Debug, Clone)]
pub struct ClocksConfig {
    pub node_count: usize,
}

impl Default for ClocksConfig {
    fn default() -> Self {
        Self { node_count: 3 }
    }
}

/// One recorded point in the space-time diagram.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CausalEvent {
    pub id: String,
    pub node_id: NodeId,
    /// `"local"`, `"send"`, or `"receive"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub time: u64,
    pub lamport_time: u64,
    pub vector_clock: VectorSnapshot,
    /// For receives: the envelope id that links back to the send.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_to: Option<String>,
}

struct ClockNode {
    base: BaseNode,
    lamport: LamportClock,
    vector: VectorClock,
    event_count: AtomicU64,
    node_ids: Vec<NodeId>,
    events: Arc<Mutex<Vec<CausalEvent>>>,
    rng: Mutex<ChaCha8Rng>,
}

impl ClockNode {
    fn record_event(
        &self,
        kind: &str,
        lamport_time: u64,
        vector_clock: VectorSnapshot,
        related_to: Option<String>,
    ) -> String {
        let count = self.event_count.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}-{}-{}", self.base.id(), kind, count);
        self.events.lock().push(CausalEvent {
            id: id.clone(),
            node_id: self.base.id().clone(),
            kind: kind.to_string(),
            time: now_millis(),
            lamport_time,
            vector_clock,
            related_to,
        });
        id
    }

    fn emit_clock_update(&self, event_type: &str, lamport_time: u64, vector: &VectorSnapshot) {
        self.base.emit(
            distlab_events::kind::CLOCK_UPDATE,
            [
                ("nodeId", json!(self.base.id())),
                ("lamportTime", json!(lamport_time)),
                ("vectorClock", json!(vector)),
                ("eventType", json!(event_type)),
            ],
        );
    }

    fn process_message(&self, env: Envelope) {
        let vector = match &env.vector_clock {
            Some(remote) => self.vector.merge(remote),
            None => self.vector.increment(),
        };
        let lamport = match env.lamport_time {
            Some(remote) => self.lamport.update(remote),
            None => self.lamport.tick(),
        };

        self.record_event("receive", lamport, vector.clone(), Some(env.id.clone()));

        self.base.emit(
            distlab_events::kind::MESSAGE_RECEIVED,
            [
                ("messageId", json!(env.id)),
                ("from", json!(env.from)),
                ("to", json!(env.to)),
                ("messageType", json!(env.message_type)),
                ("clock", json!(vector)),
            ],
        );
        self.emit_clock_update("receive", lamport, &vector);
    }

    fn perform_local_event(&self) {
        let lamport = self.lamport.tick();
        let vector = self.vector.increment();
        self.record_event("local", lamport, vector.clone(), None);
        self.emit_clock_update("local", lamport, &vector);
    }

    fn send_message_to(&self, target: &NodeId) {
        let lamport = self.lamport.tick();
        let vector = self.vector.increment();
        let event_id = self.record_event("send", lamport, vector.clone(), None);

        let env = Envelope::new(
            self.base.id().clone(),
            target.clone(),
            MSG_EVENT,
            json!({
                "eventId": event_id,
                "message": format!("message from {}", self.base.id()),
            }),
        )
        .with_lamport(lamport)
        .with_vector_clock(vector.clone());

        self.base.emit(
            distlab_events::kind::MESSAGE_SENT,
            [
                ("messageId", json!(env.id)),
                ("from", json!(env.from)),
                ("to", json!(env.to)),
                ("messageType", json!(env.message_type)),
                ("clock", json!(vector)),
            ],
        );
        self.emit_clock_update("send", lamport, &vector);
        self.base.send(env);
    }

    fn send_random_message(&self) {
        let target = {
            let mut rng = self.rng.lock();
            loop {
                let candidate = &self.node_ids[rng.gen_range(0..self.node_ids.len())];
                if candidate != self.base.id() {
                    break candidate.clone();
                }
            }
        };
        self.send_message_to(&target);
    }

    fn node_state(&self) -> NodeState {
        let mut custom = StateMap::new();
        custom.insert("lamportTime".into(), json!(self.lamport.time()));
        custom.insert(
            "eventCount".into(),
            json!(self.event_count.load(Ordering::SeqCst)),
        );

        let mut node = NodeState::new(self.base.id().as_str(), self.base.status().as_str());
        node.role = Some("participant".to_string());
        node.clock = Some(self.vector.snapshot());
        node.custom_state = Some(custom);
        node
    }
}

impl TickNode for ClockNode {
    fn id(&self) -> &NodeId {
        self.base.id()
    }

    fn tick(&self) {
        if !self.base.is_running() {
            return;
        }

        if let Some(env) = self.base.pop_message() {
            self.process_message(env);
            return;
        }

        let (active, local) = {
            let mut rng = self.rng.lock();
            (rng.gen::<f64>() < ACTIVITY_PROBABILITY, rng.gen_bool(0.5))
        };
        if active {
            if local {
                self.perform_local_event();
            } else {
                self.send_random_message();
            }
        }
    }

    fn snapshot(&self) -> StateMap {
        let mut map = self.base.snapshot_base();
        map.insert("lamportTime".into(), json!(self.lamport.time()));
        map.insert("vectorClock".into(), json!(self.vector.snapshot()));
        map
    }

    fn crash(&self) {
        self.base.crash();
    }

    fn recover(&self) {
        self.base.recover();
    }
}

/// The Logical Clocks plugin.
pub struct ClocksProject {
    engine: Arc<Engine>,
    nodes: Vec<Arc<ClockNode>>,
    events: Arc<Mutex<Vec<CausalEvent>>>,
}

impl ClocksProject {
    pub fn new(config: ClocksConfig, run: ProjectConfig, ctx: ProjectContext) -> Self {
        let node_count = run.node_count.unwrap_or(config.node_count).max(2);

        ctx.transport
            .set_latency(Duration::from_millis(50), Duration::from_millis(150));
        ctx.transport.set_packet_loss(0.0);

        let node_ids: Vec<NodeId> = (1..=node_count)
            .map(|i| NodeId::new(format!("node-{i}")))
            .collect();
        let events: Arc<Mutex<Vec<CausalEvent>>> = Arc::new(Mutex::new(Vec::new()));

        let mut base_rng = run.rng();
        let nodes: Vec<Arc<ClockNode>> = node_ids
            .iter()
            .map(|id| {
                let transport = Arc::clone(&ctx.transport);
                let seed: u64 = base_rng.gen();
                Arc::new(ClockNode {
                    base: BaseNode::new(
                        id.clone(),
                        Arc::new(move |env| transport.send(env)),
                        Arc::clone(&ctx.bus),
                    ),
                    lamport: LamportClock::new(),
                    vector: VectorClock::new(id.clone(), &node_ids),
                    event_count: AtomicU64::new(0),
                    node_ids: node_ids.clone(),
                    events: Arc::clone(&events),
                    rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
                })
            })
            .collect();

        for node in &nodes {
            let target = Arc::clone(node);
            ctx.transport.register_handler(
                node.base.id().clone(),
                Arc::new(move |env| target.base.receive(env)),
            );
            ctx.engine.add_node(Arc::clone(node) as Arc<dyn TickNode>);
        }

        Self {
            engine: ctx.engine,
            nodes,
            events,
        }
    }

    /// All recorded causal events, in recording order.
    pub fn events(&self) -> Vec<CausalEvent> {
        self.events.lock().clone()
    }

    fn find(&self, node: &NodeId) -> Option<&Arc<ClockNode>> {
        self.nodes.iter().find(|n| n.base.id() == node)
    }
}

impl Project for ClocksProject {
    fn start(&self) {
        self.engine.start();
    }

    fn stop(&self) {
        self.engine.stop();
    }

    fn node_states(&self) -> BTreeMap<String, NodeState> {
        self.nodes
            .iter()
            .map(|n| (n.base.id().to_string(), n.node_state()))
            .collect()
    }

    fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.base.id().clone()).collect()
    }

    fn crash_node(&self, node: &NodeId) -> Result<(), ProjectError> {
        self.find(node)
            .map(|n| n.base.crash())
            .ok_or_else(|| ProjectError::UnknownNode(node.clone()))
    }

    fn recover_node(&self, node: &NodeId) -> Result<(), ProjectError> {
        self.find(node)
            .map(|n| n.base.recover())
            .ok_or_else(|| ProjectError::UnknownNode(node.clone()))
    }

    fn compare_events(&self, event_a: &str, event_b: &str) -> &'static str {
        let events = self.events.lock();
        let a = events.iter().find(|e| e.id == event_a);
        let b = events.iter().find(|e| e.id == event_b);
        let (Some(a), Some(b)) = (a, b) else {
            return "unknown";
        };
        match compare_vector_clocks(&a.vector_clock, &b.vector_clock) {
            CausalRelation::HappensBefore => "before",
            CausalRelation::HappensAfter => "after",
            CausalRelation::Concurrent => "concurrent",
            CausalRelation::Equal => "equal",
        }
    }
}
