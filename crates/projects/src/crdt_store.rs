//! Replicated CRDT store.
//!
//! N replicas each hold a PN-counter and an LWW-register, mutate them
//! locally, and gossip full state to random peers. Merges are join
//! operations, so replicas converge once gossip quiesces regardless of
//! delivery order.

use crate::{Project, ProjectConfig, ProjectContext, ProjectError};
use distlab_crdt::{LwwRegister, PNCounter};
use distlab_engine::Engine;
use distlab_node::{BaseNode, TickNode};
use distlab_types::{now_millis, Envelope, NodeId, NodeState, StateMap};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MSG_STATE_SYNC: &str = "state_sync";

const ACTIVITY_PROBABILITY: f64 = 0.3;

const REGISTER_WORDS: &[&str] = &["amber", "cobalt", "crimson", "jade", "umber"];

/// CRDT store scenario parameters.
#[derive(Debug, Clone)]
pub struct CrdtStoreConfig {
    pub node_count: usize,
}

impl Default for CrdtStoreConfig {
    fn default() -> Self {
        Self { node_count: 3 }
    }
}

struct CrdtNode {
    base: BaseNode,
    counter: Mutex<PNCounter>,
    register: Mutex<LwwRegister>,
    local_ops: AtomicU64,
    merges: AtomicU64,
    node_ids: Vec<NodeId>,
    rng: Mutex<ChaCha8Rng>,
}

impl CrdtNode {
    fn process_message(&self, env: Envelope) {
        if env.message_type != MSG_STATE_SYNC {
            return;
        }
        let Ok(remote_counter) =
            serde_json::from_value::<PNCounter>(env.payload["counter"].clone())
        else {
            return;
        };
        let Ok(remote_register) =
            serde_json::from_value::<LwwRegister>(env.payload["register"].clone())
        else {
            return;
        };

        self.counter.lock().merge(&remote_counter);
        self.register.lock().merge(&remote_register);
        self.merges.fetch_add(1, Ordering::SeqCst);

        self.base.emit(
            distlab_events::kind::CLOCK_MERGE,
            [
                ("nodeId", json!(self.base.id())),
                ("from", json!(env.from)),
                ("counterValue", json!(self.counter.lock().value())),
            ],
        );
    }

    fn mutate_locally(&self) {
        let description = {
            let mut rng = self.rng.lock();
            let draw: f64 = rng.gen();
            if draw < 0.6 {
                let amount = rng.gen_range(1..=3);
                let value = self.counter.lock().increment(amount);
                format!("increment({amount}) -> {value}")
            } else if draw < 0.8 {
                let amount = rng.gen_range(1..=2);
                let value = self.counter.lock().decrement(amount);
                format!("decrement({amount}) -> {value}")
            } else {
                let word = REGISTER_WORDS[rng.gen_range(0..REGISTER_WORDS.len())];
                self.register.lock().set(json!(word), now_millis());
                format!("set({word})")
            }
        };
        self.local_ops.fetch_add(1, Ordering::SeqCst);

        self.base.emit(
            distlab_events::kind::LOG_APPENDED,
            [
                ("nodeId", json!(self.base.id())),
                ("operation", json!(description)),
            ],
        );
    }

    fn gossip_state(&self) {
        let target = {
            let mut rng = self.rng.lock();
            loop {
                let candidate = &self.node_ids[rng.gen_range(0..self.node_ids.len())];
                if candidate != self.base.id() {
                    break candidate.clone();
                }
            }
        };

        let payload = json!({
            "counter": &*self.counter.lock(),
            "register": &*self.register.lock(),
        });
        let env = Envelope::new(self.base.id().clone(), target, MSG_STATE_SYNC, payload);
        self.base.emit(
            distlab_events::kind::MESSAGE_SENT,
            [
                ("messageId", json!(env.id)),
                ("from", json!(env.from)),
                ("to", json!(env.to)),
                ("messageType", json!(env.message_type)),
            ],
        );
        self.base.send(env);
    }

    fn node_state(&self) -> NodeState {
        let mut custom = StateMap::new();
        custom.insert("counterValue".into(), json!(self.counter.lock().value()));
        let register = self.register.lock();
        custom.insert("registerValue".into(), register.value().clone());
        custom.insert("registerTimestamp".into(), json!(register.timestamp()));
        drop(register);
        custom.insert("localOps".into(), json!(self.local_ops.load(Ordering::SeqCst)));
        custom.insert("merges".into(), json!(self.merges.load(Ordering::SeqCst)));

        let mut node = NodeState::new(self.base.id().as_str(), self.base.status().as_str());
        node.role = Some("replica".to_string());
        node.custom_state = Some(custom);
        node
    }
}

impl TickNode for CrdtNode {
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

        let (active, mutate) = {
            let mut rng = self.rng.lock();
            (rng.gen::<f64>() < ACTIVITY_PROBABILITY, rng.gen_bool(0.5))
        };
        if active {
            if mutate {
                self.mutate_locally();
            } else {
                self.gossip_state();
            }
        }
    }

    fn snapshot(&self) -> StateMap {
        let mut map = self.base.snapshot_base();
        map.insert("counterValue".into(), json!(self.counter.lock().value()));
        map.insert("registerValue".into(), self.register.lock().value().clone());
        map
    }

    fn crash(&self) {
        self.base.crash();
    }

    fn recover(&self) {
        self.base.recover();
    }
}

/// The replicated-CRDT plugin.
pub struct CrdtStoreProject {
    engine: Arc<Engine>,
    nodes: Vec<Arc<CrdtNode>>,
}

impl CrdtStoreProject {
    pub fn new(config: CrdtStoreConfig, run: ProjectConfig, ctx: ProjectContext) -> Self {
        let node_count = run.node_count.unwrap_or(config.node_count).max(2);

        ctx.transport
            .set_latency(Duration::from_millis(20), Duration::from_millis(80));
        ctx.transport.set_packet_loss(0.0);

        let node_ids: Vec<NodeId> = (1..=node_count)
            .map(|i| NodeId::new(format!("node-{i}")))
            .collect();

        let mut base_rng = run.rng();
        let nodes: Vec<Arc<CrdtNode>> = node_ids
            .iter()
            .map(|id| {
                let transport = Arc::clone(&ctx.transport);
                let seed: u64 = base_rng.gen();
                Arc::new(CrdtNode {
                    base: BaseNode::new(
                        id.clone(),
                        Arc::new(move |env| transport.send(env)),
                        Arc::clone(&ctx.bus),
                    ),
                    counter: Mutex::new(PNCounter::new(id.clone())),
                    register: Mutex::new(LwwRegister::new()),
                    local_ops: AtomicU64::new(0),
                    merges: AtomicU64::new(0),
                    node_ids: node_ids.clone(),
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
        }
    }

    fn find(&self, node: &NodeId) -> Option<&Arc<CrdtNode>> {
        self.nodes.iter().find(|n| n.base.id() == node)
    }
}

impl Project for CrdtStoreProject {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use distlab_engine::EngineConfig;
    use distlab_events::EventBus;
    use distlab_network::NetworkTransport;

    fn project() -> CrdtStoreProject {
        let bus = Arc::new(EventBus::new());
        let ctx = ProjectContext {
            engine: Arc::new(Engine::new(
                Arc::clone(&bus),
                EngineConfig {
                    step_mode: true,
                    ..Default::default()
                },
            )),
            transport: Arc::new(NetworkTransport::with_seed(3)),
            bus,
        };
        CrdtStoreProject::new(
            CrdtStoreConfig::default(),
            ProjectConfig {
                seed: Some(3),
                ..Default::default()
            },
            ctx,
        )
    }

    fn sync_payload(node: &CrdtNode) -> serde_json::Value {
        json!({
            "counter": &*node.counter.lock(),
            "register": &*node.register.lock(),
        })
    }

    #[test]
    fn test_replicas_converge_after_full_exchange() {
        let project = project();
        project.nodes[0].counter.lock().increment(3);
        project.nodes[1].counter.lock().increment(2);
        project.nodes[2].counter.lock().decrement(1);
        project.nodes[0].register.lock().set(json!("jade"), 10);

        // Full pairwise exchange, delivered by hand.
        for from in 0..3 {
            for to in 0..3 {
                if from == to {
                    continue;
                }
                let env = Envelope::new(
                    project.nodes[from].base.id().clone(),
                    project.nodes[to].base.id().clone(),
                    MSG_STATE_SYNC,
                    sync_payload(&project.nodes[from]),
                );
                project.nodes[to].process_message(env.clone_for_delivery(now_millis()));
            }
        }

        let values: Vec<i64> = project
            .nodes
            .iter()
            .map(|n| n.counter.lock().value())
            .collect();
        assert_eq!(values, vec![4, 4, 4]);
        for node in &project.nodes {
            assert_eq!(node.register.lock().value(), &json!("jade"));
        }
    }

    #[test]
    fn test_merge_counts_surface_in_state() {
        let project = project();
        let env = Envelope::new(
            project.nodes[0].base.id().clone(),
            project.nodes[1].base.id().clone(),
            MSG_STATE_SYNC,
            sync_payload(&project.nodes[0]),
        );
        project.nodes[1].process_message(env.clone_for_delivery(now_millis()));

        let states = project.node_states();
        let custom = states["node-2"].custom_state.as_ref().unwrap();
        assert_eq!(custom["merges"], json!(1));
    }
}
