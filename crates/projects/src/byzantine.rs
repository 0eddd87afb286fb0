//! Byzantine Generals Problem.
//!
//! The commander (node 0) broadcasts its decision; lieutenants relay what
//! they received, and traitors may flip values per recipient or per relay.
//! A lieutenant decides once it has gathered relayed votes from at least
//! ⌈n/2⌉ other lieutenants, taking the majority over everything it has seen
//! (ties go to attack). With n = 3f + 1 honest majorities converge; the
//! `3f_fail` scenario (n = 3, f = 1) leaves lieutenants short of the relay
//! quorum, so no consensus latch is ever set.

use crate::{Project, ProjectConfig, ProjectContext, ProjectError};
use distlab_engine::Engine;
use distlab_node::{BaseNode, TickNode};
use distlab_types::{Envelope, NodeId, NodeState, StateMap};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const MSG_VOTE: &str = "vote";

const DECISION_ATTACK: &str = "attack";
const DECISION_RETREAT: &str = "retreat";

/// How a general behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Follows the protocol.
    Honest,
    /// May forge initial votes and flip relays.
    Traitor,
    /// Never sends anything.
    Silent,
}

impl Behavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Behavior::Honest => "honest",
            Behavior::Traitor => "traitor",
            Behavior::Silent => "silent",
        }
    }
}

/// Byzantine scenario parameters.
#[derive(Debug, Clone)]
pub struct ByzantineConfig {
    pub node_count: usize,
    pub traitor_count: usize,
    /// Mark node 0 (the commander) as the traitor.
    pub commander_traitor: bool,
    /// Scenario demands exactly this node count; the run config cannot
    /// override it.
    pub pin_node_count: bool,
}

impl ByzantineConfig {
    pub fn for_scenario(scenario: &str) -> Self {
        match scenario {
            // 3 nodes with 1 traitor violates n >= 3f + 1.
            "3f_fail" => Self {
                node_count: 3,
                traitor_count: 1,
                commander_traitor: false,
                pin_node_count: true,
            },
            "commander_traitor" => Self {
                node_count: 4,
                traitor_count: 1,
                commander_traitor: true,
                pin_node_count: false,
            },
            _ => Self {
                node_count: 4,
                traitor_count: 1,
                commander_traitor: false,
                pin_node_count: false,
            },
        }
    }
}

/// Run-wide state: the consensus latch and every node's decision.
struct Shared {
    /// (behavior, decision) per node, pre-populated at construction.
    decisions: Mutex<BTreeMap<NodeId, (Behavior, Option<String>)>>,
    consensus: Mutex<Option<String>>,
}

impl Shared {
    /// Record a decision and, once every honest node agrees on one value,
    /// latch and return it. The latch makes emission idempotent.
    fn record_decision(&self, node: &NodeId, decision: &str) -> Option<String> {
        let mut decisions = self.decisions.lock();
        if let Some(entry) = decisions.get_mut(node) {
            entry.1 = Some(decision.to_string());
        }

        let mut consensus = self.consensus.lock();
        if consensus.is_some() {
            return None;
        }

        let mut agreed: Option<&str> = None;
        for (behavior, decision) in decisions.values() {
            if *behavior != Behavior::Honest {
                continue;
            }
            match (agreed, decision.as_deref()) {
                (_, None) => return None,
                (None, Some(value)) => agreed = Some(value),
                (Some(seen), Some(value)) if seen != value => return None,
                _ => {}
            }
        }

        let value = agreed?.to_string();
        *consensus = Some(value.clone());
        Some(value)
    }
}

struct ByzantineNode {
    base: BaseNode,
    behavior: Behavior,
    is_commander: bool,
    node_ids: Vec<NodeId>,
    commander: NodeId,
    max_rounds: u32,
    /// Relayed votes needed before deciding: ⌈n/2⌉ other lieutenants.
    relay_quorum: usize,

    decision: Mutex<Option<String>>,
    /// round -> sender -> vote value.
    received_votes: Mutex<BTreeMap<u32, BTreeMap<NodeId, String>>>,
    /// Rounds already relayed / the initial broadcast marker.
    sent_markers: Mutex<HashSet<u32>>,
    round: Mutex<u32>,
    shared: Arc<Shared>,
    rng: Mutex<ChaCha8Rng>,
}

impl ByzantineNode {
    fn emit_send(&self, env: &Envelope) {
        self.base.emit(
            distlab_events::kind::MESSAGE_SENT,
            [
                ("messageId", json!(env.id)),
                ("from", json!(env.from)),
                ("to", json!(env.to)),
                ("messageType", json!(env.message_type)),
                ("payload", (*env.payload).clone()),
            ],
        );
    }

    /// Round 0: the commander sends its decision to every lieutenant. A
    /// traitor commander coin-flips the value per recipient.
    fn send_initial_votes(&self) {
        if self.behavior == Behavior::Silent {
            return;
        }
        let decision = self
            .decision
            .lock()
            .clone()
            .unwrap_or_else(|| DECISION_ATTACK.to_string());

        for target in &self.node_ids {
            if target == self.base.id() {
                continue;
            }

            let mut vote = decision.clone();
            if self.behavior == Behavior::Traitor {
                vote = if self.rng.lock().gen_bool(0.5) {
                    DECISION_ATTACK.to_string()
                } else {
                    DECISION_RETREAT.to_string()
                };
                if vote != decision {
                    self.base.emit(
                        "conflict_detected",
                        [
                            ("from", json!(self.base.id())),
                            ("to", json!(target)),
                            ("trueVote", json!(decision)),
                            ("sentVote", json!(vote)),
                        ],
                    );
                }
            }

            let env = Envelope::new(
                self.base.id().clone(),
                target.clone(),
                MSG_VOTE,
                json!({ "vote": vote, "round": 0 }),
            );
            self.emit_send(&env);
            self.base.send(env);
        }
    }

    /// Relay a received round-k vote to every other lieutenant at round
    /// k + 1. Traitors flip the value with probability 0.5; silent nodes
    /// send nothing.
    fn relay_vote(&self, mut vote: String, round: u32) {
        if self.behavior == Behavior::Silent {
            return;
        }
        if self.behavior == Behavior::Traitor && self.rng.lock().gen_bool(0.5) {
            vote = if vote == DECISION_ATTACK {
                DECISION_RETREAT.to_string()
            } else {
                DECISION_ATTACK.to_string()
            };
        }

        for target in &self.node_ids {
            if target == self.base.id() || target == &self.commander {
                continue;
            }
            let env = Envelope::new(
                self.base.id().clone(),
                target.clone(),
                MSG_VOTE,
                json!({
                    "vote": vote,
                    "round": round + 1,
                    "relayedFrom": self.base.id(),
                }),
            );
            self.emit_send(&env);
            self.base.send(env);
        }
    }

    fn process_message(&self, env: Envelope) {
        self.base.emit(
            distlab_events::kind::MESSAGE_RECEIVED,
            [
                ("messageId", json!(env.id)),
                ("from", json!(env.from)),
                ("to", json!(env.to)),
                ("messageType", json!(env.message_type)),
                ("payload", (*env.payload).clone()),
            ],
        );

        if env.message_type != MSG_VOTE {
            return;
        }
        let Some(vote) = env.payload.get("vote").and_then(|v| v.as_str()) else {
            return;
        };
        let round = env
            .payload
            .get("round")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;

        self.received_votes
            .lock()
            .entry(round)
            .or_default()
            .insert(env.from.clone(), vote.to_string());

        self.base.emit(
            distlab_events::kind::VOTE_CAST,
            [
                ("from", json!(env.from)),
                ("to", json!(self.base.id())),
                ("vote", json!(vote)),
                ("round", json!(round)),
            ],
        );

        // Relay each round's value once; rounds 1..f exist, so a round-k
        // vote is only relayed while k + 1 stays within the round budget.
        if !self.is_commander && round + 1 < self.max_rounds {
            let fresh = self.sent_markers.lock().insert(round + 1);
            if fresh {
                self.relay_vote(vote.to_string(), round);
            }
        }
    }

    /// Decide once enough lieutenant relays have arrived: majority over one
    /// vote per sender (its earliest round), ties to attack.
    fn try_decide(&self) {
        if self.is_commander || self.decision.lock().is_some() {
            return;
        }

        let votes = self.received_votes.lock();
        let mut first_votes: BTreeMap<&NodeId, &String> = BTreeMap::new();
        for round in votes.values() {
            for (sender, vote) in round {
                first_votes.entry(sender).or_insert(vote);
            }
        }

        let lieutenant_voters = first_votes
            .keys()
            .filter(|id| ***id != self.commander)
            .count();
        if lieutenant_voters < self.relay_quorum {
            return;
        }

        let mut attack = 0usize;
        let mut retreat = 0usize;
        for vote in first_votes.values() {
            if *vote == DECISION_ATTACK {
                attack += 1;
            } else {
                retreat += 1;
            }
        }
        drop(votes);

        let decision = if attack >= retreat {
            DECISION_ATTACK
        } else {
            DECISION_RETREAT
        };
        *self.decision.lock() = Some(decision.to_string());
        info!(node = %self.base.id(), decision, "lieutenant decided");

        if let Some(value) = self.shared.record_decision(self.base.id(), decision) {
            let participants: Vec<String> = self
                .node_ids
                .iter()
                .map(|id| id.to_string())
                .collect();
            self.base.emit(
                distlab_events::kind::CONSENSUS_REACHED,
                [
                    ("decision", json!(value)),
                    ("honest", json!(true)),
                    ("participants", json!(participants)),
                ],
            );
        }
    }

    /// Externally a traitor shows as `byzantine` while staying `running`
    /// internally.
    fn reported_status(&self) -> String {
        if self.behavior == Behavior::Traitor && self.base.is_running() {
            "byzantine".to_string()
        } else {
            self.base.status().as_str().to_string()
        }
    }

    fn node_state(&self) -> NodeState {
        let votes_received: usize = self
            .received_votes
            .lock()
            .values()
            .map(|round| round.len())
            .sum();

        let mut custom = StateMap::new();
        custom.insert("behavior".into(), json!(self.behavior.as_str()));
        custom.insert("decision".into(), json!(*self.decision.lock()));
        custom.insert("isCommander".into(), json!(self.is_commander));
        custom.insert("round".into(), json!(*self.round.lock()));
        custom.insert("votesReceived".into(), json!(votes_received));

        let mut node = NodeState::new(self.base.id().as_str(), self.reported_status());
        node.role = Some(
            if self.is_commander {
                "commander"
            } else {
                "lieutenant"
            }
            .to_string(),
        );
        node.custom_state = Some(custom);
        node
    }
}

impl TickNode for ByzantineNode {
    fn id(&self) -> &NodeId {
        self.base.id()
    }

    fn tick(&self) {
        if !self.base.is_running() {
            return;
        }

        if let Some(env) = self.base.pop_message() {
            self.process_message(env);
        }

        if self.is_commander {
            let mut round = self.round.lock();
            if *round == 0 && self.sent_markers.lock().insert(0) {
                drop(round);
                self.send_initial_votes();
                *self.round.lock() = 1;
            }
        }

        self.try_decide();
    }

    fn snapshot(&self) -> StateMap {
        let mut map = self.base.snapshot_base();
        map.insert("behavior".into(), json!(self.behavior.as_str()));
        map.insert("decision".into(), json!(*self.decision.lock()));
        map
    }

    fn crash(&self) {
        self.base.crash();
    }

    fn recover(&self) {
        self.base.recover();
    }
}

/// The Byzantine Generals plugin.
pub struct ByzantineProject {
    engine: Arc<Engine>,
    nodes: Vec<Arc<ByzantineNode>>,
    shared: Arc<Shared>,
}

impl ByzantineProject {
    pub fn new(config: ByzantineConfig, run: ProjectConfig, ctx: ProjectContext) -> Self {
        let node_count = if config.pin_node_count {
            config.node_count
        } else {
            run.node_count.unwrap_or(config.node_count)
        }
        .max(2);
        let traitor_count = config.traitor_count.min(node_count - 1);

        ctx.transport
            .set_latency(Duration::from_millis(30), Duration::from_millis(100));
        ctx.transport.set_packet_loss(0.0);

        let node_ids: Vec<NodeId> = (1..=node_count)
            .map(|i| NodeId::new(format!("general-{i}")))
            .collect();
        let commander = node_ids[0].clone();

        let mut rng = run.rng();
        let traitors: HashSet<usize> = if config.commander_traitor {
            HashSet::from([0])
        } else {
            let mut picked = HashSet::new();
            while picked.len() < traitor_count {
                let index = rng.gen_range(1..node_count);
                picked.insert(index);
            }
            picked
        };

        let decisions = node_ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let behavior = if traitors.contains(&i) {
                    Behavior::Traitor
                } else {
                    Behavior::Honest
                };
                (id.clone(), (behavior, None))
            })
            .collect();
        let shared = Arc::new(Shared {
            decisions: Mutex::new(decisions),
            consensus: Mutex::new(None),
        });

        let relay_quorum = node_count.div_ceil(2);
        let nodes: Vec<Arc<ByzantineNode>> = node_ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let transport = Arc::clone(&ctx.transport);
                let behavior = if traitors.contains(&i) {
                    Behavior::Traitor
                } else {
                    Behavior::Honest
                };
                let seed: u64 = rng.gen();
                Arc::new(ByzantineNode {
                    base: BaseNode::new(
                        id.clone(),
                        Arc::new(move |env| transport.send(env)),
                        Arc::clone(&ctx.bus),
                    ),
                    behavior,
                    is_commander: i == 0,
                    node_ids: node_ids.clone(),
                    commander: commander.clone(),
                    max_rounds: traitor_count as u32 + 1,
                    relay_quorum,
                    decision: Mutex::new(None),
                    received_votes: Mutex::new(BTreeMap::new()),
                    sent_markers: Mutex::new(HashSet::new()),
                    round: Mutex::new(0),
                    shared: Arc::clone(&shared),
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
            shared,
        }
    }

    /// Whether the consensus latch has been set.
    pub fn consensus_reached(&self) -> bool {
        self.shared.consensus.lock().is_some()
    }

    /// The agreed value, once the latch is set.
    pub fn final_decision(&self) -> Option<String> {
        self.shared.consensus.lock().clone()
    }

    fn find(&self, node: &NodeId) -> Option<&Arc<ByzantineNode>> {
        self.nodes.iter().find(|n| n.base.id() == node)
    }
}

impl Project for ByzantineProject {
    fn start(&self) {
        // The commander opens with attack.
        if let Some(commander) = self.nodes.first() {
            *commander.decision.lock() = Some(DECISION_ATTACK.to_string());
            self.shared
                .record_decision(commander.base.id(), DECISION_ATTACK);
        }
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
