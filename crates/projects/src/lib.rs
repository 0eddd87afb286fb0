//! Algorithm project plugins.
//!
//! A project wires its node implementations into a session's engine,
//! transport, and event bus, and exposes state for observers. The session
//! picks a plugin by project id; unknown ids resolve to the inert demo
//! plugin so every id in the catalog produces a running simulation.

mod byzantine;
mod clocks;
mod crdt_store;
mod demo;
mod two_generals;

pub use byzantine::{Behavior, ByzantineConfig, ByzantineProject};
pub use clocks::{CausalEvent, ClocksConfig, ClocksProject};
pub use crdt_store::{CrdtStoreConfig, CrdtStoreProject};
pub use demo::{DemoConfig, DemoProject};
pub use two_generals::{TwoGeneralsConfig, TwoGeneralsProject};

use distlab_engine::Engine;
use distlab_events::EventBus;
use distlab_network::NetworkTransport;
use distlab_types::{NodeId, NodeState};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Project ids served by the platform. Ids without a dedicated plugin run
/// the demo plugin.
pub const PROJECT_IDS: &[&str] = &[
    "two-generals",
    "clocks",
    "byzantine",
    "broadcast",
    "quorum",
    "state-machine",
    "raft",
    "two-phase-commit",
    "consistency",
    "crdt",
];

/// Errors a plugin can surface to the session.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
}

/// Everything a plugin needs from its session.
#[derive(Clone)]
pub struct ProjectContext {
    pub engine: Arc<Engine>,
    pub transport: Arc<NetworkTransport>,
    pub bus: Arc<EventBus>,
}

/// Per-run configuration passed from the `start_simulation` command.
#[derive(Debug, Clone, Default)]
pub struct ProjectConfig {
    pub node_count: Option<usize>,
    pub scenario: Option<String>,
    /// Seed for every stochastic decision in the run. Random when absent.
    pub seed: Option<u64>,
}

impl ProjectConfig {
    pub fn scenario(&self) -> &str {
        self.scenario.as_deref().unwrap_or("")
    }

    pub(crate) fn rng(&self) -> ChaCha8Rng {
        match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        }
    }
}

/// The contract every project plugin fulfils for the session.
pub trait Project: Send + Sync {
    /// Kick off the run: seed initial state and start the engine.
    fn start(&self);

    /// Stop the run and the engine.
    fn stop(&self);

    /// Per-node observer snapshots, keyed by node id.
    fn node_states(&self) -> BTreeMap<String, NodeState>;

    fn node_ids(&self) -> Vec<NodeId>;

    fn crash_node(&self, node: &NodeId) -> Result<(), ProjectError>;

    fn recover_node(&self, node: &NodeId) -> Result<(), ProjectError>;

    /// Causality query between two recorded events (clocks project only).
    fn compare_events(&self, _event_a: &str, _event_b: &str) -> &'static str {
        "unknown"
    }
}

/// Build the plugin for a project id.
pub fn build_project(
    project: &str,
    config: ProjectConfig,
    ctx: ProjectContext,
) -> Arc<dyn Project> {
    match project {
        "two-generals" => Arc::new(TwoGeneralsProject::new(
            TwoGeneralsConfig::for_scenario(config.scenario()),
            config,
            ctx,
        )),
        "clocks" => Arc::new(ClocksProject::new(ClocksConfig::default(), config, ctx)),
        "byzantine" => Arc::new(ByzantineProject::new(
            ByzantineConfig::for_scenario(config.scenario()),
            config,
            ctx,
        )),
        "crdt" => Arc::new(CrdtStoreProject::new(
            CrdtStoreConfig::default(),
            config,
            ctx,
        )),
        other => Arc::new(DemoProject::new(DemoConfig::default(), other, config, ctx)),
    }
}
