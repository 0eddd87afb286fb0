//! Inert demo plugin for project ids without a dedicated implementation.

use crate::{Project, ProjectConfig, ProjectContext, ProjectError};
use distlab_engine::Engine;
use distlab_node::{BaseNode, TickNode};
use distlab_types::{NodeId, NodeState, StateMap};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Demo parameters.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub node_count: usize,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self { node_count: 5 }
    }
}

struct DemoNode {
    base: BaseNode,
    project: String,
}

impl TickNode for DemoNode {
    fn id(&self) -> &NodeId {
        self.base.id()
    }

    fn tick(&self) {
        // Demo nodes do nothing.
    }

    fn snapshot(&self) -> StateMap {
        self.base.snapshot_base()
    }

    fn crash(&self) {
        self.base.crash();
    }

    fn recover(&self) {
        self.base.recover();
    }
}

/// Placeholder simulation: nodes exist and respond to lifecycle commands but
/// exchange no messages.
pub struct DemoProject {
    engine: Arc<Engine>,
    nodes: Vec<Arc<DemoNode>>,
}

impl DemoProject {
    pub fn new(config: DemoConfig, project: &str, run: ProjectConfig, ctx: ProjectContext) -> Self {
        let node_count = run.node_count.unwrap_or(config.node_count).max(1);

        let nodes: Vec<Arc<DemoNode>> = (1..=node_count)
            .map(|i| {
                let transport = Arc::clone(&ctx.transport);
                Arc::new(DemoNode {
                    base: BaseNode::new(
                        NodeId::new(format!("node-{i}")),
                        Arc::new(move |env| transport.send(env)),
                        Arc::clone(&ctx.bus),
                    ),
                    project: project.to_string(),
                })
            })
            .collect();

        for node in &nodes {
            ctx.engine.add_node(Arc::clone(node) as Arc<dyn TickNode>);
        }

        Self {
            engine: ctx.engine,
            nodes,
        }
    }

    fn find(&self, node: &NodeId) -> Option<&Arc<DemoNode>> {
        self.nodes.iter().find(|n| n.base.id() == node)
    }
}

impl Project for DemoProject {
    fn start(&self) {
        self.engine.start();
    }

    fn stop(&self) {
        self.engine.stop();
    }

    fn node_states(&self) -> BTreeMap<String, NodeState> {
        self.nodes
            .iter()
            .map(|n| {
                let mut custom = StateMap::new();
                custom.insert(
                    "message".into(),
                    json!(format!("project '{}' simulation coming soon", n.project)),
                );
                let mut state =
                    NodeState::new(n.base.id().as_str(), n.base.status().as_str());
                state.role = Some("participant".to_string());
                state.custom_state = Some(custom);
                (n.base.id().to_string(), state)
            })
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

    #[test]
    fn test_demo_respects_node_count_and_lifecycle() {
        let bus = Arc::new(EventBus::new());
        let ctx = ProjectContext {
            engine: Arc::new(Engine::new(Arc::clone(&bus), EngineConfig::default())),
            transport: Arc::new(NetworkTransport::with_seed(1)),
            bus,
        };
        let project = DemoProject::new(
            DemoConfig::default(),
            "raft",
            ProjectConfig {
                node_count: Some(2),
                ..Default::default()
            },
            ctx,
        );

        assert_eq!(project.node_ids().len(), 2);
        project.crash_node(&"node-1".into()).unwrap();
        assert_eq!(project.node_states()["node-1"].status, "crashed");
        project.recover_node(&"node-1".into()).unwrap();
        assert_eq!(project.node_states()["node-1"].status, "running");
        assert!(project.crash_node(&"node-9".into()).is_err());
    }
}
