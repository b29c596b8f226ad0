// src/load_balancer/algorithm.rs
use crate::proxy::BackendNode;
use crate::stats::StatsSnapshot;
use std::sync::Arc;

/// A node together with the counters it had when the selection started.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub node: Arc<BackendNode>,
    pub stats: StatsSnapshot,
}

impl NodeSnapshot {
    pub fn of(node: &Arc<BackendNode>) -> Self {
        Self {
            node: Arc::clone(node),
            stats: node.stats().snapshot(),
        }
    }

    pub fn uuid(&self) -> &str {
        self.node.uuid()
    }

    pub fn preference(&self) -> i64 {
        self.node.preference()
    }
}

/// Orders or filters a candidate set. The first element after the pipeline wins.
pub trait OrderingStrategy: Send + Sync {
    fn order(&self, candidates: Vec<NodeSnapshot>) -> Vec<NodeSnapshot>;

    fn name(&self) -> &'static str;
}
