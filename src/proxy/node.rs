// src/proxy/node.rs
use crate::load_balancer::Cidr;
use crate::stats::NodeStatistics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Declared shape of a node, as produced by configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub uuid: String,
    pub name: String,
    pub address: SocketAddr,
    pub preference: i64,
    pub topology: Vec<Cidr>,
}

/// Runtime state that outlives reconfiguration of a node.
#[derive(Debug)]
struct NodeState {
    stats: Arc<NodeStatistics>,
    online: AtomicBool,
    changed_at: RwLock<DateTime<Utc>>,
}

/// A node a backend can route connections to.
///
/// The declared attributes are immutable; an update produces a new
/// `BackendNode` sharing the previous one's statistics and health flag.
#[derive(Debug)]
pub struct BackendNode {
    spec: NodeSpec,
    state: Arc<NodeState>,
}

impl BackendNode {
    /// New nodes start offline until their probes report.
    pub fn new(spec: NodeSpec) -> Self {
        let state = NodeState {
            stats: Arc::new(NodeStatistics::new(spec.uuid.clone())),
            online: AtomicBool::new(false),
            changed_at: RwLock::new(Utc::now()),
        };
        Self {
            spec,
            state: Arc::new(state),
        }
    }

    /// Re-declares `existing` with new attributes, keeping its live state.
    pub fn with_state_of(spec: NodeSpec, existing: &BackendNode) -> Self {
        Self {
            spec,
            state: Arc::clone(&existing.state),
        }
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn uuid(&self) -> &str {
        &self.spec.uuid
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn address(&self) -> SocketAddr {
        self.spec.address
    }

    pub fn preference(&self) -> i64 {
        self.spec.preference
    }

    pub fn topology(&self) -> &[Cidr] {
        &self.spec.topology
    }

    pub fn stats(&self) -> &Arc<NodeStatistics> {
        &self.state.stats
    }

    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::Acquire)
    }

    /// Returns true when the flag actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.state.online.swap(online, Ordering::AcqRel);
        if previous != online {
            *self
                .state
                .changed_at
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Utc::now();
            true
        } else {
            false
        }
    }

    pub fn changed_at(&self) -> DateTime<Utc> {
        *self
            .state
            .changed_at
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            uuid: self.spec.uuid.clone(),
            name: self.spec.name.clone(),
            address: self.spec.address,
            preference: self.spec.preference,
            topology: self.spec.topology.iter().map(ToString::to_string).collect(),
            online: self.is_online(),
            changed_at: self.changed_at(),
            stats: self.state.stats.snapshot(),
        }
    }
}

/// Reporting view of a node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub uuid: String,
    pub name: String,
    pub address: SocketAddr,
    pub preference: i64,
    pub topology: Vec<String>,
    pub online: bool,
    pub changed_at: DateTime<Utc>,
    pub stats: crate::stats::StatsSnapshot,
}
