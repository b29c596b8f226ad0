// src/manager/snapshot.rs
use crate::health::NodeHealth;
use crate::load_balancer::BalanceMode;
use crate::proxy::NodeStatus;
use crate::stats::StatsSnapshot;
use serde::Serialize;
use std::net::SocketAddr;

/// Point-in-time view of every listener, ordered by name at each level.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterSnapshot {
    pub listeners: Vec<ListenerSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerSnapshot {
    pub name: String,
    pub bind: SocketAddr,
    pub max_connections: usize,
    pub open_connections: usize,
    pub backends: Vec<BackendSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub name: String,
    pub hostnames: Vec<String>,
    pub balance: Vec<BalanceMode>,
    pub stats: StatsSnapshot,
    pub nodes: Vec<NodeReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    #[serde(flatten)]
    pub status: NodeStatus,
    pub health: NodeHealth,
}

impl ClusterSnapshot {
    pub fn listener(&self, name: &str) -> Option<&ListenerSnapshot> {
        self.listeners.iter().find(|l| l.name == name)
    }
}

impl ListenerSnapshot {
    pub fn backend(&self, name: &str) -> Option<&BackendSnapshot> {
        self.backends.iter().find(|b| b.name == name)
    }
}

impl BackendSnapshot {
    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.status.name == name)
    }
}
