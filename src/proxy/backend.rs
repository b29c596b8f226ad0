// src/proxy/backend.rs
use super::node::{BackendNode, NodeSpec, NodeStatus};
use super::ProxyError;
use crate::load_balancer::{rank, BalanceMode, NodeSnapshot, OrderingStrategy, Sticky, Topology};
use crate::stats::StatsSnapshot;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// What to do when health filtering leaves no candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoHealthyPolicy {
    /// Refuse with `NoBackendAvailable`.
    #[default]
    FailClosed,
    /// Route across all registered nodes regardless of health.
    FailOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub hostnames: Vec<String>,
    pub balance: Vec<BalanceMode>,
    pub on_no_healthy: NoHealthyPolicy,
    /// Nodes at this many open connections stop receiving new ones.
    pub node_max_connections: Option<u64>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            hostnames: vec!["default".to_string()],
            balance: vec![BalanceMode::LeastConnected],
            on_no_healthy: NoHealthyPolicy::FailClosed,
            node_max_connections: None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

/// Settings and nodes of a backend. Always published together.
#[derive(Debug, Clone)]
struct BackendState {
    settings: BackendSettings,
    nodes: Vec<Arc<BackendNode>>,
}

/// A named group of nodes and the policy used to pick one of them.
///
/// Settings and node list are published through one `ArcSwap`: selection
/// reads a complete state without locking, and structural writers serialize
/// on `write_lock` before storing a fresh one.
#[derive(Debug)]
pub struct Backend {
    name: String,
    pool: String,
    state: ArcSwap<BackendState>,
    write_lock: Mutex<()>,
}

impl Backend {
    pub fn new(pool: impl Into<String>, name: impl Into<String>, settings: BackendSettings) -> Self {
        Self::with_nodes(pool.into(), name.into(), settings, Vec::new())
    }

    fn with_nodes(
        pool: String,
        name: String,
        settings: BackendSettings,
        nodes: Vec<Arc<BackendNode>>,
    ) -> Self {
        Self {
            name,
            pool,
            state: ArcSwap::from_pointee(BackendState { settings, nodes }),
            write_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the listener this backend belongs to.
    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn settings(&self) -> BackendSettings {
        self.state.load().settings.clone()
    }

    pub fn set_settings(&self, settings: BackendSettings) {
        let _ = self.write(|current| {
            Ok((
                BackendState {
                    settings,
                    nodes: current.nodes.clone(),
                },
                (),
            ))
        });
    }

    pub fn answers_for(&self, host: &str) -> bool {
        self.state
            .load()
            .settings
            .hostnames
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host))
    }

    pub fn nodes(&self) -> Vec<Arc<BackendNode>> {
        self.state.load().nodes.clone()
    }

    pub fn node(&self, uuid: &str) -> Option<Arc<BackendNode>> {
        self.state.load().nodes.iter().find(|n| n.uuid() == uuid).cloned()
    }

    fn write<R, F>(&self, apply: F) -> Result<R, ProxyError>
    where
        F: FnOnce(&BackendState) -> Result<(BackendState, R), ProxyError>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.state.load_full();
        let (next, result) = apply(&current)?;
        self.state.store(Arc::new(next));
        Ok(result)
    }

    /// Writes a new node list under the current settings.
    fn write_nodes<R, F>(&self, apply: F) -> Result<R, ProxyError>
    where
        F: FnOnce(&[Arc<BackendNode>]) -> Result<(Vec<Arc<BackendNode>>, R), ProxyError>,
    {
        self.write(|current| {
            let (nodes, result) = apply(&current.nodes)?;
            Ok((
                BackendState {
                    settings: current.settings.clone(),
                    nodes,
                },
                result,
            ))
        })
    }

    pub fn add_node(&self, spec: NodeSpec) -> Result<Arc<BackendNode>, ProxyError> {
        let node = self.write_nodes(|current| {
            if current.iter().any(|n| n.uuid() == spec.uuid) {
                return Err(ProxyError::DuplicateNode {
                    uuid: spec.uuid.clone(),
                    backend: self.name.clone(),
                });
            }
            let node = Arc::new(BackendNode::new(spec));
            let mut next = current.to_vec();
            next.push(Arc::clone(&node));
            Ok((next, node))
        })?;
        info!(backend = %self.name, node = %node.name(), uuid = %node.uuid(), "added node");
        Ok(node)
    }

    /// Re-declares a node, keeping its statistics and health.
    pub fn update_node(&self, spec: NodeSpec) -> Result<Arc<BackendNode>, ProxyError> {
        self.write_nodes(|current| {
            let index = current
                .iter()
                .position(|n| n.uuid() == spec.uuid)
                .ok_or_else(|| ProxyError::UnknownNode {
                    uuid: spec.uuid.clone(),
                    backend: self.name.clone(),
                })?;
            let node = Arc::new(BackendNode::with_state_of(spec, &current[index]));
            let mut next = current.to_vec();
            next[index] = Arc::clone(&node);
            Ok((next, node))
        })
    }

    pub fn remove_node(&self, uuid: &str) -> Option<Arc<BackendNode>> {
        let removed = self
            .write_nodes(|current| {
                let removed = current.iter().find(|n| n.uuid() == uuid).cloned();
                let next = current.iter().filter(|n| n.uuid() != uuid).cloned().collect();
                Ok((next, removed))
            })
            .ok()
            .flatten();
        if let Some(node) = &removed {
            info!(backend = %self.name, node = %node.name(), uuid, "removed node");
        }
        removed
    }

    /// Replaces the node set with `specs` in one swap.
    ///
    /// Nodes whose uuid survives keep their statistics and health flag; order
    /// follows `specs`. A uuid listed twice rejects the whole set.
    pub fn sync_nodes(&self, specs: Vec<NodeSpec>) -> Result<SyncReport, ProxyError> {
        let report = self.write_nodes(|current| self.plan_nodes(current, specs))?;
        self.log_sync(&report);
        Ok(report)
    }

    /// Builds the backend that replaces this one on reload. Nothing of `self`
    /// changes; surviving nodes share their state with the new backend.
    pub fn successor(
        &self,
        settings: BackendSettings,
        specs: Vec<NodeSpec>,
    ) -> Result<(Backend, SyncReport), ProxyError> {
        let current = self.state.load();
        let (nodes, report) = self.plan_nodes(&current.nodes, specs)?;
        self.log_sync(&report);
        let next = Backend::with_nodes(self.pool.clone(), self.name.clone(), settings, nodes);
        Ok((next, report))
    }

    fn plan_nodes(
        &self,
        current: &[Arc<BackendNode>],
        specs: Vec<NodeSpec>,
    ) -> Result<(Vec<Arc<BackendNode>>, SyncReport), ProxyError> {
        let mut existing: HashMap<&str, &Arc<BackendNode>> =
            current.iter().map(|n| (n.uuid(), n)).collect();
        let mut seen = HashSet::new();
        let mut report = SyncReport::default();
        let mut next = Vec::with_capacity(specs.len());

        for spec in specs {
            if !seen.insert(spec.uuid.clone()) {
                return Err(ProxyError::DuplicateNode {
                    uuid: spec.uuid,
                    backend: self.name.clone(),
                });
            }
            match existing.remove(spec.uuid.as_str()) {
                Some(node) if node.spec() == &spec => next.push(Arc::clone(node)),
                Some(node) => {
                    report.updated.push(spec.uuid.clone());
                    next.push(Arc::new(BackendNode::with_state_of(spec, node)));
                }
                None => {
                    report.added.push(spec.uuid.clone());
                    next.push(Arc::new(BackendNode::new(spec)));
                }
            }
        }
        report.removed = existing.keys().map(|uuid| uuid.to_string()).collect();
        report.removed.sort();
        Ok((next, report))
    }

    fn log_sync(&self, report: &SyncReport) {
        if *report != SyncReport::default() {
            info!(
                backend = %self.name,
                added = report.added.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                "synced nodes"
            );
        }
    }

    /// Picks the node for one unit of work.
    ///
    /// Offline nodes and nodes at their connection cap are dropped, then the
    /// sticky key and the client's topology narrow the set, and the balance
    /// chain ranks what is left.
    pub fn select_node(
        &self,
        client_ip: Option<IpAddr>,
        sticky_key: Option<&str>,
    ) -> Result<Arc<BackendNode>, ProxyError> {
        let state = self.state.load();
        let settings = &state.settings;
        let nodes = &state.nodes;

        let mut candidates: Vec<NodeSnapshot> = nodes
            .iter()
            .filter(|n| n.is_online())
            .map(NodeSnapshot::of)
            .filter(|c| {
                settings
                    .node_max_connections
                    .map_or(true, |max| c.stats.open_connections < max)
            })
            .collect();

        if candidates.is_empty() {
            match settings.on_no_healthy {
                NoHealthyPolicy::FailClosed => {
                    return Err(ProxyError::NoBackendAvailable(self.name.clone()));
                }
                NoHealthyPolicy::FailOpen => {
                    if !nodes.is_empty() {
                        warn!(backend = %self.name, "no healthy node, failing open across all nodes");
                    }
                    candidates = nodes.iter().map(NodeSnapshot::of).collect();
                }
            }
        }

        if let Some(key) = sticky_key {
            candidates = Sticky::new(key).order(candidates);
        }

        if let Some(ip) = client_ip {
            if candidates.iter().any(|c| !c.node.topology().is_empty()) {
                candidates = Topology::new(ip).order(candidates);
            }
        }

        let candidates = rank(&settings.balance, candidates);
        for (order, candidate) in candidates.iter().enumerate() {
            debug!(
                backend = %self.name,
                order,
                uuid = %candidate.uuid(),
                preference = candidate.preference(),
                open = candidate.stats.open_connections,
                "candidate node"
            );
        }

        candidates
            .into_iter()
            .next()
            .map(|c| c.node)
            .ok_or_else(|| ProxyError::NoBackendAvailable(self.name.clone()))
    }

    /// Sum of all member counters. Reporting only.
    pub fn aggregate_stats(&self) -> StatsSnapshot {
        StatsSnapshot::merge_all(self.state.load().nodes.iter().map(|n| n.stats().snapshot()))
    }

    pub fn clear_stats(&self) {
        for node in self.state.load().nodes.iter() {
            node.stats().reset();
        }
        debug!(backend = %self.name, "cleared node statistics");
    }

    pub fn node_statuses(&self) -> Vec<NodeStatus> {
        self.state.load().nodes.iter().map(|n| n.status()).collect()
    }
}
