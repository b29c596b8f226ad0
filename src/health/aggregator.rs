// src/health/aggregator.rs
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// How multiple probe results combine into one node verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quorum {
    /// Healthy when at least one probe is ok.
    Any,
    /// Healthy when no probe is failing.
    All,
}

impl Default for Quorum {
    fn default() -> Self {
        Quorum::All
    }
}

impl fmt::Display for Quorum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quorum::Any => f.write_str("any"),
            Quorum::All => f.write_str("all"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown quorum '{0}', expected 'any' or 'all'")]
pub struct QuorumParseError(pub String);

impl FromStr for Quorum {
    type Err = QuorumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(Quorum::Any),
            "all" => Ok(Quorum::All),
            _ => Err(QuorumParseError(s.to_string())),
        }
    }
}

/// Last reported state of a single probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub passed: Option<bool>,
    pub forced_down: bool,
    pub forced_up: bool,
    pub errors: Vec<String>,
}

impl HealthStatus {
    /// `None` until a first result arrives. Overrides only apply after that.
    fn verdict(&self) -> Option<bool> {
        if self.passed.is_none() {
            None
        } else if self.forced_down {
            Some(false)
        } else if self.forced_up {
            Some(true)
        } else {
            self.passed
        }
    }
}

/// Which probes apply to a node and how they combine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthPool {
    pub pool: String,
    pub backend: String,
    pub node: String,
    pub quorum: Quorum,
    pub probes: Vec<String>,
}

/// Combined verdict for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeHealth {
    pub healthy: bool,
    pub pool: String,
    pub backend: String,
    pub node: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
struct AggregatorState {
    statuses: HashMap<String, HealthStatus>,
    pools: HashMap<String, HealthPool>,
    // probe id -> node ids
    probe_index: HashMap<String, BTreeSet<String>>,
}

impl AggregatorState {
    fn unindex(&mut self, node_id: &str, probes: &[String]) {
        for probe in probes {
            if let Some(nodes) = self.probe_index.get_mut(probe) {
                nodes.remove(node_id);
                if nodes.is_empty() {
                    self.probe_index.remove(probe);
                }
            }
        }
    }
}

/// Combines independent probe results into per-node health.
///
/// All state sits behind one mutex. Evaluation happens at probe cadence and on
/// reload, never per connection, so a single lock is cheap enough.
#[derive(Debug, Default)]
pub struct HealthAggregator {
    state: Mutex<AggregatorState>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the latest result of a probe. Last write wins.
    pub fn set_check_status(&self, probe_id: &str, passed: bool, errors: Vec<String>) {
        let mut state = self.lock();
        let status = state.statuses.entry(probe_id.to_string()).or_default();
        status.passed = Some(passed);
        status.errors = errors;
    }

    pub fn set_forced_down(&self, probe_id: &str, forced: bool) {
        let mut state = self.lock();
        state
            .statuses
            .entry(probe_id.to_string())
            .or_default()
            .forced_down = forced;
    }

    pub fn set_forced_up(&self, probe_id: &str, forced: bool) {
        let mut state = self.lock();
        state
            .statuses
            .entry(probe_id.to_string())
            .or_default()
            .forced_up = forced;
    }

    /// Replaces the health definition of a node.
    pub fn set_check_pool(
        &self,
        node_id: &str,
        pool: &str,
        backend: &str,
        node: &str,
        quorum: Quorum,
        probes: Vec<String>,
    ) {
        let mut state = self.lock();
        if let Some(previous) = state.pools.remove(node_id) {
            state.unindex(node_id, &previous.probes);
        }
        for probe in &probes {
            state
                .probe_index
                .entry(probe.clone())
                .or_default()
                .insert(node_id.to_string());
        }
        state.pools.insert(
            node_id.to_string(),
            HealthPool {
                pool: pool.to_string(),
                backend: backend.to_string(),
                node: node.to_string(),
                quorum,
                probes,
            },
        );
    }

    pub fn get_node_status(&self, node_id: &str) -> NodeHealth {
        let state = self.lock();
        let Some(pool) = state.pools.get(node_id) else {
            return NodeHealth {
                healthy: false,
                pool: String::new(),
                backend: String::new(),
                node: String::new(),
                errors: vec!["no health check result recorded yet".to_string()],
            };
        };

        let mut ok = 0usize;
        let mut failing = 0usize;
        let mut errors = Vec::new();
        for probe in &pool.probes {
            match state.statuses.get(probe) {
                Some(status) => match status.verdict() {
                    Some(true) => {
                        ok += 1;
                        errors.extend(status.errors.iter().cloned());
                    }
                    Some(false) => {
                        failing += 1;
                        errors.extend(status.errors.iter().cloned());
                    }
                    None => {
                        failing += 1;
                        errors.push(format!("pending health check with worker:{probe}"));
                    }
                },
                None => {
                    failing += 1;
                    errors.push(format!("pending health check with worker:{probe}"));
                }
            }
        }

        let healthy = match pool.quorum {
            Quorum::Any => ok > 0,
            Quorum::All => failing == 0,
        };
        debug!(
            node_id,
            ok,
            failing,
            quorum = %pool.quorum,
            pool = %pool.pool,
            backend = %pool.backend,
            node = %pool.node,
            healthy,
            "health status evaluated"
        );

        NodeHealth {
            healthy,
            pool: pool.pool.clone(),
            backend: pool.backend.clone(),
            node: pool.node.clone(),
            errors,
        }
    }

    /// Nodes whose verdict depends on the given probe, sorted by id.
    pub fn get_pools_for_probe(&self, probe_id: &str) -> Vec<String> {
        self.lock()
            .probe_index
            .get(probe_id)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().pools.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn probe_status(&self, probe_id: &str) -> Option<HealthStatus> {
        self.lock().statuses.get(probe_id).cloned()
    }

    /// Drops health definitions of nodes that are no longer declared.
    pub fn retain_nodes(&self, keep: &HashSet<String>) -> usize {
        let mut state = self.lock();
        let stale: Vec<String> = state
            .pools
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();
        for node_id in &stale {
            if let Some(pool) = state.pools.remove(node_id) {
                state.unindex(node_id, &pool.probes);
            }
        }
        stale.len()
    }

    /// Drops results and overrides of probes that are no longer declared.
    pub fn retain_probes(&self, keep: &HashSet<String>) -> usize {
        let mut state = self.lock();
        let before = state.statuses.len();
        state.statuses.retain(|id, _| keep.contains(id));
        before - state.statuses.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probes(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn aggregator(quorum: Quorum) -> HealthAggregator {
        let health = HealthAggregator::new();
        health.set_check_pool("n1", "web", "app", "node1", quorum, probes(&["p1", "p2"]));
        health
    }

    #[test]
    fn test_quorum_all() {
        let health = aggregator(Quorum::All);
        health.set_check_status("p1", true, vec![]);
        health.set_check_status("p2", true, vec![]);
        assert!(health.get_node_status("n1").healthy);

        health.set_check_status("p2", false, vec!["connection refused".into()]);
        let status = health.get_node_status("n1");
        assert!(!status.healthy);
        assert_eq!(status.errors, vec!["connection refused".to_string()]);
        assert_eq!(status.pool, "web");
        assert_eq!(status.backend, "app");
        assert_eq!(status.node, "node1");
    }

    #[test]
    fn test_quorum_any() {
        let health = aggregator(Quorum::Any);
        health.set_check_status("p1", false, vec![]);
        health.set_check_status("p2", false, vec![]);
        assert!(!health.get_node_status("n1").healthy);

        health.set_check_status("p2", true, vec![]);
        assert!(health.get_node_status("n1").healthy);
    }

    #[test]
    fn test_forced_overrides() {
        let health = aggregator(Quorum::All);
        health.set_check_status("p1", true, vec![]);
        health.set_check_status("p2", true, vec![]);

        health.set_forced_down("p1", true);
        assert!(!health.get_node_status("n1").healthy);

        health.set_forced_up("p1", true);
        assert!(!health.get_node_status("n1").healthy, "forced down wins");

        health.set_forced_down("p1", false);
        health.set_check_status("p1", false, vec![]);
        assert!(health.get_node_status("n1").healthy, "forced up wins over result");
    }

    #[test]
    fn test_pending_probes() {
        let health = aggregator(Quorum::Any);
        let status = health.get_node_status("n1");
        assert!(!status.healthy);
        assert_eq!(
            status.errors,
            vec![
                "pending health check with worker:p1".to_string(),
                "pending health check with worker:p2".to_string(),
            ]
        );

        // an override alone does not count as a result
        health.set_forced_down("p1", false);
        assert_eq!(health.get_node_status("n1").errors.len(), 2);
    }

    #[test]
    fn test_overrides_wait_for_first_result() {
        let health = HealthAggregator::new();
        health.set_check_pool("n1", "web", "app", "n1", Quorum::Any, vec!["p1".into()]);
        let pending = vec!["pending health check with worker:p1".to_string()];

        health.set_forced_up("p1", true);
        let status = health.get_node_status("n1");
        assert!(!status.healthy);
        assert_eq!(status.errors, pending);

        health.set_forced_up("p1", false);
        health.set_forced_down("p1", true);
        let status = health.get_node_status("n1");
        assert!(!status.healthy);
        assert_eq!(status.errors, pending);

        // once reported, the override applies
        health.set_check_status("p1", true, vec![]);
        assert!(!health.get_node_status("n1").healthy);
        health.set_forced_down("p1", false);
        health.set_forced_up("p1", true);
        health.set_check_status("p1", false, vec![]);
        assert!(health.get_node_status("n1").healthy);
    }

    #[test]
    fn test_empty_probe_set() {
        let health = HealthAggregator::new();
        health.set_check_pool("n1", "web", "app", "n1", Quorum::Any, vec![]);
        health.set_check_pool("n2", "web", "app", "n2", Quorum::All, vec![]);
        assert!(!health.get_node_status("n1").healthy);
        assert!(health.get_node_status("n2").healthy);
    }

    #[test]
    fn test_unregistered_node() {
        let health = HealthAggregator::new();
        let status = health.get_node_status("missing");
        assert!(!status.healthy);
        assert_eq!(status.errors, vec!["no health check result recorded yet".to_string()]);
    }

    #[test]
    fn test_pools_for_probe_follows_redefinition() {
        let health = aggregator(Quorum::All);
        health.set_check_pool("n2", "web", "app", "node2", Quorum::All, probes(&["p2"]));
        assert_eq!(health.get_pools_for_probe("p2"), vec!["n1", "n2"]);

        health.set_check_pool("n1", "web", "app", "node1", Quorum::All, probes(&["p3"]));
        assert_eq!(health.get_pools_for_probe("p1"), Vec::<String>::new());
        assert_eq!(health.get_pools_for_probe("p2"), vec!["n2"]);
        assert_eq!(health.get_pools_for_probe("p3"), vec!["n1"]);
    }

    #[test]
    fn test_set_check_pool_is_idempotent() {
        let health = aggregator(Quorum::All);
        health.set_check_pool("n1", "web", "app", "node1", Quorum::All, probes(&["p1", "p2"]));
        assert_eq!(health.get_pools_for_probe("p1"), vec!["n1"]);
        assert_eq!(health.node_ids(), vec!["n1"]);
    }

    #[test]
    fn test_eviction() {
        let health = aggregator(Quorum::All);
        health.set_check_pool("n2", "web", "app", "node2", Quorum::All, probes(&["p9"]));
        health.set_check_status("p1", true, vec![]);
        health.set_check_status("p9", true, vec![]);

        let keep_nodes: HashSet<String> = ["n1".to_string()].into();
        assert_eq!(health.retain_nodes(&keep_nodes), 1);
        assert!(health.get_pools_for_probe("p9").is_empty());

        let keep_probes: HashSet<String> = ["p1".to_string(), "p2".to_string()].into();
        assert_eq!(health.retain_probes(&keep_probes), 1);
        assert!(health.probe_status("p9").is_none());
        assert!(health.probe_status("p1").is_some());
    }

    #[test]
    fn test_quorum_parse() {
        assert_eq!("ANY".parse::<Quorum>().unwrap(), Quorum::Any);
        assert_eq!("all".parse::<Quorum>().unwrap(), Quorum::All);
        assert!("most".parse::<Quorum>().is_err());
    }
}
