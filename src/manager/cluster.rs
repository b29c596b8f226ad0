// src/manager/cluster.rs
use super::snapshot::{BackendSnapshot, ClusterSnapshot, ListenerSnapshot, NodeReport};
use crate::config::{probe_id, BackendConfig, Config, ConfigError, ListenerConfig};
use crate::health::{HealthAggregator, ProbeTarget, Quorum};
use crate::metrics::MetricsCollector;
use crate::proxy::{Backend, BackendNode, Listener, ProxyError};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Outcome of one `apply_config`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    /// Listeners that need a socket. A listener whose bind address changed
    /// shows up here and in `listeners_removed`.
    pub listeners_added: Vec<String>,
    pub listeners_removed: Vec<String>,
    pub nodes_added: usize,
    pub nodes_updated: usize,
    pub nodes_removed: usize,
    pub health_entries_evicted: usize,
}

/// Owns the listeners and the health aggregator, and ties probe results to
/// node routability.
pub struct Manager {
    health: HealthAggregator,
    listeners: DashMap<String, Arc<Listener>>,
    probes: ArcSwap<Vec<ProbeTarget>>,
    metrics: Option<Arc<MetricsCollector>>,
    reload_lock: Mutex<()>,
}

impl Manager {
    pub fn new(metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self {
            health: HealthAggregator::new(),
            listeners: DashMap::new(),
            probes: ArcSwap::from_pointee(Vec::new()),
            metrics,
            reload_lock: Mutex::new(()),
        }
    }

    pub fn health(&self) -> &HealthAggregator {
        &self.health
    }

    pub fn listener(&self, name: &str) -> Option<Arc<Listener>> {
        self.listeners.get(name).map(|l| l.clone())
    }

    /// All listeners, ordered by name.
    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        let mut listeners: Vec<Arc<Listener>> =
            self.listeners.iter().map(|entry| entry.value().clone()).collect();
        listeners.sort_by(|a, b| a.name().cmp(b.name()));
        listeners
    }

    /// Probe definitions of the last applied config.
    pub fn probe_targets(&self) -> Vec<ProbeTarget> {
        self.probes.load().as_ref().clone()
    }

    /// Validates `config` as a whole and only then brings the live state in
    /// line with it. Nodes that keep their uuid keep their statistics.
    pub fn apply_config(&self, config: &Config) -> Result<ReloadReport, ConfigError> {
        if let Err(e) = config.validate() {
            warn!("Rejected configuration: {}", e);
            if let Some(metrics) = &self.metrics {
                metrics.record_reload(false);
            }
            return Err(e);
        }

        let _guard = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut report = ReloadReport::default();

        // Build every backend first so a failure leaves the live state untouched.
        let mut staged = Vec::with_capacity(config.listeners.len());
        for lc in &config.listeners {
            let current = self.listener(&lc.name);
            let mut backends = Vec::with_capacity(lc.backends.len());
            for bc in &lc.backends {
                backends.push(Arc::new(self.stage_backend(current.as_deref(), lc, bc, &mut report)?));
            }
            staged.push((lc, current, backends));
        }

        let mut nodes = HashSet::new();
        let mut probes = HashSet::new();
        let mut targets = Vec::new();

        for (lc, current, backends) in staged {
            match current {
                Some(listener) if listener.bind() == lc.bind => {
                    listener.limiter().resize(lc.max_connections);
                    listener.replace_backends(backends);
                }
                current => {
                    let listener = Arc::new(Listener::new(
                        lc.name.clone(),
                        lc.bind,
                        lc.max_connections,
                        self.metrics.clone(),
                    ));
                    listener.replace_backends(backends);
                    self.listeners.insert(lc.name.clone(), listener);
                    if let Some(old) = current {
                        old.shutdown();
                        info!(listener = %lc.name, from = %old.bind(), to = %lc.bind, "rebound listener");
                        report.listeners_removed.push(lc.name.clone());
                    } else {
                        info!(listener = %lc.name, bind = %lc.bind, "added listener");
                    }
                    report.listeners_added.push(lc.name.clone());
                }
            }

            for bc in &lc.backends {
                for (node, targets_of_node) in node_probes(lc, bc) {
                    let probe_ids: Vec<String> = targets_of_node.iter().map(|t| t.id.clone()).collect();
                    // Without checks there is nothing to wait for.
                    let quorum = if probe_ids.is_empty() { Quorum::All } else { bc.health.quorum };
                    self.health
                        .set_check_pool(&node.0, &lc.name, &bc.name, &node.1, quorum, probe_ids.clone());
                    nodes.insert(node.0);
                    probes.extend(probe_ids);
                    targets.extend(targets_of_node);
                }
            }
        }

        let undeclared: Vec<String> = self
            .listeners
            .iter()
            .filter(|entry| !config.listeners.iter().any(|lc| lc.name == *entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for name in undeclared {
            if let Some((_, listener)) = self.listeners.remove(&name) {
                listener.shutdown();
                info!(listener = %name, "removed listener");
                report.listeners_removed.push(name);
            }
        }

        report.health_entries_evicted =
            self.health.retain_nodes(&nodes) + self.health.retain_probes(&probes);
        self.probes.store(Arc::new(targets));

        for node_id in &nodes {
            self.reevaluate(node_id);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_reload(true);
            metrics.observe(&self.snapshot());
        }
        info!(
            listeners_added = report.listeners_added.len(),
            listeners_removed = report.listeners_removed.len(),
            nodes_added = report.nodes_added,
            nodes_updated = report.nodes_updated,
            nodes_removed = report.nodes_removed,
            evicted = report.health_entries_evicted,
            "Configuration applied"
        );
        Ok(report)
    }

    /// Next generation of a backend. Nodes already known to the listener,
    /// under its old bind or the new one, keep their shared state.
    fn stage_backend(
        &self,
        listener: Option<&Listener>,
        lc: &ListenerConfig,
        bc: &BackendConfig,
        report: &mut ReloadReport,
    ) -> Result<Backend, ConfigError> {
        let specs = bc.nodes.iter().map(|n| n.spec(&lc.name, &bc.name)).collect();
        let staged = match listener.and_then(|l| l.backend(&bc.name)) {
            Some(current) => current.successor(bc.settings(), specs),
            None => Backend::new(lc.name.clone(), bc.name.clone(), bc.settings())
                .successor(bc.settings(), specs),
        };
        let (backend, sync) = staged.map_err(|e| match e {
            ProxyError::DuplicateNode { uuid, .. } => ConfigError::DuplicateNode(uuid),
            other => ConfigError::Backend(other),
        })?;
        report.nodes_added += sync.added.len();
        report.nodes_updated += sync.updated.len();
        report.nodes_removed += sync.removed.len();
        Ok(backend)
    }

    /// Stores a probe result and re-evaluates the nodes that depend on it.
    pub fn report_probe(&self, probe_id: &str, passed: bool, errors: Vec<String>) {
        self.health.set_check_status(probe_id, passed, errors);
        if let Some(metrics) = &self.metrics {
            metrics.record_probe_result(passed);
        }
        for node_id in self.health.get_pools_for_probe(probe_id) {
            self.reevaluate(&node_id);
        }
    }

    pub fn force_probe_down(&self, probe_id: &str, forced: bool) {
        info!(probe = probe_id, forced, "admin down");
        self.health.set_forced_down(probe_id, forced);
        for node_id in self.health.get_pools_for_probe(probe_id) {
            self.reevaluate(&node_id);
        }
    }

    pub fn force_probe_up(&self, probe_id: &str, forced: bool) {
        info!(probe = probe_id, forced, "admin up");
        self.health.set_forced_up(probe_id, forced);
        for node_id in self.health.get_pools_for_probe(probe_id) {
            self.reevaluate(&node_id);
        }
    }

    /// Recomputes a node's verdict and publishes it on the node. Returns the
    /// verdict, or `None` when no live node carries this id.
    pub fn reevaluate(&self, node_id: &str) -> Option<bool> {
        let health = self.health.get_node_status(node_id);
        let node = self.find_node(&health.pool, &health.backend, node_id)?;

        if node.set_online(health.healthy) {
            if health.healthy {
                info!(
                    listener = %health.pool,
                    backend = %health.backend,
                    node = %health.node,
                    "Node is now healthy"
                );
            } else {
                warn!(
                    listener = %health.pool,
                    backend = %health.backend,
                    node = %health.node,
                    errors = ?health.errors,
                    "Node is now unhealthy"
                );
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.update_node_health(&health.pool, &health.backend, &health.node, health.healthy);
        }
        Some(health.healthy)
    }

    fn find_node(&self, listener: &str, backend: &str, node_id: &str) -> Option<Arc<BackendNode>> {
        self.listener(listener)?.backend(backend)?.node(node_id)
    }

    pub fn select_node(
        &self,
        listener: &str,
        host: Option<&str>,
        client_ip: Option<IpAddr>,
        sticky_key: Option<&str>,
    ) -> Result<Arc<BackendNode>, ProxyError> {
        let listener = self
            .listener(listener)
            .ok_or_else(|| ProxyError::UnknownListener(listener.to_string()))?;
        let node = listener.select_node(host, client_ip, sticky_key)?;
        debug!(listener = %listener.name(), node = %node.name(), "selected node");
        Ok(node)
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let listeners = self
            .listeners()
            .into_iter()
            .map(|listener| {
                let backends = listener
                    .backends()
                    .into_iter()
                    .map(|backend| self.backend_snapshot(&backend))
                    .collect();
                ListenerSnapshot {
                    name: listener.name().to_string(),
                    bind: listener.bind(),
                    max_connections: listener.limiter().max_connections(),
                    open_connections: listener.limiter().open_connections(),
                    backends,
                }
            })
            .collect();
        ClusterSnapshot { listeners }
    }

    fn backend_snapshot(&self, backend: &Backend) -> BackendSnapshot {
        let settings = backend.settings();
        let mut nodes: Vec<NodeReport> = backend
            .node_statuses()
            .into_iter()
            .map(|status| NodeReport {
                health: self.health.get_node_status(&status.uuid),
                status,
            })
            .collect();
        nodes.sort_by(|a, b| a.status.name.cmp(&b.status.name));
        BackendSnapshot {
            name: backend.name().to_string(),
            hostnames: settings.hostnames.clone(),
            balance: settings.balance.clone(),
            stats: backend.aggregate_stats(),
            nodes,
        }
    }

    /// Stops accepting on every listener.
    pub fn shutdown(&self) {
        for listener in self.listeners() {
            listener.shutdown();
        }
    }
}

/// Node identities of a backend paired with their probe targets.
fn node_probes(lc: &ListenerConfig, bc: &BackendConfig) -> Vec<((String, String), Vec<ProbeTarget>)> {
    bc.nodes
        .iter()
        .map(|node| {
            let uuid = node.identity(&lc.name, &bc.name);
            let targets = bc
                .health
                .checks
                .iter()
                .enumerate()
                .map(|(index, check)| ProbeTarget {
                    id: probe_id(&uuid, index),
                    node: uuid.clone(),
                    kind: check.kind,
                    address: SocketAddr::new(
                        node.address.ip(),
                        check.port.unwrap_or_else(|| node.address.port()),
                    ),
                    path: check.path.clone(),
                    expect_status: check.expect_status,
                    interval: check.interval(),
                    timeout: check.timeout(),
                })
                .collect();
            ((uuid, node.name.clone()), targets)
        })
        .collect()
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("listeners", &self.listeners.len())
            .field("probes", &self.probes.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
listeners:
  - name: web
    bind: 127.0.0.1:18080
    max_connections: 4
    backends:
      - name: app
        balance: [preference]
        health:
          quorum: all
          checks:
            - type: tcpconnect
        nodes:
          - name: n1
            address: 10.0.0.1:80
            preference: 1
          - name: n2
            address: 10.0.0.2:80
            preference: 2
"#;

    fn config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn select(manager: &Manager) -> Result<String, ProxyError> {
        manager
            .select_node("web", None, None, None)
            .map(|node| node.name().to_string())
    }

    #[test]
    fn test_nodes_wait_for_first_probe() {
        let manager = Manager::new(None);
        let report = manager.apply_config(&config(CONFIG)).unwrap();
        assert_eq!(report.listeners_added, vec!["web".to_string()]);
        assert_eq!(report.nodes_added, 2);

        assert!(matches!(select(&manager), Err(ProxyError::NoBackendAvailable(_))));
        let snapshot = manager.snapshot();
        let node = snapshot.listener("web").unwrap().backend("app").unwrap().node("n1").unwrap();
        assert!(!node.health.healthy);
        assert_eq!(
            node.health.errors,
            vec!["pending health check with worker:web/app/n1#0".to_string()]
        );
    }

    #[test]
    fn test_probe_results_drive_selection() {
        let manager = Manager::new(None);
        manager.apply_config(&config(CONFIG)).unwrap();
        manager.report_probe("web/app/n1#0", true, vec![]);
        manager.report_probe("web/app/n2#0", true, vec![]);
        assert_eq!(select(&manager).unwrap(), "n1");

        manager.force_probe_down("web/app/n1#0", true);
        assert_eq!(select(&manager).unwrap(), "n2");
        assert_eq!(manager.reevaluate("web/app/n1"), Some(false));

        manager.force_probe_down("web/app/n1#0", false);
        assert_eq!(select(&manager).unwrap(), "n1");

        manager.report_probe("web/app/n1#0", false, vec!["refused".into()]);
        manager.report_probe("web/app/n2#0", false, vec!["refused".into()]);
        assert!(matches!(select(&manager), Err(ProxyError::NoBackendAvailable(_))));

        manager.force_probe_up("web/app/n2#0", true);
        assert_eq!(select(&manager).unwrap(), "n2");
    }

    #[test]
    fn test_reload_preserves_statistics() {
        let manager = Manager::new(None);
        manager.apply_config(&config(CONFIG)).unwrap();
        manager.report_probe("web/app/n1#0", true, vec![]);

        let node = manager.select_node("web", None, None, None).unwrap();
        node.stats().add_connections_total(7);

        let updated = CONFIG.replace("preference: 1", "preference: 5");
        let report = manager.apply_config(&config(&updated)).unwrap();
        assert!(report.listeners_added.is_empty());
        assert_eq!(report.nodes_updated, 1);

        let node = manager.select_node("web", None, None, None).unwrap();
        assert_eq!(node.name(), "n1");
        assert_eq!(node.preference(), 5);
        assert_eq!(node.stats().connections_total(), 7);
    }

    #[test]
    fn test_invalid_reload_keeps_state() {
        let manager = Manager::new(None);
        manager.apply_config(&config(CONFIG)).unwrap();
        manager.report_probe("web/app/n1#0", true, vec![]);

        let duplicate = CONFIG.replace("name: n2", "name: n1");
        assert!(matches!(
            manager.apply_config(&config(&duplicate)),
            Err(ConfigError::DuplicateNode(_))
        ));
        assert_eq!(select(&manager).unwrap(), "n1");
        assert_eq!(manager.probe_targets().len(), 2);
    }

    #[test]
    fn test_reload_evicts_stale_health() {
        let manager = Manager::new(None);
        manager.apply_config(&config(CONFIG)).unwrap();
        manager.report_probe("web/app/n2#0", true, vec![]);

        let (kept, _) = CONFIG.split_at(CONFIG.find("          - name: n2").unwrap());
        let report = manager.apply_config(&config(kept)).unwrap();
        assert_eq!(report.nodes_removed, 1);
        assert_eq!(report.health_entries_evicted, 2);
        assert!(manager.health().probe_status("web/app/n2#0").is_none());
        assert_eq!(manager.health().node_ids(), vec!["web/app/n1".to_string()]);
        assert_eq!(manager.probe_targets().len(), 1);
    }

    #[test]
    fn test_listener_rebind_and_removal() {
        let manager = Manager::new(None);
        manager.apply_config(&config(CONFIG)).unwrap();

        let moved = CONFIG.replace("127.0.0.1:18080", "127.0.0.1:18081");
        let report = manager.apply_config(&config(&moved)).unwrap();
        assert_eq!(report.listeners_added, vec!["web".to_string()]);
        assert_eq!(report.listeners_removed, vec!["web".to_string()]);
        assert_eq!(manager.listener("web").unwrap().bind().port(), 18081);

        let renamed = moved.replace("name: web", "name: edge");
        let report = manager.apply_config(&config(&renamed)).unwrap();
        assert_eq!(report.listeners_removed, vec!["web".to_string()]);
        assert!(manager.listener("web").is_none());
        assert!(matches!(select(&manager), Err(ProxyError::UnknownListener(_))));
    }

    #[test]
    fn test_rebind_keeps_node_statistics() {
        let manager = Manager::new(None);
        let yaml = CONFIG.replace("          checks:\n            - type: tcpconnect\n", "");
        manager.apply_config(&config(&yaml)).unwrap();
        let old = manager.listener("web").unwrap();
        manager
            .select_node("web", None, None, None)
            .unwrap()
            .stats()
            .add_connections_total(7);

        let moved = yaml.replace("127.0.0.1:18080", "127.0.0.1:18081");
        let report = manager.apply_config(&config(&moved)).unwrap();
        assert_eq!(report.nodes_added, 0);
        assert_eq!(report.nodes_updated, 0);

        let listener = manager.listener("web").unwrap();
        assert!(!Arc::ptr_eq(&old, &listener));
        let node = listener.backend("app").unwrap().node("web/app/n1").unwrap();
        assert_eq!(node.stats().connections_total(), 7);
        assert!(node.is_online());
        assert_eq!(select(&manager).unwrap(), "n1");
    }

    #[test]
    fn test_node_without_checks_is_routable() {
        let manager = Manager::new(None);
        let yaml = CONFIG.replace("          checks:\n            - type: tcpconnect\n", "");
        manager.apply_config(&config(&yaml)).unwrap();
        assert!(manager.probe_targets().is_empty());
        assert_eq!(select(&manager).unwrap(), "n1");
    }

    #[test]
    fn test_probe_targets_use_check_port() {
        let manager = Manager::new(None);
        let yaml = CONFIG.replace("- type: tcpconnect", "- type: httpget\n              port: 8081\n              path: /up");
        manager.apply_config(&config(&yaml)).unwrap();
        let targets = manager.probe_targets();
        assert_eq!(targets[0].address, "10.0.0.1:8081".parse::<SocketAddr>().unwrap());
        assert_eq!(targets[0].path, "/up");
        assert_eq!(targets[0].node, "web/app/n1");
    }
}
