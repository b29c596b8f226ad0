// src/metrics/collector.rs
use crate::manager::ClusterSnapshot;
use anyhow::Result;
use prometheus::{
    Encoder, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    /// Text exposition of everything registered.
    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

const NODE_LABELS: &[&str] = &["listener", "backend", "node"];

/// Label sets currently exported for snapshot-derived series.
#[derive(Default)]
struct Published {
    nodes: HashSet<[String; 3]>,
    listeners: HashSet<String>,
}

pub struct MetricsCollector {
    // Node metrics, refreshed from snapshots
    pub node_health_status: IntGaugeVec,
    pub node_connections_open: IntGaugeVec,
    pub node_connections_total: IntGaugeVec,
    pub node_bytes_received: IntGaugeVec,
    pub node_bytes_sent: IntGaugeVec,
    pub node_response_time_seconds: GaugeVec,

    // Listener metrics
    pub listener_connections_open: IntGaugeVec,
    pub listener_connections_max: IntGaugeVec,

    // Events
    pub selection_failures_total: IntCounterVec,
    pub probe_results_total: IntCounterVec,
    pub reloads_total: IntCounterVec,

    published: Mutex<Published>,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let node_health_status = IntGaugeVec::new(
            Opts::new(
                "lb_node_health_status",
                "Node health status (1=healthy, 0=unhealthy)",
            ),
            NODE_LABELS,
        )?;
        registry.register(Box::new(node_health_status.clone()))?;

        let node_connections_open = IntGaugeVec::new(
            Opts::new("lb_node_connections_open", "Open connections per node"),
            NODE_LABELS,
        )?;
        registry.register(Box::new(node_connections_open.clone()))?;

        let node_connections_total = IntGaugeVec::new(
            Opts::new(
                "lb_node_connections_total",
                "Connections handed to the node since start or last reset",
            ),
            NODE_LABELS,
        )?;
        registry.register(Box::new(node_connections_total.clone()))?;

        let node_bytes_received = IntGaugeVec::new(
            Opts::new("lb_node_bytes_received", "Bytes received from the node"),
            NODE_LABELS,
        )?;
        registry.register(Box::new(node_bytes_received.clone()))?;

        let node_bytes_sent = IntGaugeVec::new(
            Opts::new("lb_node_bytes_sent", "Bytes sent to the node"),
            NODE_LABELS,
        )?;
        registry.register(Box::new(node_bytes_sent.clone()))?;

        let node_response_time_seconds = GaugeVec::new(
            Opts::new(
                "lb_node_response_time_seconds",
                "Mean node response time (0 until enough samples)",
            ),
            NODE_LABELS,
        )?;
        registry.register(Box::new(node_response_time_seconds.clone()))?;

        let listener_connections_open = IntGaugeVec::new(
            Opts::new("lb_listener_connections_open", "Admitted connections per listener"),
            &["listener"],
        )?;
        registry.register(Box::new(listener_connections_open.clone()))?;

        let listener_connections_max = IntGaugeVec::new(
            Opts::new("lb_listener_connections_max", "Admission limit per listener"),
            &["listener"],
        )?;
        registry.register(Box::new(listener_connections_max.clone()))?;

        let selection_failures_total = IntCounterVec::new(
            Opts::new(
                "lb_selection_failures_total",
                "Connections for which no node could be selected",
            ),
            &["listener", "backend"],
        )?;
        registry.register(Box::new(selection_failures_total.clone()))?;

        let probe_results_total = IntCounterVec::new(
            Opts::new("lb_probe_results_total", "Health probe results"),
            &["result"],
        )?;
        registry.register(Box::new(probe_results_total.clone()))?;

        let reloads_total = IntCounterVec::new(
            Opts::new("lb_reloads_total", "Configuration reloads"),
            &["result"],
        )?;
        registry.register(Box::new(reloads_total.clone()))?;

        Ok(Self {
            node_health_status,
            node_connections_open,
            node_connections_total,
            node_bytes_received,
            node_bytes_sent,
            node_response_time_seconds,
            listener_connections_open,
            listener_connections_max,
            selection_failures_total,
            probe_results_total,
            reloads_total,
            published: Mutex::new(Published::default()),
        })
    }

    pub fn record_selection_failure(&self, listener: &str, backend: &str) {
        self.selection_failures_total
            .with_label_values(&[listener, backend])
            .inc();
    }

    pub fn record_probe_result(&self, passed: bool) {
        let result = if passed { "pass" } else { "fail" };
        self.probe_results_total.with_label_values(&[result]).inc();
    }

    pub fn record_reload(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.reloads_total.with_label_values(&[result]).inc();
    }

    pub fn update_node_health(&self, listener: &str, backend: &str, node: &str, healthy: bool) {
        let value = if healthy { 1 } else { 0 };
        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        self.node_health_status
            .with_label_values(&[listener, backend, node])
            .set(value);
        published
            .nodes
            .insert([listener.to_string(), backend.to_string(), node.to_string()]);
    }

    /// Refreshes all snapshot-derived series, then drops the series of nodes
    /// and listeners the snapshot no longer has. Live series are never reset.
    pub fn observe(&self, snapshot: &ClusterSnapshot) {
        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nodes = HashSet::new();
        let mut listeners = HashSet::new();

        for listener in &snapshot.listeners {
            self.listener_connections_open
                .with_label_values(&[&listener.name])
                .set(saturating_i64(listener.open_connections as u64));
            self.listener_connections_max
                .with_label_values(&[&listener.name])
                .set(saturating_i64(listener.max_connections as u64));
            listeners.insert(listener.name.clone());

            for backend in &listener.backends {
                for node in &backend.nodes {
                    let labels = [listener.name.as_str(), backend.name.as_str(), node.status.name.as_str()];
                    let stats = &node.status.stats;
                    self.node_health_status
                        .with_label_values(&labels)
                        .set(if node.health.healthy { 1 } else { 0 });
                    self.node_connections_open
                        .with_label_values(&labels)
                        .set(saturating_i64(stats.open_connections));
                    self.node_connections_total
                        .with_label_values(&labels)
                        .set(saturating_i64(stats.connections_total));
                    self.node_bytes_received
                        .with_label_values(&labels)
                        .set(saturating_i64(stats.bytes_received));
                    self.node_bytes_sent
                        .with_label_values(&labels)
                        .set(saturating_i64(stats.bytes_sent));
                    self.node_response_time_seconds
                        .with_label_values(&labels)
                        .set(stats.response_time.mean_micros() as f64 / 1_000_000.0);
                    nodes.insert(labels.map(str::to_string));
                }
            }
        }

        for stale in published.nodes.difference(&nodes) {
            let labels = [stale[0].as_str(), stale[1].as_str(), stale[2].as_str()];
            let _ = self.node_health_status.remove_label_values(&labels);
            let _ = self.node_connections_open.remove_label_values(&labels);
            let _ = self.node_connections_total.remove_label_values(&labels);
            let _ = self.node_bytes_received.remove_label_values(&labels);
            let _ = self.node_bytes_sent.remove_label_values(&labels);
            let _ = self.node_response_time_seconds.remove_label_values(&labels);
        }
        for stale in published.listeners.difference(&listeners) {
            let _ = self.listener_connections_open.remove_label_values(&[stale]);
            let _ = self.listener_connections_max.remove_label_values(&[stale]);
        }
        published.nodes = nodes;
        published.listeners = listeners;
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
