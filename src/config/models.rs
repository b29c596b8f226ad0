// src/config/models.rs
use crate::health::Quorum;
use crate::load_balancer::{parse_balance_chain, BalanceMode, Cidr};
use crate::proxy::{BackendSettings, NoHealthyPolicy, NodeSpec};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no listeners configured")]
    NoListeners,

    #[error("duplicate listener '{0}'")]
    DuplicateListener(String),

    #[error("listener '{0}': max_connections must be greater than zero")]
    ZeroMaxConnections(String),

    #[error("listener '{listener}': duplicate backend '{backend}'")]
    DuplicateBackend { listener: String, backend: String },

    #[error("listener '{listener}': host '{host}' is claimed by more than one backend")]
    DuplicateHostname { listener: String, host: String },

    #[error("backend '{0}': balance chain is empty")]
    EmptyBalance(String),

    #[error("duplicate node identity '{0}'")]
    DuplicateNode(String),

    #[error("health check on backend '{backend}': {reason}")]
    InvalidCheck { backend: String, reason: String },

    #[error("backend rejected node set: {0}")]
    Backend(#[from] crate::proxy::ProxyError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub status: StatusConfig,
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Metrics and JSON status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_status_bind")]
    pub bind: SocketAddr,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_status_bind(),
            metrics_path: default_metrics_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub name: String,
    pub bind: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    pub backends: Vec<BackendConfig>,
}

impl ListenerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default = "default_hostnames")]
    pub hostnames: Vec<String>,
    #[serde(default = "default_balance", deserialize_with = "balance_chain")]
    pub balance: Vec<BalanceMode>,
    #[serde(default)]
    pub on_no_healthy: NoHealthyPolicy,
    #[serde(default)]
    pub node_max_connections: Option<u64>,
    #[serde(default)]
    pub health: HealthConfig,
    pub nodes: Vec<NodeConfig>,
}

impl BackendConfig {
    pub fn settings(&self) -> BackendSettings {
        BackendSettings {
            hostnames: self.hostnames.clone(),
            balance: self.balance.clone(),
            on_no_healthy: self.on_no_healthy,
            node_max_connections: self.node_max_connections,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default)]
    pub quorum: Quorum,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
}

/// One probe definition, instantiated once per node of the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckConfig {
    #[serde(rename = "type")]
    pub kind: CheckKind,
    /// Probe this port instead of the node's service port.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_check_path")]
    pub path: String,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
    #[serde(default = "default_check_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_check_timeout_secs")]
    pub timeout_secs: u64,
}

impl CheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    TcpConnect,
    HttpGet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub name: String,
    /// Stable identity; defaults to `<listener>/<backend>/<name>`.
    #[serde(default)]
    pub uuid: Option<String>,
    pub address: SocketAddr,
    #[serde(default)]
    pub preference: i64,
    #[serde(default)]
    pub topology: Vec<Cidr>,
}

impl NodeConfig {
    pub fn identity(&self, listener: &str, backend: &str) -> String {
        self.uuid
            .clone()
            .unwrap_or_else(|| format!("{listener}/{backend}/{}", self.name))
    }

    pub fn spec(&self, listener: &str, backend: &str) -> NodeSpec {
        NodeSpec {
            uuid: self.identity(listener, backend),
            name: self.name.clone(),
            address: self.address,
            preference: self.preference,
            topology: self.topology.clone(),
        }
    }
}

/// Identity of the `index`-th check of a node.
pub fn probe_id(node_uuid: &str, index: usize) -> String {
    format!("{node_uuid}#{index}")
}

impl Config {
    /// Checks everything that cannot be expressed in the serde models. A
    /// config that passes can be applied without further failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        let mut listener_names = HashSet::new();
        let mut node_ids = HashSet::new();
        for listener in &self.listeners {
            if !listener_names.insert(listener.name.as_str()) {
                return Err(ConfigError::DuplicateListener(listener.name.clone()));
            }
            if listener.max_connections == 0 {
                return Err(ConfigError::ZeroMaxConnections(listener.name.clone()));
            }

            let mut backend_names = HashSet::new();
            let mut hostnames = HashSet::new();
            for backend in &listener.backends {
                if !backend_names.insert(backend.name.as_str()) {
                    return Err(ConfigError::DuplicateBackend {
                        listener: listener.name.clone(),
                        backend: backend.name.clone(),
                    });
                }
                for host in &backend.hostnames {
                    if !hostnames.insert(host.to_ascii_lowercase()) {
                        return Err(ConfigError::DuplicateHostname {
                            listener: listener.name.clone(),
                            host: host.clone(),
                        });
                    }
                }
                if backend.balance.is_empty() {
                    return Err(ConfigError::EmptyBalance(backend.name.clone()));
                }
                for check in &backend.health.checks {
                    check.validate(&backend.name)?;
                }
                for node in &backend.nodes {
                    let id = node.identity(&listener.name, &backend.name);
                    if !node_ids.insert(id.clone()) {
                        return Err(ConfigError::DuplicateNode(id));
                    }
                }
            }
        }
        Ok(())
    }
}

impl CheckConfig {
    fn validate(&self, backend: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidCheck {
            backend: backend.to_string(),
            reason: reason.to_string(),
        };
        if self.interval_secs == 0 {
            return Err(invalid("interval_secs must be greater than zero"));
        }
        if self.timeout_secs == 0 {
            return Err(invalid("timeout_secs must be greater than zero"));
        }
        if self.kind == CheckKind::HttpGet && !self.path.starts_with('/') {
            return Err(invalid("path must start with '/'"));
        }
        Ok(())
    }
}

/// Accepts `[preference, leastconnected]` as well as `"preference,leastconnected"`.
fn balance_chain<'de, D>(deserializer: D) -> Result<Vec<BalanceMode>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Chain {
        Text(String),
        List(Vec<String>),
    }

    match Chain::deserialize(deserializer)? {
        Chain::Text(text) => parse_balance_chain(&text).map_err(de::Error::custom),
        Chain::List(list) => list
            .iter()
            .map(|mode| mode.parse().map_err(de::Error::custom))
            .collect(),
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_status_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_hostnames() -> Vec<String> {
    vec![crate::proxy::DEFAULT_HOST.to_string()]
}

fn default_balance() -> Vec<BalanceMode> {
    vec![BalanceMode::LeastConnected]
}

fn default_check_path() -> String {
    "/".to_string()
}

fn default_expect_status() -> u16 {
    200
}

fn default_check_interval_secs() -> u64 {
    5
}

fn default_check_timeout_secs() -> u64 {
    2
}
