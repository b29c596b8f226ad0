// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a file (YAML or JSON)
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config = parse_config(path, &contents)?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn parse_config(path: &Path, contents: &str) -> Result<Config> {
    match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(contents).context("Failed to parse YAML config")
        }
        _ => serde_json::from_str(contents).context("Failed to parse JSON config"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Quorum;
    use crate::load_balancer::BalanceMode;
    use crate::proxy::NoHealthyPolicy;

    const SAMPLE: &str = r#"
listeners:
  - name: web
    bind: 0.0.0.0:8080
    max_connections: 2
    backends:
      - name: app
        balance: [preference, leastconnected]
        on_no_healthy: fail_open
        health:
          quorum: any
          checks:
            - type: tcpconnect
            - type: httpget
              path: /health
              port: 8081
        nodes:
          - name: app1
            address: 10.0.0.1:80
            preference: 1
            topology: [10.0.0.0/24]
          - name: app2
            uuid: fixed-id
            address: 10.0.0.2:80
"#;

    fn parse(yaml: &str) -> Result<Config> {
        parse_config(Path::new("test.yaml"), yaml)
    }

    #[test]
    fn test_parse_yaml() {
        let config = parse(SAMPLE).unwrap();
        config.validate().unwrap();

        let listener = &config.listeners[0];
        assert_eq!(listener.max_connections, 2);
        let backend = &listener.backends[0];
        assert_eq!(backend.balance, vec![BalanceMode::Preference, BalanceMode::LeastConnected]);
        assert_eq!(backend.on_no_healthy, NoHealthyPolicy::FailOpen);
        assert_eq!(backend.hostnames, vec!["default".to_string()]);
        assert_eq!(backend.health.quorum, Quorum::Any);
        assert_eq!(backend.health.checks[0].interval_secs, 5);
        assert_eq!(backend.health.checks[1].port, Some(8081));
        assert_eq!(backend.nodes[0].identity("web", "app"), "web/app/app1");
        assert_eq!(backend.nodes[1].identity("web", "app"), "fixed-id");
        assert!(config.status.enabled);
    }

    #[test]
    fn test_balance_accepts_comma_list() {
        let yaml = SAMPLE.replace("[preference, leastconnected]", "\"random,responsetime\"");
        let config = parse(&yaml).unwrap();
        assert_eq!(
            config.listeners[0].backends[0].balance,
            vec![BalanceMode::Random, BalanceMode::ResponseTime]
        );
    }

    #[test]
    fn test_rejects_unknown_quorum() {
        assert!(parse(&SAMPLE.replace("quorum: any", "quorum: most")).is_err());
    }

    #[test]
    fn test_rejects_unknown_strategy() {
        assert!(parse(&SAMPLE.replace("[preference, leastconnected]", "[fastest]")).is_err());
    }

    #[test]
    fn test_rejects_malformed_cidr() {
        assert!(parse(&SAMPLE.replace("10.0.0.0/24", "10.0.0.0/40")).is_err());
    }

    #[test]
    fn test_rejects_duplicate_node_identity() {
        let config = parse(&SAMPLE.replace("uuid: fixed-id", "uuid: web/app/app1")).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateNode(id)) if id == "web/app/app1"));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let yaml = SAMPLE.replace("- type: tcpconnect", "- type: tcpconnect\n              interval_secs: 0");
        let config = parse(&yaml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidCheck { .. })));
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"listeners":[{"name":"tcp","bind":"127.0.0.1:7000","backends":[
            {"name":"db","nodes":[{"name":"db1","address":"10.0.0.9:5432"}]}]}]}"#;
        let config = parse_config(Path::new("lb.json"), json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listeners[0].max_connections, 1024);
        assert_eq!(config.listeners[0].backends[0].balance, vec![BalanceMode::LeastConnected]);
    }

    #[tokio::test]
    async fn test_load_config_from_file() {
        let path = std::env::temp_dir().join(format!("lb-{}.yaml", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, SAMPLE).await.unwrap();
        let config = load_config(&path).await.unwrap();
        assert_eq!(config.listeners[0].name, "web");
        let _ = tokio::fs::remove_file(&path).await;
    }
}
