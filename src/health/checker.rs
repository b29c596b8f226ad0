// src/health/checker.rs
use crate::config::CheckKind;
use crate::manager::Manager;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

/// One probe bound to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub id: String,
    pub node: String,
    pub kind: CheckKind,
    pub address: SocketAddr,
    pub path: String,
    pub expect_status: u16,
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub passed: bool,
    pub errors: Vec<String>,
}

impl ProbeOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            errors: Vec::new(),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            passed: false,
            errors: vec![error.into()],
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> ProbeOutcome;
}

/// Passes when a TCP connection can be opened.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    address: SocketAddr,
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(address: SocketAddr, timeout: Duration) -> Self {
        Self { address, timeout }
    }
}

#[async_trait]
impl Probe for TcpConnectProbe {
    async fn check(&self) -> ProbeOutcome {
        match timeout(self.timeout, TcpStream::connect(self.address)).await {
            Ok(Ok(_)) => ProbeOutcome::pass(),
            Ok(Err(e)) => ProbeOutcome::fail(format!("tcp connect {}: {}", self.address, e)),
            Err(_) => ProbeOutcome::fail(format!(
                "tcp connect {}: timed out after {:?}",
                self.address, self.timeout
            )),
        }
    }
}

/// Passes when a GET answers with the expected status.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    url: Url,
    expect_status: u16,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(
        client: Client,
        address: SocketAddr,
        path: &str,
        expect_status: u16,
        timeout: Duration,
    ) -> Result<Self> {
        let url = Url::parse(&format!("http://{address}"))?.join(path)?;
        Ok(Self {
            client,
            url,
            expect_status,
            timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> ProbeOutcome {
        let result = timeout(self.timeout, self.client.get(self.url.as_str()).send()).await;
        match result {
            Ok(Ok(response)) => {
                let status = response.status();
                if status.as_u16() == self.expect_status {
                    ProbeOutcome::pass()
                } else {
                    ProbeOutcome::fail(format!(
                        "GET {}: expected status {}, got {}",
                        self.url, self.expect_status, status
                    ))
                }
            }
            Ok(Err(e)) => ProbeOutcome::fail(format!("GET {}: {}", self.url, e)),
            Err(_) => ProbeOutcome::fail(format!("GET {}: request timeout", self.url)),
        }
    }
}

/// Runs one interval task per probe target and reports every result to the
/// manager.
pub struct HealthChecker {
    manager: Arc<Manager>,
    client: Client,
    tasks: Mutex<HashMap<String, (ProbeTarget, JoinHandle<()>)>>,
}

impl HealthChecker {
    pub fn new(manager: Arc<Manager>) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            manager,
            client,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (ProbeTarget, JoinHandle<()>)>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn running(&self) -> usize {
        self.lock().len()
    }

    /// Makes the running set match `targets`. Unchanged probes keep their
    /// task; changed or vanished ones are aborted. Returns (started, stopped).
    pub fn sync(&self, targets: Vec<ProbeTarget>) -> (usize, usize) {
        let mut tasks = self.lock();
        let mut wanted: HashMap<String, ProbeTarget> =
            targets.into_iter().map(|t| (t.id.clone(), t)).collect();

        let mut stopped = 0;
        tasks.retain(|id, (current, handle)| {
            let unchanged = wanted.get(id).map_or(false, |target| *target == *current);
            if unchanged {
                wanted.remove(id);
            } else {
                handle.abort();
                stopped += 1;
            }
            unchanged
        });

        let mut started = 0;
        for (id, target) in wanted {
            match self.spawn(target.clone()) {
                Ok(handle) => {
                    tasks.insert(id, (target, handle));
                    started += 1;
                }
                Err(e) => warn!(probe = %id, "cannot start health probe: {}", e),
            }
        }

        info!(
            "Health probes synced: {} started, {} stopped, {} running",
            started,
            stopped,
            tasks.len()
        );
        (started, stopped)
    }

    fn spawn(&self, target: ProbeTarget) -> Result<JoinHandle<()>> {
        let probe: Box<dyn Probe> = match target.kind {
            CheckKind::TcpConnect => Box::new(TcpConnectProbe::new(target.address, target.timeout)),
            CheckKind::HttpGet => Box::new(HttpProbe::new(
                self.client.clone(),
                target.address,
                &target.path,
                target.expect_status,
                target.timeout,
            )?),
        };
        let manager = self.manager.clone();

        Ok(tokio::spawn(async move {
            let mut ticker = interval(target.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let outcome = probe.check().await;
                debug!(probe = %target.id, node = %target.node, passed = outcome.passed, "probe finished");
                manager.report_probe(&target.id, outcome.passed, outcome.errors);
            }
        }))
    }

    pub fn shutdown(&self) {
        let mut tasks = self.lock();
        for (_, (_, handle)) in tasks.drain() {
            handle.abort();
        }
        info!("Health checker shut down");
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn target(id: &str, address: SocketAddr) -> ProbeTarget {
        ProbeTarget {
            id: id.to_string(),
            node: "web/app/n1".to_string(),
            kind: CheckKind::TcpConnect,
            address,
            path: "/".to_string(),
            expect_status: 200,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(1),
        }
    }

    async fn closed_port() -> SocketAddr {
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let probe = TcpConnectProbe::new(socket.local_addr().unwrap(), Duration::from_secs(1));
        assert_eq!(probe.check().await, ProbeOutcome::pass());

        let probe = TcpConnectProbe::new(closed_port().await, Duration::from_secs(1));
        let outcome = probe.check().await;
        assert!(!outcome.passed);
        assert!(outcome.errors[0].starts_with("tcp connect"));
    }

    #[tokio::test]
    async fn test_http_probe_status() {
        let mut server = mockito::Server::new_async().await;
        let ok = server.mock("GET", "/health").with_status(200).create_async().await;
        let down = server.mock("GET", "/down").with_status(503).create_async().await;
        let address: SocketAddr = server.host_with_port().parse().unwrap();

        let probe = HttpProbe::new(Client::new(), address, "/health", 200, Duration::from_secs(2)).unwrap();
        assert_eq!(probe.url().path(), "/health");
        assert!(probe.check().await.passed);
        ok.assert_async().await;

        let probe = HttpProbe::new(Client::new(), address, "/down", 200, Duration::from_secs(2)).unwrap();
        let outcome = probe.check().await;
        assert!(!outcome.passed);
        assert!(outcome.errors[0].contains("expected status 200"));
        down.assert_async().await;
    }

    #[tokio::test]
    async fn test_sync_keeps_unchanged_probes() {
        let checker = HealthChecker::new(Arc::new(Manager::new(None))).unwrap();
        let address = closed_port().await;

        assert_eq!(checker.sync(vec![target("a#0", address), target("b#0", address)]), (2, 0));
        assert_eq!(checker.sync(vec![target("a#0", address), target("b#0", address)]), (0, 0));

        let mut changed = target("b#0", address);
        changed.interval = Duration::from_secs(30);
        assert_eq!(checker.sync(vec![target("a#0", address), changed]), (1, 1));
        assert_eq!(checker.running(), 2);

        assert_eq!(checker.sync(vec![]), (0, 2));
        assert_eq!(checker.running(), 0);
    }
}
