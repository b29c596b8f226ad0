// src/proxy/listener.rs
use super::backend::Backend;
use super::forward::{ConnectionContext, ConnectionHandler};
use super::limit::AdmissionLimiter;
use super::node::BackendNode;
use super::ProxyError;
use crate::metrics::MetricsCollector;
use arc_swap::ArcSwap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Hostname that selects a backend when no other backend claims the host.
pub const DEFAULT_HOST: &str = "default";

/// A listening endpoint and the backends reachable through it.
pub struct Listener {
    name: String,
    bind: SocketAddr,
    limiter: AdmissionLimiter,
    // ordered by name
    backends: ArcSwap<Vec<Arc<Backend>>>,
    write_lock: Mutex<()>,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Listener {
    pub fn new(
        name: impl Into<String>,
        bind: SocketAddr,
        max_connections: usize,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            name: name.into(),
            bind,
            limiter: AdmissionLimiter::new(max_connections),
            backends: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            metrics,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bind(&self) -> SocketAddr {
        self.bind
    }

    pub fn limiter(&self) -> &AdmissionLimiter {
        &self.limiter
    }

    pub fn backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.load().iter().find(|b| b.name() == name).cloned()
    }

    /// All backends, ordered by name.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.load().as_ref().clone()
    }

    fn write<R>(&self, apply: impl FnOnce(&mut Vec<Arc<Backend>>) -> R) -> R {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = self.backends.load().as_ref().clone();
        let result = apply(&mut next);
        next.sort_by(|a, b| a.name().cmp(b.name()));
        self.backends.store(Arc::new(next));
        result
    }

    /// Adds a backend, replacing one with the same name.
    pub fn insert_backend(&self, backend: Arc<Backend>) {
        info!(listener = %self.name, backend = %backend.name(), "added backend");
        self.write(|backends| {
            backends.retain(|b| b.name() != backend.name());
            backends.push(backend);
        });
    }

    pub fn remove_backend(&self, name: &str) -> Option<Arc<Backend>> {
        let removed = self.write(|backends| {
            let index = backends.iter().position(|b| b.name() == name)?;
            Some(backends.remove(index))
        });
        if removed.is_some() {
            info!(listener = %self.name, backend = name, "removed backend");
        }
        removed
    }

    /// Publishes a complete backend set in one swap.
    pub fn replace_backends(&self, backends: Vec<Arc<Backend>>) {
        self.write(|current| *current = backends);
        debug!(listener = %self.name, "published backends");
    }

    /// Backend claiming `host`, falling back to the one answering for `default`.
    pub fn find_backend_by_host(&self, host: Option<&str>) -> Option<Arc<Backend>> {
        let mut fallback = None;
        for backend in self.backends.load().iter() {
            if let Some(host) = host {
                if backend.answers_for(host) {
                    return Some(backend.clone());
                }
            }
            if fallback.is_none() && backend.answers_for(DEFAULT_HOST) {
                fallback = Some(backend.clone());
            }
        }
        fallback
    }

    pub fn select_node(
        &self,
        host: Option<&str>,
        client_ip: Option<IpAddr>,
        sticky_key: Option<&str>,
    ) -> Result<Arc<BackendNode>, ProxyError> {
        let backend = self
            .find_backend_by_host(host)
            .ok_or_else(|| ProxyError::NoBackendForHost(host.unwrap_or(DEFAULT_HOST).to_string()))?;
        let result = backend.select_node(client_ip, sticky_key);
        if result.is_err() {
            if let Some(metrics) = &self.metrics {
                metrics.record_selection_failure(&self.name, backend.name());
            }
        }
        result
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.limiter.close();
    }

    /// Accept loop. Each admitted connection runs on its own task and holds
    /// its admission permit until the task ends, however it ends.
    pub async fn serve(
        self: Arc<Self>,
        socket: TcpListener,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), ProxyError> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        info!(listener = %self.name, bind = %self.bind, max = self.limiter.max_connections(), "listener accepting connections");

        loop {
            tokio::select! {
                accepted = self.limiter.accept(&socket) => {
                    let (stream, peer, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(ProxyError::ListenerClosed) => break,
                        Err(err) => {
                            error!(listener = %self.name, %err, "accept failed");
                            // back off, e.g. on EMFILE
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };

                    let id = Uuid::new_v4();
                    let ctx = ConnectionContext {
                        id,
                        peer,
                        listener: Arc::clone(&self),
                    };
                    let handler = Arc::clone(&handler);
                    let span = tracing::info_span!("connection", listener = %self.name, %id, %peer);
                    tokio::spawn(
                        async move {
                            let _permit = permit;
                            debug!("connection accepted");
                            if let Err(err) = handler.handle(ctx, stream).await {
                                warn!(%err, "connection error");
                            }
                            debug!("connection closed");
                        }
                        .instrument(span),
                    );
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!(listener = %self.name, "listener stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("bind", &self.bind)
            .field("limiter", &self.limiter)
            .field("backends", &self.backends.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::BalanceMode;
    use crate::proxy::{BackendSettings, NodeSpec};

    fn backend(name: &str, hostnames: &[&str], node: &str) -> Arc<Backend> {
        let backend = Backend::new(
            "web",
            name,
            BackendSettings {
                hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
                balance: vec![BalanceMode::Preference],
                ..BackendSettings::default()
            },
        );
        backend
            .add_node(NodeSpec {
                uuid: node.to_string(),
                name: node.to_string(),
                address: "127.0.0.1:9".parse().unwrap(),
                preference: 0,
                topology: vec![],
            })
            .unwrap()
            .set_online(true);
        Arc::new(backend)
    }

    #[test]
    fn test_find_backend_by_host() {
        let listener = Listener::new("web", "127.0.0.1:0".parse().unwrap(), 10, None);
        listener.insert_backend(backend("api", &["api.example.com"], "a1"));
        listener.insert_backend(backend("site", &["www.example.com", "default"], "s1"));

        let found = listener.find_backend_by_host(Some("API.example.com")).unwrap();
        assert_eq!(found.name(), "api");
        let found = listener.find_backend_by_host(Some("other.example.com")).unwrap();
        assert_eq!(found.name(), "site");
        let found = listener.find_backend_by_host(None).unwrap();
        assert_eq!(found.name(), "site");

        assert_eq!(listener.select_node(Some("api.example.com"), None, None).unwrap().uuid(), "a1");
    }

    #[test]
    fn test_no_backend_for_host() {
        let listener = Listener::new("web", "127.0.0.1:0".parse().unwrap(), 10, None);
        listener.insert_backend(backend("api", &["api.example.com"], "a1"));
        assert!(matches!(
            listener.select_node(Some("x.example.com"), None, None),
            Err(ProxyError::NoBackendForHost(host)) if host == "x.example.com"
        ));
        assert!(listener.remove_backend("api").is_some());
        assert!(listener.backends().is_empty());
    }

    #[test]
    fn test_replace_backends_swaps_whole_set() {
        let listener = Listener::new("web", "127.0.0.1:0".parse().unwrap(), 10, None);
        listener.insert_backend(backend("api", &["api.example.com"], "a1"));

        listener.replace_backends(vec![
            backend("site", &["default"], "s1"),
            backend("blog", &["blog.example.com"], "b1"),
        ]);
        let names: Vec<String> = listener.backends().iter().map(|b| b.name().to_string()).collect();
        assert_eq!(names, vec!["blog", "site"]);
        assert!(listener.backend("api").is_none());
        assert_eq!(listener.find_backend_by_host(Some("api.example.com")).unwrap().name(), "site");
    }

    #[tokio::test]
    async fn test_idle_listener_has_no_open_connections() {
        let listener = Arc::new(Listener::new("web", "127.0.0.1:0".parse().unwrap(), 2, None));
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handler = Arc::new(crate::proxy::TcpForwarder::new(Duration::from_secs(1)));
        let task = tokio::spawn(listener.clone().serve(socket, handler));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.limiter().open_connections(), 0);

        listener.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
}
