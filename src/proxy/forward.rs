// src/proxy/forward.rs
use super::listener::Listener;
use super::ProxyError;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

/// What a transport knows about an admitted connection.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub listener: Arc<Listener>,
}

/// Moves bytes for one admitted connection. Node choice goes through
/// `Listener::select_node`.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn handle(&self, ctx: ConnectionContext, stream: TcpStream) -> Result<(), ProxyError>;
}

/// Plain TCP passthrough to the selected node.
#[derive(Debug, Clone)]
pub struct TcpForwarder {
    connect_timeout: Duration,
}

impl TcpForwarder {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpForwarder {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ConnectionHandler for TcpForwarder {
    async fn handle(&self, ctx: ConnectionContext, mut client: TcpStream) -> Result<(), ProxyError> {
        let node = ctx.listener.select_node(None, Some(ctx.peer.ip()), None)?;
        let guard = node.stats().connection();
        let address = node.address();
        debug!(node = %node.name(), %address, "forwarding connection");

        let started = Instant::now();
        let mut upstream = timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ProxyError::ConnectTimeout(address))??;
        guard.stats().record_response_time(started.elapsed());

        let (to_node, from_node) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        guard.stats().add_bytes_sent(to_node);
        guard.stats().add_bytes_received(from_node);
        debug!(node = %node.name(), to_node, from_node, "connection finished");
        Ok(())
    }
}
