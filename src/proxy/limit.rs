// src/proxy/limit.rs
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::ProxyError;

#[derive(Debug, Default)]
struct Counters {
    open: AtomicUsize,
    // permits to retire as they come back after the limit was lowered
    shrink_pending: AtomicUsize,
}

/// Caps the number of simultaneously open connections on a listener.
///
/// At capacity `acquire` waits instead of rejecting, so the accept loop stops
/// pulling connections off the socket until a slot frees up.
#[derive(Debug)]
pub struct AdmissionLimiter {
    semaphore: Arc<Semaphore>,
    max: AtomicUsize,
    counters: Arc<Counters>,
}

impl AdmissionLimiter {
    pub fn new(max_connections: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max: AtomicUsize::new(max_connections),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }

    pub fn open_connections(&self) -> usize {
        self.counters.open.load(Ordering::Relaxed)
    }

    fn permit(&self, permit: OwnedSemaphorePermit) -> AdmissionPermit {
        self.counters.open.fetch_add(1, Ordering::Relaxed);
        AdmissionPermit {
            permit: Some(permit),
            counters: Arc::clone(&self.counters),
        }
    }

    async fn reserve(&self) -> Result<OwnedSemaphorePermit, ProxyError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::ListenerClosed)
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<AdmissionPermit, ProxyError> {
        let permit = self.reserve().await?;
        Ok(self.permit(permit))
    }

    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.permit(permit))
    }

    /// Takes a slot, then accepts the next connection into it. The slot only
    /// counts as open once a connection has been accepted.
    ///
    /// Cancel safe: dropping the future releases any slot already taken.
    pub async fn accept(
        &self,
        listener: &TcpListener,
    ) -> Result<(TcpStream, SocketAddr, AdmissionPermit), ProxyError> {
        let reserved = self.reserve().await?;
        let (stream, peer) = listener.accept().await?;
        Ok((stream, peer, self.permit(reserved)))
    }

    /// Changes the cap. Lowering it below the open count retires slots as
    /// connections close.
    pub fn resize(&self, max_connections: usize) {
        let previous = self.max.swap(max_connections, Ordering::AcqRel);
        if max_connections > previous {
            let mut grow = max_connections - previous;
            let cancelled = self
                .counters
                .shrink_pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                    Some(pending.saturating_sub(grow))
                })
                .unwrap_or(0);
            grow -= cancelled.min(grow);
            self.semaphore.add_permits(grow);
        } else {
            for _ in 0..previous - max_connections {
                match Arc::clone(&self.semaphore).try_acquire_owned() {
                    Ok(permit) => permit.forget(),
                    Err(_) => {
                        self.counters.shrink_pending.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
        }
    }

    /// Wakes every waiter with `ListenerClosed`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// One admitted connection. Dropping it frees the slot exactly once.
#[derive(Debug)]
pub struct AdmissionPermit {
    permit: Option<OwnedSemaphorePermit>,
    counters: Arc<Counters>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.counters.open.fetch_sub(1, Ordering::Relaxed);
        let retire = self
            .counters
            .shrink_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                pending.checked_sub(1)
            })
            .is_ok();
        if let Some(permit) = self.permit.take() {
            if retire {
                permit.forget();
            }
        }
    }
}
