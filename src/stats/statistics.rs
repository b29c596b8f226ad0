// src/stats/statistics.rs
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Number of response time samples required before the mean is used for ordering.
pub const MIN_RESPONSE_SAMPLES: u64 = 5;

/// Live traffic counters for a single backend node.
///
/// Every mutator touches exactly one atomic field, so serving paths never
/// contend on a structure-wide lock.
#[derive(Debug)]
pub struct NodeStatistics {
    uuid: String,
    open_connections: AtomicU64,
    connections_total: AtomicU64,
    // node -> client
    bytes_received: AtomicU64,
    // client -> node
    bytes_sent: AtomicU64,
    response_samples: AtomicU64,
    response_total_micros: AtomicU64,
    response_max_micros: AtomicU64,
}

impl NodeStatistics {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            open_connections: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            response_samples: AtomicU64::new(0),
            response_total_micros: AtomicU64::new(0),
            response_max_micros: AtomicU64::new(0),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn open_connections(&self) -> u64 {
        self.open_connections.load(Ordering::Relaxed)
    }

    pub fn add_open_connections(&self, n: u64) {
        self.open_connections.fetch_add(n, Ordering::Relaxed);
    }

    /// Decrements the open connection count, never going below zero.
    pub fn sub_open_connections(&self, n: u64) {
        let _ = self
            .open_connections
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(n))
            });
    }

    pub fn set_open_connections(&self, n: u64) {
        self.open_connections.store(n, Ordering::Relaxed);
    }

    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn add_connections_total(&self, n: u64) {
        self.connections_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_connections_total(&self, n: u64) {
        self.connections_total.store(n, Ordering::Relaxed);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_response_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.response_samples.fetch_add(1, Ordering::Relaxed);
        self.response_total_micros.fetch_add(micros, Ordering::Relaxed);
        self.response_max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn response_time(&self) -> ResponseTimeAggregate {
        ResponseTimeAggregate {
            samples: self.response_samples.load(Ordering::Relaxed),
            total_micros: self.response_total_micros.load(Ordering::Relaxed),
            max_micros: self.response_max_micros.load(Ordering::Relaxed),
        }
    }

    /// Opens a connection slot on this node. The slot is closed when the guard drops.
    pub fn connection(self: &Arc<Self>) -> ConnectionGuard {
        self.add_connections_total(1);
        self.add_open_connections(1);
        ConnectionGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            open_connections: self.open_connections(),
            connections_total: self.connections_total(),
            bytes_received: self.bytes_received(),
            bytes_sent: self.bytes_sent(),
            response_time: self.response_time(),
        }
    }

    /// Zeroes every counter. Open connections still release through their guards.
    pub fn reset(&self) {
        self.open_connections.store(0, Ordering::Relaxed);
        self.connections_total.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.response_samples.store(0, Ordering::Relaxed);
        self.response_total_micros.store(0, Ordering::Relaxed);
        self.response_max_micros.store(0, Ordering::Relaxed);
    }
}

/// Keeps a node's open connection count raised for the lifetime of one connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    stats: Arc<NodeStatistics>,
}

impl ConnectionGuard {
    pub fn stats(&self) -> &NodeStatistics {
        &self.stats
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.sub_open_connections(1);
    }
}

/// Mergeable response time summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResponseTimeAggregate {
    pub samples: u64,
    pub total_micros: u64,
    pub max_micros: u64,
}

impl ResponseTimeAggregate {
    pub fn merge(self, other: Self) -> Self {
        Self {
            samples: self.samples.saturating_add(other.samples),
            total_micros: self.total_micros.saturating_add(other.total_micros),
            max_micros: self.max_micros.max(other.max_micros),
        }
    }

    /// Mean response time in microseconds, or 0 until enough samples exist.
    pub fn mean_micros(&self) -> u64 {
        if self.samples < MIN_RESPONSE_SAMPLES {
            return 0;
        }
        self.total_micros / self.samples
    }
}

/// Point-in-time copy of a node's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub open_connections: u64,
    pub connections_total: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub response_time: ResponseTimeAggregate,
}

impl StatsSnapshot {
    /// Commutative, associative combination; `StatsSnapshot::default()` is the identity.
    pub fn merge(self, other: Self) -> Self {
        Self {
            open_connections: self.open_connections.saturating_add(other.open_connections),
            connections_total: self.connections_total.saturating_add(other.connections_total),
            bytes_received: self.bytes_received.saturating_add(other.bytes_received),
            bytes_sent: self.bytes_sent.saturating_add(other.bytes_sent),
            response_time: self.response_time.merge(other.response_time),
        }
    }

    pub fn merge_all<I>(snapshots: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        snapshots.into_iter().fold(Self::default(), Self::merge)
    }

    pub fn traffic(&self) -> u64 {
        self.bytes_received.saturating_add(self.bytes_sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(open: u64, total: u64, rx: u64, tx: u64, times: &[u64]) -> StatsSnapshot {
        let stats = NodeStatistics::new("n");
        stats.set_open_connections(open);
        stats.set_connections_total(total);
        stats.add_bytes_received(rx);
        stats.add_bytes_sent(tx);
        for t in times {
            stats.record_response_time(Duration::from_micros(*t));
        }
        stats.snapshot()
    }

    #[test]
    fn test_merge_is_order_independent() {
        let a = sample(1, 10, 100, 5, &[10, 20]);
        let b = sample(3, 2, 7, 70, &[500]);
        let c = sample(0, 8, 1, 1, &[1, 2, 3, 4, 5, 6]);

        let expected = StatsSnapshot::merge_all([a, b, c]);
        let permutations = [
            [a, b, c],
            [a, c, b],
            [b, a, c],
            [b, c, a],
            [c, a, b],
            [c, b, a],
        ];
        for order in permutations {
            assert_eq!(StatsSnapshot::merge_all(order), expected);
        }

        assert_eq!(a.merge(b).merge(c), a.merge(b.merge(c)));
        assert_eq!(a.merge(b), b.merge(a));
        assert_eq!(expected.open_connections, 4);
        assert_eq!(expected.connections_total, 20);
        assert_eq!(expected.traffic(), 184);
        assert_eq!(expected.response_time.samples, 9);
        assert_eq!(expected.response_time.max_micros, 500);
    }

    #[test]
    fn test_open_connections_never_negative() {
        let stats = NodeStatistics::new("n");
        stats.add_open_connections(1);
        stats.sub_open_connections(3);
        assert_eq!(stats.open_connections(), 0);
    }

    #[test]
    fn test_connection_guard_releases_on_drop() {
        let stats = Arc::new(NodeStatistics::new("n"));
        {
            let _first = stats.connection();
            let _second = stats.connection();
            assert_eq!(stats.open_connections(), 2);
        }
        assert_eq!(stats.open_connections(), 0);
        assert_eq!(stats.connections_total(), 2);
    }

    #[test]
    fn test_mean_requires_minimum_samples() {
        let stats = NodeStatistics::new("n");
        for _ in 0..4 {
            stats.record_response_time(Duration::from_micros(100));
        }
        assert_eq!(stats.response_time().mean_micros(), 0);

        stats.record_response_time(Duration::from_micros(600));
        assert_eq!(stats.response_time().mean_micros(), 200);
    }

    #[test]
    fn test_reset() {
        let stats = NodeStatistics::new("n");
        stats.add_connections_total(4);
        stats.add_bytes_sent(12);
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
