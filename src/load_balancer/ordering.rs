// src/load_balancer/ordering.rs
//
// Ranking strategies. All sorts are stable so equally ranked nodes keep their
// registry order between calls.
use super::{NodeSnapshot, OrderingStrategy};

/// Lowest preference value first.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreferenceOrder;

impl OrderingStrategy for PreferenceOrder {
    fn order(&self, mut candidates: Vec<NodeSnapshot>) -> Vec<NodeSnapshot> {
        candidates.sort_by_key(|c| c.preference());
        candidates
    }

    fn name(&self) -> &'static str {
        "preference"
    }
}

/// Lowest mean response time first. Nodes still warming up rank as zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseTimeOrder;

impl OrderingStrategy for ResponseTimeOrder {
    fn order(&self, mut candidates: Vec<NodeSnapshot>) -> Vec<NodeSnapshot> {
        candidates.sort_by_key(|c| c.stats.response_time.mean_micros());
        candidates
    }

    fn name(&self) -> &'static str {
        "responsetime"
    }
}

/// Fewest open connections first.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastConnections;

impl OrderingStrategy for LeastConnections {
    fn order(&self, mut candidates: Vec<NodeSnapshot>) -> Vec<NodeSnapshot> {
        candidates.sort_by_key(|c| c.stats.open_connections);
        candidates
    }

    fn name(&self) -> &'static str {
        "leastconnected"
    }
}

/// Least bytes moved first.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastTraffic;

impl OrderingStrategy for LeastTraffic {
    fn order(&self, mut candidates: Vec<NodeSnapshot>) -> Vec<NodeSnapshot> {
        candidates.sort_by_key(|c| c.stats.traffic());
        candidates
    }

    fn name(&self) -> &'static str {
        "leasttraffic"
    }
}

/// Fewest accepted connections first, which rotates through nodes over time.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobin;

impl OrderingStrategy for RoundRobin {
    fn order(&self, mut candidates: Vec<NodeSnapshot>) -> Vec<NodeSnapshot> {
        candidates.sort_by_key(|c| c.stats.connections_total);
        candidates
    }

    fn name(&self) -> &'static str {
        "roundrobin"
    }
}

/// Keeps only the first candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstAvailable;

impl OrderingStrategy for FirstAvailable {
    fn order(&self, mut candidates: Vec<NodeSnapshot>) -> Vec<NodeSnapshot> {
        candidates.truncate(1);
        candidates
    }

    fn name(&self) -> &'static str {
        "firstavailable"
    }
}
