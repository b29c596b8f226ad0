// src/health/mod.rs
mod aggregator;
mod checker;

pub use aggregator::{HealthAggregator, HealthPool, HealthStatus, NodeHealth, Quorum, QuorumParseError};
pub use checker::{HealthChecker, HttpProbe, Probe, ProbeOutcome, ProbeTarget, TcpConnectProbe};
