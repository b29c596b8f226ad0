// src/load_balancer/mod.rs
mod algorithm;
mod ordering;
mod random;
mod sticky;
mod topology;

pub use algorithm::{NodeSnapshot, OrderingStrategy};
pub use ordering::{
    FirstAvailable, LeastConnections, LeastTraffic, PreferenceOrder, ResponseTimeOrder, RoundRobin,
};
pub use random::RandomOrder;
pub use sticky::Sticky;
pub use topology::{Cidr, CidrParseError, Topology};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ranking strategy a backend can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceMode {
    Preference,
    #[serde(alias = "leastconnections")]
    LeastConnected,
    LeastTraffic,
    ResponseTime,
    RoundRobin,
    Random,
    FirstAvailable,
}

impl BalanceMode {
    pub fn strategy(self) -> &'static dyn OrderingStrategy {
        match self {
            BalanceMode::Preference => &PreferenceOrder,
            BalanceMode::LeastConnected => &LeastConnections,
            BalanceMode::LeastTraffic => &LeastTraffic,
            BalanceMode::ResponseTime => &ResponseTimeOrder,
            BalanceMode::RoundRobin => &RoundRobin,
            BalanceMode::Random => &RandomOrder,
            BalanceMode::FirstAvailable => &FirstAvailable,
        }
    }
}

impl fmt::Display for BalanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.strategy().name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown balance mode '{0}'")]
pub struct BalanceModeParseError(pub String);

impl FromStr for BalanceMode {
    type Err = BalanceModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preference" => Ok(BalanceMode::Preference),
            "leastconnected" | "leastconnections" => Ok(BalanceMode::LeastConnected),
            "leasttraffic" => Ok(BalanceMode::LeastTraffic),
            "responsetime" => Ok(BalanceMode::ResponseTime),
            "roundrobin" => Ok(BalanceMode::RoundRobin),
            "random" => Ok(BalanceMode::Random),
            "firstavailable" => Ok(BalanceMode::FirstAvailable),
            _ => Err(BalanceModeParseError(s.to_string())),
        }
    }
}

/// Parses a comma separated chain such as `"preference,leastconnected"`.
pub fn parse_balance_chain(s: &str) -> Result<Vec<BalanceMode>, BalanceModeParseError> {
    s.split(',').map(str::parse).collect()
}

/// Applies a chain of ranking strategies.
///
/// The chain runs last to first over stable sorts, so the first mode is the
/// most significant key and later modes break its ties.
pub fn rank(chain: &[BalanceMode], mut candidates: Vec<NodeSnapshot>) -> Vec<NodeSnapshot> {
    for mode in chain.iter().rev() {
        candidates = mode.strategy().order(candidates);
    }
    candidates
}
