// src/load_balancer/topology.rs
use super::{NodeSnapshot, OrderingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid CIDR '{value}': {reason}")]
pub struct CidrParseError {
    pub value: String,
    pub reason: &'static str,
}

/// An IPv4 or IPv6 network in prefix notation, stored with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, CidrParseError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(CidrParseError {
                value: format!("{addr}/{prefix}"),
                reason: "prefix length out of range",
            });
        }
        let network = match addr {
            IpAddr::V4(v4) => IpAddr::V4((u32::from(v4) & v4_mask(prefix)).into()),
            IpAddr::V6(v6) => IpAddr::V6((u128::from(v6) & v6_mask(prefix)).into()),
        };
        Ok(Self { network, prefix })
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => u32::from(ip) & v4_mask(self.prefix) == u32::from(net),
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(ip) & v6_mask(self.prefix) == u128::from(net)
            }
            _ => false,
        }
    }
}

fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn v6_mask(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for Cidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| CidrParseError {
            value: s.to_string(),
            reason,
        };
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(|| err("missing prefix length"))?;
        let addr: IpAddr = addr.parse().map_err(|_| err("invalid address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| err("invalid prefix length"))?;
        Cidr::new(addr, prefix).map_err(|e| err(e.reason))
    }
}

impl TryFrom<String> for Cidr {
    type Error = CidrParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(cidr: Cidr) -> Self {
        cidr.to_string()
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Keeps the candidates whose topology contains the client address.
///
/// Each node is kept at most once, however many of its networks match. With no
/// match the candidate set is returned as is.
#[derive(Debug, Clone, Copy)]
pub struct Topology {
    client: IpAddr,
}

impl Topology {
    pub fn new(client: IpAddr) -> Self {
        Self { client }
    }
}

impl OrderingStrategy for Topology {
    fn order(&self, candidates: Vec<NodeSnapshot>) -> Vec<NodeSnapshot> {
        let mut seen = HashSet::new();
        let matches: Vec<NodeSnapshot> = candidates
            .iter()
            .filter(|candidate| {
                candidate
                    .node
                    .topology()
                    .iter()
                    .any(|cidr| cidr.contains(self.client))
            })
            .filter(|candidate| seen.insert(candidate.uuid().to_string()))
            .cloned()
            .collect();

        if matches.is_empty() {
            candidates
        } else {
            matches
        }
    }

    fn name(&self) -> &'static str {
        "topology"
    }
}
