// src/load_balancer/sticky.rs
use super::{NodeSnapshot, OrderingStrategy};

/// Pins a client to the node whose uuid matches its sticky key.
///
/// Without a match the candidates come back unchanged, so the caller still
/// ranks them.
#[derive(Debug, Clone)]
pub struct Sticky {
    key: String,
}

impl Sticky {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl OrderingStrategy for Sticky {
    fn order(&self, candidates: Vec<NodeSnapshot>) -> Vec<NodeSnapshot> {
        match candidates.iter().find(|c| c.uuid() == self.key) {
            Some(pinned) => vec![pinned.clone()],
            None => candidates,
        }
    }

    fn name(&self) -> &'static str {
        "sticky"
    }
}
