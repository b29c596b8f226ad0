// src/load_balancer/random.rs
use super::{NodeSnapshot, OrderingStrategy};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::{Mutex, OnceLock, PoisonError};

// Seeded once per process; never reseeded per call.
static GENERATOR: OnceLock<Mutex<StdRng>> = OnceLock::new();

fn generator() -> &'static Mutex<StdRng> {
    GENERATOR.get_or_init(|| Mutex::new(StdRng::from_entropy()))
}

/// Uniform Fisher-Yates shuffle of the candidates.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomOrder;

impl OrderingStrategy for RandomOrder {
    fn order(&self, mut candidates: Vec<NodeSnapshot>) -> Vec<NodeSnapshot> {
        let mut rng = generator().lock().unwrap_or_else(PoisonError::into_inner);
        candidates.shuffle(&mut *rng);
        candidates
    }

    fn name(&self) -> &'static str {
        "random"
    }
}
