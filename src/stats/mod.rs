// src/stats/mod.rs
mod statistics;

pub use statistics::{
    ConnectionGuard, NodeStatistics, ResponseTimeAggregate, StatsSnapshot, MIN_RESPONSE_SAMPLES,
};
