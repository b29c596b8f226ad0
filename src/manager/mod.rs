// src/manager/mod.rs
mod cluster;
mod snapshot;

pub use cluster::{Manager, ReloadReport};
pub use snapshot::{BackendSnapshot, ClusterSnapshot, ListenerSnapshot, NodeReport};
