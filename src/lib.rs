// src/lib.rs
pub mod config;
pub mod health;
pub mod load_balancer;
pub mod manager;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod stats;
