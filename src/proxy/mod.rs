// src/proxy/mod.rs
mod backend;
mod error;
mod forward;
mod limit;
mod listener;
mod node;

pub use backend::{Backend, BackendSettings, NoHealthyPolicy, SyncReport};
pub use error::ProxyError;
pub use forward::{ConnectionContext, ConnectionHandler, TcpForwarder};
pub use limit::{AdmissionLimiter, AdmissionPermit};
pub use listener::{Listener, DEFAULT_HOST};
pub use node::{BackendNode, NodeSpec, NodeStatus};
