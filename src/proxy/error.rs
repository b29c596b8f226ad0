// src/proxy/error.rs
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Every node of the backend was filtered out.
    #[error("no backend node available in backend '{0}'")]
    NoBackendAvailable(String),

    #[error("no backend answers for host '{0}'")]
    NoBackendForHost(String),

    #[error("node '{uuid}' is already registered in backend '{backend}'")]
    DuplicateNode { uuid: String, backend: String },

    #[error("node '{uuid}' is not registered in backend '{backend}'")]
    UnknownNode { uuid: String, backend: String },

    #[error("no listener named '{0}'")]
    UnknownListener(String),

    #[error("listener is shutting down")]
    ListenerClosed,

    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProxyError::NoBackendAvailable("app".to_string());
        assert_eq!(err.to_string(), "no backend node available in backend 'app'");

        let err = ProxyError::DuplicateNode {
            uuid: "n1".to_string(),
            backend: "app".to_string(),
        };
        assert_eq!(err.to_string(), "node 'n1' is already registered in backend 'app'");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: ProxyError = io_err.into();
        assert!(matches!(err, ProxyError::Io(_)));
    }
}
