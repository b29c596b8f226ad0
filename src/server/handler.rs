// src/server/handler.rs
use hyper::{header, Body, Method, Request, Response, StatusCode};
use std::sync::Arc;
use tower::Service;

use crate::manager::Manager;
use crate::metrics::MetricsRegistry;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Serves Prometheus metrics on the configured path and the cluster snapshot
/// as JSON on `/status`.
#[derive(Clone)]
pub struct StatusHandler {
    manager: Arc<Manager>,
    registry: Arc<MetricsRegistry>,
    metrics_path: Arc<str>,
}

impl StatusHandler {
    pub fn new(manager: Arc<Manager>, registry: Arc<MetricsRegistry>, metrics_path: &str) -> Self {
        Self {
            manager,
            registry,
            metrics_path: Arc::from(metrics_path),
        }
    }

    fn respond(&self, req: &Request<Body>) -> Result<Response<Body>, BoxError> {
        if req.method() != Method::GET {
            return Ok(Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(Body::empty())?);
        }

        let path = req.uri().path();
        if path == &*self.metrics_path {
            self.registry.collector().observe(&self.manager.snapshot());
            let response = match self.registry.gather() {
                Ok(metrics) => Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                    .body(Body::from(metrics))?,
                Err(e) => {
                    tracing::error!(%e, "failed to encode metrics");
                    Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Body::empty())?
                }
            };
            Ok(response)
        } else if path == "/status" {
            let body = serde_json::to_vec(&self.manager.snapshot())?;
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))?)
        } else {
            Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("Not Found"))?)
        }
    }
}

impl Service<Request<Body>> for StatusHandler {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let result = self.respond(&req);
        Box::pin(async move { result })
    }
}
