//! # HTTP Server
//!
//! Serves `/metrics` on the metrics address and `/healthz` + `/readyz` on
//! the probe address.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tracing::{error, info};

pub struct ServerState {
    is_ready: AtomicBool,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            is_ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.is_ready.store(ready, Ordering::Relaxed);
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the metrics and probe servers in the background.
pub fn spawn(metrics_addr: &str, probe_addr: &str, state: Arc<ServerState>) {
    let metrics_addr = bind_addr(metrics_addr);
    let probe_addr = bind_addr(probe_addr);
    tokio::spawn(async move {
        if let Err(e) = serve_metrics(&metrics_addr).await {
            error!("metrics server error: {e:#}");
        }
    });
    tokio::spawn(async move {
        if let Err(e) = serve_probes(&probe_addr, state).await {
            error!("probe server error: {e:#}");
        }
    });
}

/// Addresses arrive in the `:9090` form; bind on all interfaces.
fn bind_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

async fn serve_metrics(addr: &str) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = TcpListener::bind(addr).await?;
    info!("metrics server listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn serve_probes(addr: &str, state: Arc<ServerState>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state);
    let listener = TcpListener::bind(addr).await?;
    info!("probe server listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = crate::observability::metrics::REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!("failed to encode metrics: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("failed to encode metrics: {e}").into_bytes(),
        );
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.is_ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_expands_bare_ports() {
        assert_eq!(bind_addr(":9090"), "0.0.0.0:9090");
        assert_eq!(bind_addr("127.0.0.1:8081"), "127.0.0.1:8081");
    }

    #[test]
    fn ready_state_flips() {
        let state = ServerState::new();
        assert!(!state.is_ready.load(Ordering::Relaxed));
        state.set_ready(true);
        assert!(state.is_ready.load(Ordering::Relaxed));
    }
}
