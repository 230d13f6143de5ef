//! # Probe Server
//!
//! HTTP server exposing liveness/readiness probes and Prometheus metrics.

use crate::observability::metrics;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Shared server state. `is_bound` flips once the listener is accepting;
/// `is_ready` flips once the controller finished initializing, so readiness
/// probes only pass when reconciliation can actually happen.
pub struct ServerState {
    pub is_bound: AtomicBool,
    pub is_ready: AtomicBool,
}

impl ServerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            is_bound: AtomicBool::new(false),
            is_ready: AtomicBool::new(false),
        })
    }
}

/// Bind and serve `/healthz`, `/readyz` and `/metrics`.
pub async fn start_server(port: u16, state: Arc<ServerState>) -> Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind probe server on port {port}"))?;
    state.is_bound.store(true, Ordering::Relaxed);
    info!("probe server listening on :{port}");

    axum::serve(listener, app)
        .await
        .context("probe server exited")?;
    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<ServerState>>) -> StatusCode {
    if state.is_ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_handler() -> String {
    metrics::gather()
}
