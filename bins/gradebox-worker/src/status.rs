// Operational surface: per-track runner health and Prometheus metrics

use crate::engine::RuntimeHealth;
use crate::executor::ExecutionService;
use crate::metrics;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Every track can run right now
    pub healthy: bool,
    pub tracks: BTreeMap<String, RuntimeHealth>,
}

pub fn routes(service: ExecutionService) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(service)
}

async fn status_handler(State(service): State<ExecutionService>) -> impl IntoResponse {
    let tracks = service.status().await;
    let healthy = tracks.values().all(|h| h.runtime_reachable && h.image_present);
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(StatusReport { healthy, tracks }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

pub async fn serve(addr: &str, service: ExecutionService) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Status server listening on {}", addr);
    axum::serve(listener, routes(service)).await?;
    Ok(())
}
