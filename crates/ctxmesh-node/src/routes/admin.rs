//! Health, status, and metrics endpoints.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::warn;

use ctxmesh_peers::PeerInfo;
use ctxmesh_types::NodeRole;

use crate::error::ApiError;
use crate::metrics::MetricsSnapshot;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: &'static str,
    server_type: NodeRole,
    node_id: String,
    region_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    server_type: NodeRole,
    node_id: String,
    region_id: String,
    port: u16,
    data_dir: String,
    contexts: usize,
    stream_subscribers: usize,
    upstream: Option<String>,
    sync_cycles: u64,
    uptime_seconds: u64,
    peers: Vec<PeerInfo>,
}

/// `GET /health`.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        server_type: state.config.role,
        node_id: state.config.node_id.clone(),
        region_id: state.config.region_id.clone(),
    })
}

/// `GET /status` - node descriptor including the live peer list.
pub async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let contexts = state.store.count().await?;
    let peers = match state.peers.peers().await {
        Ok(peers) => peers,
        Err(err) => {
            warn!(error = ?err, "peer directory unavailable for status");
            Vec::new()
        }
    };

    Ok(Json(StatusResponse {
        server_type: state.config.role,
        node_id: state.config.node_id.clone(),
        region_id: state.config.region_id.clone(),
        port: state.config.port,
        data_dir: state.config.data_dir.display().to_string(),
        contexts,
        stream_subscribers: state.bus.subscriber_count(),
        upstream: state.resolve_upstream().await,
        sync_cycles: state.sync.as_ref().map(|s| s.cycle_count()).unwrap_or(0),
        uptime_seconds: state.started.elapsed().as_secs(),
        peers,
    }))
}

/// `GET /metrics` - Prometheus exposition text.
pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = MetricsSnapshot {
        contexts: state.store.count().await.unwrap_or(0) as u64,
        propagation_pushes: state
            .propagator
            .as_ref()
            .map(|p| p.push_count())
            .unwrap_or(0),
        propagation_failures: state
            .propagator
            .as_ref()
            .map(|p| p.failure_count())
            .unwrap_or(0),
        sync_cycles: state.sync.as_ref().map(|s| s.cycle_count()).unwrap_or(0),
    };

    let body = state
        .metrics
        .render(snapshot)
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
