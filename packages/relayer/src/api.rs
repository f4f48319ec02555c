//! Health & Status API endpoints
//!
//! - GET /health  - Relayer identity and progress (JSON)
//! - GET /healthz - Liveness probe
//! - GET /readyz  - Ready once the relay or transport cursor moved
//! - GET /metrics - Prometheus metrics
//! - GET /status  - Cursors and task history (JSON)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use alloy::primitives::Address;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tracing::info;

use crate::config::Roles;
use crate::history::TaskHistoryStore;
use crate::metrics;
use crate::store::{HeaderStore, RELAY_LISTENER, TRANSPORT_LISTENER};

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub relayer: Address,
    pub relay_contract: Address,
    pub roles: Roles,
    pub store: Arc<dyn HeaderStore>,
    /// Present when the transport role runs
    pub history: Option<Arc<TaskHistoryStore>>,
    pub started: Instant,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub relayer: String,
    pub roles: Vec<&'static str>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct StatusResponse {
    pub relay_cursor: Option<u64>,
    pub transport_cursor: Option<u64>,
    pub shadow_top_height: u64,
    pub ended_tasks: usize,
    pub active_task_workers: u64,
}

fn role_names(roles: &Roles) -> Vec<&'static str> {
    let mut names = Vec::new();
    if roles.relay {
        names.push("relay");
    }
    if roles.transport {
        names.push("transport");
    }
    names
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        relayer: format!("{}", state.relayer),
        roles: role_names(&state.roles),
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

/// Liveness probe (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

async fn transport_cursor(state: &AppState) -> Option<u64> {
    let history = state.history.as_ref()?;
    state
        .store
        .cursor(TRANSPORT_LISTENER, history.transport_address())
        .await
        .ok()
        .flatten()
}

async fn readiness(State(state): State<AppState>) -> &'static str {
    let relay = state
        .store
        .cursor(RELAY_LISTENER, state.relay_contract)
        .await
        .ok()
        .flatten();
    if relay.is_some() || transport_cursor(&state).await.is_some() {
        "OK"
    } else {
        "NOT_READY"
    }
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, Response> {
    let relay_cursor = state
        .store
        .cursor(RELAY_LISTENER, state.relay_contract)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response())?;

    let ended_tasks = match &state.history {
        Some(history) => history.len().await,
        None => 0,
    };

    Ok(Json(StatusResponse {
        relay_cursor,
        transport_cursor: transport_cursor(&state).await,
        shadow_top_height: metrics::SHADOW_TOP_HEIGHT.get() as u64,
        ended_tasks,
        active_task_workers: metrics::ACTIVE_TASK_WORKERS.get() as u64,
    }))
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .with_state(state)
}

/// Start the HTTP server for health, status and metrics
pub async fn start_api_server(addr: SocketAddr, state: AppState) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server started");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
