//! Worker HTTP API: health and metrics endpoints.
//!
//! Exposes three routes:
//! - `GET /health` - liveness plus whether the loop is running
//! - `GET /ready` - 503 until the loop has completed its first poll
//! - `GET /metrics` - counters, in-flight connections, breakers, cache stats

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use conduit::idempotency::{IdempotencyCache, IdempotencyStats};
use conduit::metrics::{MetricsSnapshot, WorkerMetrics};
use conduit::resilience::{BreakerRegistry, BreakerSnapshot};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use crate::resolver::{IdentityResolver, ResolverStats};
use crate::worker::WorkerState;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub state: Arc<WorkerState>,
    pub metrics: Arc<WorkerMetrics>,
    pub idempotency: Arc<IdempotencyCache>,
    pub breakers: Arc<BreakerRegistry>,
    pub resolver: Arc<IdentityResolver>,
}

/// Response body for `GET /metrics`.
#[derive(Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    pub in_flight_connections: usize,
    pub breakers: Vec<BreakerSnapshot>,
    pub idempotency: IdempotencyStats,
    pub resolver: ResolverStats,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "running": state.state.is_running(),
    }))
}

async fn ready(State(state): State<ApiState>) -> Response {
    if state.state.is_polling() {
        (StatusCode::OK, Json(json!({ "ready": true }))).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "ready": false }))).into_response()
    }
}

async fn metrics(State(state): State<ApiState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        counters: state.metrics.snapshot(),
        in_flight_connections: state.state.active_connections(),
        breakers: state.breakers.snapshots(),
        idempotency: state.idempotency.stats(),
        resolver: state.resolver.stats(),
    })
}
