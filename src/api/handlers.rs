//! HTTP API handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::metrics;
use crate::parity::ParityDivergence;
use crate::plan::{ArbitragePlan, PlanSpec};
use crate::service::ExecutionService;

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// Whether the service accepts plans.
    pub ready: Arc<AtomicBool>,
    /// Plan execution service.
    pub service: Arc<ExecutionService>,
    /// Prometheus recorder handle, when installed.
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// Create new app state.
    pub fn new(service: Arc<ExecutionService>) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            service,
            prometheus: None,
        }
    }

    /// Attach a Prometheus handle for `/metrics`.
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Set ready state.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status: "ok".
    pub status: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Whether service is ready.
    pub ready: bool,
    /// Current optimized traffic share.
    pub traffic_percentage: u8,
}

/// Error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// What went wrong.
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Health check handler - always returns 200.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Readiness check handler - returns 200 if ready, 503 otherwise.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let is_ready = state.is_ready();
    let response = ReadyResponse {
        ready: is_ready,
        traffic_percentage: state.service.rollout_state().traffic_percentage,
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Rollout handler - returns the latest rollout snapshot.
pub async fn rollout(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.rollout_state())
}

/// Costs handler - returns per-series cost summaries.
pub async fn costs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.cost_summaries())
}

/// Plan submission handler - executes the plan and returns its result.
pub async fn submit_plan(
    State(state): State<AppState>,
    Json(spec): Json<PlanSpec>,
) -> axum::response::Response {
    let start = Instant::now();
    if !state.is_ready() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "service is not ready");
    }

    let plan = match ArbitragePlan::try_from(spec) {
        Ok(plan) => plan,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
    };

    let service = Arc::clone(&state.service);
    let response = match tokio::task::spawn_blocking(move || service.submit_plan(&plan)).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => {
            error!(error = %err, "Plan execution task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "plan execution failed")
        }
    };

    metrics::record_http_latency(start, "/api/v1/plans");
    response
}

/// Chain head notification.
#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    /// Latest block.
    pub block: u64,
}

/// Block handler - advances the live ledger and prunes expired plan ids.
pub async fn advance_block(
    State(state): State<AppState>,
    Json(request): Json<BlockRequest>,
) -> impl IntoResponse {
    Json(state.service.advance_block(request.block))
}

/// Divergence report handler - forwards a live divergence to the control loop.
pub async fn report_divergence(
    State(state): State<AppState>,
    Json(divergence): Json<ParityDivergence>,
) -> impl IntoResponse {
    state.service.report_divergence(divergence);
    StatusCode::ACCEPTED
}

/// Metrics handler - renders Prometheus text.
pub async fn prometheus_metrics(State(state): State<AppState>) -> axum::response::Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => error_response(StatusCode::NOT_FOUND, "metrics recorder not installed"),
    }
}
