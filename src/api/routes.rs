//! HTTP API route definitions.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::handlers::{
    advance_block, costs, health, prometheus_metrics, ready, report_divergence, rollout,
    submit_plan, AppState,
};

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Rollout and cost monitoring
        .route("/api/v1/rollout", get(rollout))
        .route("/api/v1/rollout/divergence", post(report_divergence))
        .route("/api/v1/costs", get(costs))
        // Plan submission
        .route("/api/v1/plans", post(submit_plan))
        .route("/api/v1/block", post(advance_block))
        .route("/metrics", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use time::OffsetDateTime;
    use tower::ServiceExt;

    use crate::control::{ControlHandle, ControlLoop};
    use crate::engine::ExecutionResult;
    use crate::monitor::{CostMonitor, CostMonitorConfig};
    use crate::parity::corpus::{two_hop_scenario, UNIT};
    use crate::plan::PlanSpec;
    use crate::rollout::{RolloutConfig, RolloutController, RolloutState};
    use crate::service::{BlockUpdate, ExecutionService};

    fn app_state() -> (AppState, ControlLoop, PlanSpec) {
        let scenario = two_hop_scenario(2 * UNIT);
        let controller =
            RolloutController::new(RolloutConfig::default(), OffsetDateTime::UNIX_EPOCH).unwrap();
        let (control, handle): (ControlLoop, ControlHandle) = ControlLoop::new(
            CostMonitor::new(CostMonitorConfig::default()),
            controller,
            None,
            16,
        );
        let service = ExecutionService::new(
            scenario.engine,
            scenario.ledger,
            Arc::new(scenario.provider),
            handle,
        );
        (
            AppState::new(Arc::new(service)),
            control,
            PlanSpec::from(scenario.plan),
        )
    }

    fn json_post(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (state, _control, _) = app_state();
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_endpoint_returns_503_when_not_ready() {
        let (state, _control, _) = app_state();
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ready_endpoint_returns_200_when_ready() {
        let (state, _control, _) = app_state();
        state.set_ready(true);
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rollout_endpoint_returns_state() {
        let (state, _control, _) = app_state();
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/rollout")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let rollout: RolloutState = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(rollout.traffic_percentage, 0);
    }

    #[tokio::test]
    async fn submitted_plan_is_executed() {
        let (state, _control, spec) = app_state();
        state.set_ready(true);
        let app = create_router(state);

        let body = serde_json::to_string(&spec).unwrap();
        let response = app.oneshot(json_post("/api/v1/plans", body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let result: ExecutionResult = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(result.success);
        assert_eq!(result.realized_profit, 5_755_012);
    }

    #[tokio::test]
    async fn broken_plan_is_a_bad_request() {
        let (state, _control, mut spec) = app_state();
        state.set_ready(true);
        let app = create_router(state);

        spec.steps.pop();
        let body = serde_json::to_string(&spec).unwrap();
        let response = app.oneshot(json_post("/api/v1/plans", body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn plans_are_refused_until_ready() {
        let (state, _control, spec) = app_state();
        let app = create_router(state);

        let body = serde_json::to_string(&spec).unwrap();
        let response = app.oneshot(json_post("/api/v1/plans", body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn divergence_reports_are_accepted() {
        let (state, mut control, _) = app_state();
        let app = create_router(state);

        let body = r#"{"case_id":"live","field":"final_balances","reference":"a","candidate":"b"}"#;
        let response = app
            .oneshot(json_post("/api/v1/rollout/divergence", body.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(control.try_next_event().is_some());
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let (state, _control, _) = app_state();
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn block_endpoint_advances_the_ledger() {
        let (state, _control, _) = app_state();
        let service = Arc::clone(&state.service);
        let app = create_router(state);

        let response = app
            .oneshot(json_post("/api/v1/block", r#"{"block":7}"#.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let update: BlockUpdate = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(update, BlockUpdate { block: 7, pruned: 0 });
        assert_eq!(service.ledger_snapshot().block(), 7);
    }
}
