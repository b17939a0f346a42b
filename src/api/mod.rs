//! HTTP API for plan submission, rollout state, cost summaries and metrics.

pub mod handlers;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_router;
