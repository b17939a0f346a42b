//! Prometheus metrics for executions, rollout and cost monitoring.
//!
//! This module provides metrics for:
//! - Plan submissions, commits and reverts per implementation
//! - Metered execution cost and wall-clock execution latency
//! - Rollout traffic share and transitions
//! - Cost anomalies, live parity divergences and dropped control events

use std::time::Instant;

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use tracing::debug;

use crate::engine::ExecutionResult;
use crate::monitor::Severity;
use crate::parity::DivergenceField;
use crate::rollout::Transition;

// === Metric Name Constants ===

/// Plans submitted counter metric name.
pub const METRIC_PLANS_SUBMITTED: &str = "plans_submitted_total";
/// Plans committed counter metric name.
pub const METRIC_PLANS_COMMITTED: &str = "plans_committed_total";
/// Plans reverted counter metric name.
pub const METRIC_PLANS_REVERTED: &str = "plans_reverted_total";
/// Duplicate plan rejections counter metric name.
pub const METRIC_DUPLICATE_PLANS: &str = "duplicate_plans_total";
/// Metered execution cost metric name.
pub const METRIC_EXECUTION_COST: &str = "execution_cost_units";
/// Execution latency metric name.
pub const METRIC_EXECUTION_LATENCY: &str = "execution_latency_ms";
/// HTTP request latency metric name.
pub const METRIC_HTTP_REQUEST_LATENCY: &str = "http_request_latency_ms";
/// Rollout traffic share gauge metric name.
pub const METRIC_ROLLOUT_TRAFFIC: &str = "rollout_traffic_percentage";
/// Rollout transitions counter metric name.
pub const METRIC_ROLLOUT_TRANSITIONS: &str = "rollout_transitions_total";
/// Cost anomalies counter metric name.
pub const METRIC_COST_ANOMALIES: &str = "cost_anomalies_total";
/// Parity divergences counter metric name.
pub const METRIC_PARITY_DIVERGENCES: &str = "parity_divergences_total";
/// Dropped control events counter metric name.
pub const METRIC_CONTROL_EVENTS_DROPPED: &str = "control_events_dropped_total";

/// Initialize all metric descriptions.
/// Call this once at startup to register metrics with descriptions.
pub fn init_metrics() {
    // Histograms
    describe_histogram!(
        METRIC_EXECUTION_COST,
        "Metered cost units consumed per execution"
    );
    describe_histogram!(
        METRIC_EXECUTION_LATENCY,
        "Wall-clock execution latency in milliseconds"
    );
    describe_histogram!(
        METRIC_HTTP_REQUEST_LATENCY,
        "HTTP request latency in milliseconds"
    );

    // Gauges
    describe_gauge!(
        METRIC_ROLLOUT_TRAFFIC,
        "Share of opportunities routed to the optimized engine"
    );

    // Counters
    describe_counter!(METRIC_PLANS_SUBMITTED, "Total number of plans submitted");
    describe_counter!(METRIC_PLANS_COMMITTED, "Total number of plans committed");
    describe_counter!(METRIC_PLANS_REVERTED, "Total number of plans reverted");
    describe_counter!(
        METRIC_DUPLICATE_PLANS,
        "Total number of plans rejected as already consumed"
    );
    describe_counter!(
        METRIC_ROLLOUT_TRANSITIONS,
        "Total number of rollout advances and rollbacks"
    );
    describe_counter!(METRIC_COST_ANOMALIES, "Total number of cost anomalies");
    describe_counter!(
        METRIC_PARITY_DIVERGENCES,
        "Total number of live parity divergences"
    );
    describe_counter!(
        METRIC_CONTROL_EVENTS_DROPPED,
        "Total number of control events overwritten before processing"
    );

    debug!("Metrics initialized");
}

/// Record the outcome and cost of one execution.
pub fn record_execution(result: &ExecutionResult) {
    let implementation = result.implementation_tag.as_ref().to_string();
    counter!(METRIC_PLANS_SUBMITTED, "implementation" => implementation.clone()).increment(1);
    histogram!(METRIC_EXECUTION_COST, "implementation" => implementation.clone())
        .record(result.cost_consumed as f64);

    match result.failure_class() {
        None => counter!(METRIC_PLANS_COMMITTED, "implementation" => implementation).increment(1),
        Some(class) => counter!(
            METRIC_PLANS_REVERTED,
            "implementation" => implementation,
            "reason" => class.as_ref().to_string()
        )
        .increment(1),
    }
}

/// Record HTTP request latency.
pub fn record_http_latency(start: Instant, endpoint: &str) {
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    histogram!(METRIC_HTTP_REQUEST_LATENCY, "endpoint" => endpoint.to_string()).record(latency_ms);
}

/// Increment duplicate plan counter.
pub fn inc_duplicate_plans() {
    counter!(METRIC_DUPLICATE_PLANS).increment(1);
}

/// Set the rollout traffic gauge.
pub fn set_rollout_traffic(traffic_percentage: u8) {
    gauge!(METRIC_ROLLOUT_TRAFFIC).set(f64::from(traffic_percentage));
}

/// Increment rollout transition counter.
pub fn inc_rollout_transition(transition: &Transition) {
    let kind = match transition {
        Transition::Advanced { .. } => "advanced",
        Transition::RolledBack { .. } => "rolled_back",
    };
    counter!(METRIC_ROLLOUT_TRANSITIONS, "kind" => kind).increment(1);
}

/// Increment cost anomaly counter.
pub fn inc_cost_anomaly(severity: Severity) {
    counter!(METRIC_COST_ANOMALIES, "severity" => severity.as_ref().to_string()).increment(1);
}

/// Increment parity divergence counter.
pub fn inc_parity_divergence(field: DivergenceField) {
    counter!(METRIC_PARITY_DIVERGENCES, "field" => field.as_ref().to_string()).increment(1);
}

/// Increment dropped control events counter.
pub fn inc_control_events_dropped(n: u64) {
    counter!(METRIC_CONTROL_EVENTS_DROPPED).increment(n);
}

/// RAII guard for timing operations.
/// Automatically records latency when dropped.
pub struct LatencyTimer {
    start: Instant,
    metric_name: &'static str,
}

impl LatencyTimer {
    /// Create a new latency timer for the given metric.
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }

    /// Get elapsed time in milliseconds (without recording).
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        histogram!(self.metric_name).record(latency_ms);
    }
}

/// Create a latency timer for plan execution.
pub fn timer_execution() -> LatencyTimer {
    LatencyTimer::new(METRIC_EXECUTION_LATENCY)
}
