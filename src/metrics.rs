//! Prometheus metrics for the admission middleware.
//!
//! Metrics are exposed via a dedicated HTTP listener (`METRICS_PORT`, default
//! 9090, 0 disables it). Recording functions are no-ops until a recorder is
//! installed, so library users and tests can call them freely.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_idempotency_requests_total` - Gate outcomes (label: outcome)
//! - `gateway_rate_limit_decisions_total` - Limiter decisions (labels: action, decision)
//! - `gateway_audit_appends_total` - Violation log appends (labels: action, status)
//! - `gateway_store_errors_total` - Failed store calls (labels: operation, kind)
//!
//! ## Histograms
//! - `gateway_store_call_duration_seconds` - Store round-trip time (label: operation)
//! - `gateway_idempotency_wait_seconds` - Time spent waiting on an in-flight duplicate
//!
//! ## Gauges
//! - `gateway_store_up` - Result of the last health probe (1 = reachable, 0 = not)

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const IDEMPOTENCY_REQUESTS_TOTAL: &str = "gateway_idempotency_requests_total";
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "gateway_rate_limit_decisions_total";
    pub const AUDIT_APPENDS_TOTAL: &str = "gateway_audit_appends_total";
    pub const STORE_ERRORS_TOTAL: &str = "gateway_store_errors_total";
    pub const STORE_CALL_DURATION_SECONDS: &str = "gateway_store_call_duration_seconds";
    pub const IDEMPOTENCY_WAIT_SECONDS: &str = "gateway_idempotency_wait_seconds";
    pub const STORE_UP: &str = "gateway_store_up";
}

/// Gate outcome labels.
pub mod outcome {
    /// Stored response replayed.
    pub const HIT: &str = "hit";
    /// Handler ran and its response was stored.
    pub const MISS: &str = "miss";
    /// Handler ran, response not stored (5xx, oversized, or failed commit).
    pub const NOT_CACHED: &str = "not_cached";
    /// Duplicate still in flight after the wait expired.
    pub const CONFLICT: &str = "conflict";
    /// Store failed before the handler ran.
    pub const STORE_ERROR: &str = "store_error";
}

/// Limiter decision labels.
pub mod decision {
    pub const ALLOWED: &str = "allowed";
    pub const DENIED: &str = "denied";
    /// Store failed and the request was admitted unmetered.
    pub const FAIL_OPEN: &str = "fail_open";
    /// Store failed and the request was rejected.
    pub const FAIL_CLOSED: &str = "fail_closed";
}

/// Initialize the Prometheus metrics exporter.
///
/// # Errors
///
/// Returns a message if the exporter could not be installed (e.g. the port is
/// taken or a recorder is already installed).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::IDEMPOTENCY_REQUESTS_TOTAL,
        "Requests carrying an idempotency key, by gate outcome"
    );
    describe_counter!(
        names::RATE_LIMIT_DECISIONS_TOTAL,
        "Rate limiter decisions by action tag"
    );
    describe_counter!(
        names::AUDIT_APPENDS_TOTAL,
        "Violation audit log appends by action tag"
    );
    describe_counter!(
        names::STORE_ERRORS_TOTAL,
        "Shared store calls that failed or timed out"
    );

    describe_histogram!(
        names::STORE_CALL_DURATION_SECONDS,
        "Shared store call duration in seconds"
    );
    describe_histogram!(
        names::IDEMPOTENCY_WAIT_SECONDS,
        "Time spent waiting for an in-flight request with the same key"
    );

    describe_gauge!(
        names::STORE_UP,
        "Shared store reachability at the last health probe (1 = up, 0 = down)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record an idempotency gate outcome (see [`outcome`]).
pub fn record_idempotency_outcome(outcome: &'static str) {
    counter!(names::IDEMPOTENCY_REQUESTS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a rate limiter decision (see [`decision`]).
pub fn record_rate_limit_decision(action: &str, decision: &'static str) {
    counter!(names::RATE_LIMIT_DECISIONS_TOTAL, "action" => action.to_string(), "decision" => decision)
        .increment(1);
}

/// Record a violation audit append.
pub fn record_audit_append(action: &str, success: bool) {
    let status = if success { "ok" } else { "error" };
    counter!(names::AUDIT_APPENDS_TOTAL, "action" => action.to_string(), "status" => status)
        .increment(1);
}

/// Record a failed store call.
pub fn record_store_error(operation: &'static str, kind: &'static str) {
    counter!(names::STORE_ERRORS_TOTAL, "operation" => operation, "kind" => kind).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

/// Record a store round-trip.
pub fn record_store_duration(operation: &'static str, duration_secs: f64) {
    histogram!(names::STORE_CALL_DURATION_SECONDS, "operation" => operation).record(duration_secs);
}

/// Record time spent waiting on an in-flight duplicate.
pub fn record_idempotency_wait(duration_secs: f64) {
    histogram!(names::IDEMPOTENCY_WAIT_SECONDS).record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

/// Update the store reachability gauge.
pub fn set_store_up(up: bool) {
    gauge!(names::STORE_UP).set(if up { 1.0 } else { 0.0 });
}
