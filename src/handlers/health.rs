//! Health endpoint.
//!
//! `GET /health` pings the shared store within the configured store timeout.
//! Returns 200 when the store answers and 503 (`"degraded"`) when it does not,
//! so load balancers can drain an instance that lost its store.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::{instrument, warn};

use crate::metrics;
use crate::models::HealthResponse;
use crate::state::AppState;
use crate::store::CallBudget;

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "store_reachable": true,
///   "version": "0.1.0",
///   "uptime_seconds": 42,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let budget = CallBudget::new(state.config.store_operation_timeout);
    let store_reachable = match budget.run("ping", state.store.ping()).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Shared store health probe failed");
            false
        }
    };
    metrics::set_store_up(store_reachable);

    let (status, label) = if store_reachable {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            store_reachable,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.uptime_seconds(),
            timestamp: Utc::now(),
        }),
    )
}
