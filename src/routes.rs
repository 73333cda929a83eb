//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (applied in order)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │ Request Timeout  │ ← X-Request-Timeout → deadline extension
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Sets / propagates X-Request-Id
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Idempotency Gate │ ← HIT replay / 409 in flight      (/topups only)
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if exceeded, 500 on store failure (/topups only)
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Routes
//!
//! - `GET /health` - Store reachability (never gated or limited)
//! - `POST /topups` - Idempotent, rate-limited top-up

use axum::Router;
use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, Request};
use axum::middleware::from_fn;
use axum::routing::{get, post};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span};

use crate::error::{AppError, AppResult};
use crate::handlers;
use crate::middleware::rate_limit::client_ip_key;
use crate::middleware::{IdempotencyLayer, KeyedRateLimitLayer, extract_request_timeout};
use crate::state::AppState;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Rate limiter action tag for top-ups.
pub const TOPUP_ACTION: &str = "topup";

/// Build the application router with all routes and middleware configured.
///
/// The admission middleware share `state.store`.
///
/// # Errors
///
/// Returns `AppError::ConfigError` if the gate or limiter settings are invalid.
pub fn build_router(state: AppState) -> AppResult<Router> {
    let config = &state.config;

    // =========================================================================
    // Admission Middleware
    // =========================================================================
    let gate = IdempotencyLayer::new(state.store.clone(), config.idempotency())
        .map_err(|e| AppError::ConfigError(format!("idempotency gate: {e}")))?;

    let limiter = KeyedRateLimitLayer::builder(TOPUP_ACTION)
        .limit(config.rate_limit_max_requests)
        .window(config.rate_limit_window)
        .key_fn(client_ip_key())
        .failure_policy(config.rate_limit_failure_policy)
        .store_timeout(config.store_operation_timeout)
        .audit_body_limit(config.audit_body_max_bytes)
        .build(state.store.clone())
        .map_err(|e| AppError::ConfigError(format!("rate limiter: {e}")))?;

    info!(
        limit = config.rate_limit_max_requests,
        window_secs = config.rate_limit_window.as_secs(),
        limiter_policy = %config.rate_limit_failure_policy,
        idempotency_policy = %config.idempotency_failure_policy,
        "Admission middleware configured"
    );

    // Gate outside the limiter: replays do not consume quota
    let topups = Router::new()
        .route("/topups", post(handlers::create_topup))
        .layer(limiter)
        .layer(gate);

    // =========================================================================
    // Build Router with Routes
    // =========================================================================
    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(topups);

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Request body size limit (prevents DoS via large payloads)
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. Tracing, with the request id in every span
    router = router.layer(TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");
        info_span!(
            "request",
            method = %req.method(),
            uri = %req.uri(),
            request_id = %request_id,
        )
    }));

    // 3. Request ID (set before tracing sees the request, copied to the response)
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    router = router.layer(PropagateRequestIdLayer::new(request_id.clone()));
    router = router.layer(SetRequestIdLayer::new(request_id, MakeRequestUuid));

    // 4. Client deadline, outermost so it is anchored at arrival
    router = router.layer(from_fn(extract_request_timeout));

    Ok(router.with_state(state))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::InMemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_build_router_with_defaults() {
        let state = AppState::new(Arc::new(InMemoryStore::new()), Config::default());
        assert!(build_router(state).is_ok());
    }

    #[test]
    fn test_build_router_rejects_sub_second_window() {
        let config = Config {
            rate_limit_window: Duration::from_millis(200),
            ..Config::default()
        };
        let state = AppState::new(Arc::new(InMemoryStore::new()), config);
        assert!(matches!(build_router(state), Err(AppError::ConfigError(_))));
    }
}
