//! Keyed fixed-window rate limiting backed by the shared store.
//!
//! # Algorithm
//!
//! Each request increments the counter at `ratelimit:{action}:{identity}` in
//! one atomic store call that also gives a counter without a TTL (just created,
//! or left behind by a lost expiry) the window as its expiry. This anchors the
//! window at the first request; later increments leave the expiry untouched.
//! When the counter expires the next request starts a fresh window.
//!
//! ```text
//! t0        t0+30s     t0+window
//! │ 1  2     3  4(429)  │ 1 ...
//! └── window ───────────┘
//! ```
//!
//! The store's atomic increment is the only concurrency primitive; nothing is
//! kept in process memory between requests, so any number of replicas share
//! one quota per key.
//!
//! # Response Headers
//!
//! On rate limit exceeded (429):
//! - `Retry-After`: Window length in whole seconds
//! - `X-RateLimit-Limit`: Configured limit
//! - `X-RateLimit-Remaining`: Always `0`
//!
//! Every rejection is appended to the violation audit log for the same key.
//!
//! # Store Failures
//!
//! Defaults to [`FailurePolicy::Closed`]: a failed or timed-out increment
//! rejects the request with a 500 rather than admitting unmetered traffic.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderName, Request, Response, StatusCode};
use axum::response::IntoResponse;
use chrono::Utc;
use tower::{Layer, Service};
use tracing::{error, warn};

use super::FailurePolicy;
use super::ip::client_ip;
use super::recorder::peek_request_body;
use crate::audit::{ViolationAuditLog, ViolationLogEntry};
use crate::error::AppError;
use crate::metrics::{self, decision};
use crate::store::{CallBudget, SharedStore, StoreResult};

/// Maps a request to the identity its quota is counted against.
pub type KeyFn = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

/// Error type for rate limit layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// Limit must admit at least one request per window.
    ZeroLimit,
    /// Window must be non-zero.
    ZeroWindow,
    /// Window must be at least one second (`Retry-After` has whole-second resolution).
    SubSecondWindow,
    /// No key function was configured.
    MissingKeyFn,
    /// Action tag must be non-empty.
    EmptyActionTag,
    /// Store timeout must be non-zero.
    ZeroStoreTimeout,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::ZeroLimit => write!(f, "limit must be greater than 0"),
            RateLimitError::ZeroWindow => write!(f, "window must be greater than 0"),
            RateLimitError::SubSecondWindow => {
                write!(f, "window must be at least one second")
            }
            RateLimitError::MissingKeyFn => {
                write!(f, "a key function is required; use client_ip_key() for per-IP limits")
            }
            RateLimitError::EmptyActionTag => write!(f, "action tag must not be empty"),
            RateLimitError::ZeroStoreTimeout => write!(f, "store timeout must be greater than 0"),
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Store key of the counter for `identity` under `action`.
pub fn counter_key(action: &str, identity: &str) -> String {
    format!("ratelimit:{action}:{identity}")
}

/// Store key of the violation log for `identity` under `action`.
pub fn audit_key(action: &str, identity: &str) -> String {
    format!("ratelimitlog:{action}:{identity}")
}

/// Key requests by caller IP (see [`client_ip`]).
pub fn client_ip_key() -> KeyFn {
    Arc::new(|req| client_ip(req).into_owned())
}

/// Key requests by a header value, falling back to the caller IP when the
/// header is missing, empty, or not valid UTF-8.
pub fn header_key(name: HeaderName) -> KeyFn {
    Arc::new(move |req| {
        req.headers()
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map_or_else(|| client_ip(req).into_owned(), str::to_string)
    })
}

/// Builder for [`KeyedRateLimitLayer`]. Configuration is validated by
/// [`build`](Self::build), never per request.
#[derive(Clone)]
pub struct RateLimitBuilder {
    action: String,
    limit: u64,
    window: Duration,
    key_fn: Option<KeyFn>,
    failure_policy: FailurePolicy,
    store_timeout: Duration,
    audit_body_limit: usize,
}

impl RateLimitBuilder {
    /// Requests admitted per window.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = Some(key_fn);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Request body bytes kept in a violation entry.
    pub fn audit_body_limit(mut self, bytes: usize) -> Self {
        self.audit_body_limit = bytes;
        self
    }

    /// # Errors
    ///
    /// Returns a [`RateLimitError`] describing the first invalid setting.
    pub fn build(self, store: Arc<dyn SharedStore>) -> Result<KeyedRateLimitLayer, RateLimitError> {
        if self.action.trim().is_empty() {
            return Err(RateLimitError::EmptyActionTag);
        }
        if self.limit == 0 {
            return Err(RateLimitError::ZeroLimit);
        }
        if self.window.is_zero() {
            return Err(RateLimitError::ZeroWindow);
        }
        if self.window < Duration::from_secs(1) {
            return Err(RateLimitError::SubSecondWindow);
        }
        if self.store_timeout.is_zero() {
            return Err(RateLimitError::ZeroStoreTimeout);
        }
        let key_fn = self.key_fn.ok_or(RateLimitError::MissingKeyFn)?;

        Ok(KeyedRateLimitLayer {
            limiter: Arc::new(Limiter {
                audit: ViolationAuditLog::new(store.clone()),
                store,
                action: self.action,
                limit: self.limit,
                window: self.window,
                key_fn,
                failure_policy: self.failure_policy,
                store_timeout: self.store_timeout,
                audit_body_limit: self.audit_body_limit,
            }),
        })
    }
}

struct Limiter {
    store: Arc<dyn SharedStore>,
    audit: ViolationAuditLog,
    action: String,
    limit: u64,
    window: Duration,
    key_fn: KeyFn,
    failure_policy: FailurePolicy,
    store_timeout: Duration,
    audit_body_limit: usize,
}

/// Rate limiting layer for Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let limiter = KeyedRateLimitLayer::builder("topup")
///     .limit(5)
///     .window(Duration::from_secs(60))
///     .key_fn(client_ip_key())
///     .build(store.clone())?;
/// let app = Router::new()
///     .route("/topups", post(create_topup))
///     .layer(limiter);
/// ```
#[derive(Clone)]
pub struct KeyedRateLimitLayer {
    limiter: Arc<Limiter>,
}

impl KeyedRateLimitLayer {
    /// Start configuring a limiter for `action`, the key namespace.
    pub fn builder(action: impl Into<String>) -> RateLimitBuilder {
        RateLimitBuilder {
            action: action.into(),
            limit: 0,
            window: Duration::ZERO,
            key_fn: None,
            failure_policy: FailurePolicy::Closed,
            store_timeout: Duration::from_millis(500),
            audit_body_limit: 1024,
        }
    }
}

impl<S> Layer<S> for KeyedRateLimitLayer {
    type Service = KeyedRateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        KeyedRateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct KeyedRateLimitService<S> {
    inner: S,
    limiter: Arc<Limiter>,
}

impl<S> Service<Request<Body>> for KeyedRateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        let identity = (limiter.key_fn)(&req);
        let budget = CallBudget::for_request(&req, limiter.store_timeout);

        Box::pin(async move {
            match limiter.hit(&identity, &budget).await {
                Ok(count) if count <= limiter.limit => {
                    metrics::record_rate_limit_decision(&limiter.action, decision::ALLOWED);
                    inner.call(req).await
                }
                Ok(count) => Ok(limiter.deny(req, &identity, count, &budget).await),
                Err(e) => match limiter.failure_policy {
                    FailurePolicy::Closed => {
                        error!(
                            action = %limiter.action,
                            identity = %identity,
                            error = %e,
                            "Rate limit store failed, rejecting request"
                        );
                        metrics::record_rate_limit_decision(&limiter.action, decision::FAIL_CLOSED);
                        Ok(AppError::Internal(format!("rate limit store failed: {e}")).into_response())
                    }
                    FailurePolicy::Open => {
                        warn!(
                            action = %limiter.action,
                            identity = %identity,
                            error = %e,
                            "Rate limit store failed, admitting unmetered"
                        );
                        metrics::record_rate_limit_decision(&limiter.action, decision::FAIL_OPEN);
                        inner.call(req).await
                    }
                },
            }
        })
    }
}

impl Limiter {
    /// Count one request and return the post-increment count.
    ///
    /// Increment and expiry are a single store call, so a counter never
    /// outlives a failed request without a TTL.
    async fn hit(&self, identity: &str, budget: &CallBudget) -> StoreResult<u64> {
        let key = counter_key(&self.action, identity);
        let count = budget
            .run(
                "incr_window",
                self.store.increment_in_window(&key, self.window),
            )
            .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn deny(
        &self,
        req: Request<Body>,
        identity: &str,
        count: u64,
        budget: &CallBudget,
    ) -> Response<Body> {
        let ip = client_ip(&req).into_owned();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let retry_after = self.retry_after_secs();

        warn!(
            action = %self.action,
            identity,
            client_ip = %ip,
            path = %path,
            count,
            limit = self.limit,
            retry_after_secs = retry_after,
            "Rate limit exceeded"
        );

        let (_req, peek) =
            peek_request_body(req, self.audit_body_limit, budget.remaining()).await;
        let entry = ViolationLogEntry {
            timestamp: Utc::now(),
            method,
            path,
            ip,
            body: String::from_utf8_lossy(&peek.bytes).into_owned(),
            body_truncated: peek.truncated,
        };

        let log_key = audit_key(&self.action, identity);
        match self.audit.append(&log_key, &entry, budget).await {
            Ok(()) => metrics::record_audit_append(&self.action, true),
            Err(e) => {
                warn!(key = %log_key, error = %e, "Failed to append violation audit entry");
                metrics::record_audit_append(&self.action, false);
            }
        }
        metrics::record_rate_limit_decision(&self.action, decision::DENIED);

        (
            StatusCode::TOO_MANY_REQUESTS,
            [
                ("Retry-After", retry_after.to_string()),
                ("X-RateLimit-Limit", self.limit.to_string()),
                ("X-RateLimit-Remaining", "0".to_string()),
            ],
            "Too many requests",
        )
            .into_response()
    }

    /// Window length in whole seconds, rounded up.
    fn retry_after_secs(&self) -> u64 {
        self.window.as_secs() + u64::from(self.window.subsec_nanos() > 0)
    }
}
