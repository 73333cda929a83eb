//! Idempotency gate: response replay for repeated `Idempotency-Key` requests.
//!
//! # Protocol
//!
//! ```text
//!              ┌──────────── get(fingerprint) ─────────────┐
//!              ▼                     ▼                      ▼
//!          Complete               Pending                 absent
//!        replay (HIT)      poll until wait expires   set_if_absent(Pending{token})
//!                          then 409 + Retry-After      ├─ won:  run handler once
//!                                                      │        commit record (MISS)
//!                                                      └─ lost: look again
//! ```
//!
//! The reservation is an atomic create-if-absent placeholder owned by a random
//! token. It expires after `reservation_ttl`, so a crashed holder never blocks
//! a key for longer than that. A holder that ends without a cacheable response
//! deletes its placeholder (only while it still owns it) so a waiting duplicate
//! can take over immediately.
//!
//! # Not Cached
//!
//! - Responses with a 5xx status
//! - Responses larger than `max_cacheable_bytes` (still delivered in full)
//! - Responses whose body fails mid-read (the caller gets a 500)
//!
//! `X-Idempotent-Cache: MISS` is only set once the record is actually stored.
//!
//! # Store Failures
//!
//! With [`FailurePolicy::Open`] (default) a failed lookup or reservation runs
//! the handler without any caching. With [`FailurePolicy::Closed`] it is
//! rejected with a 500. A failed commit never discards the handler's response.
//! A duplicate that has already seen another request's placeholder answers
//! 409 on any later store failure, whatever the policy.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderValue, Request, Response};
use axum::response::IntoResponse;
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::FailurePolicy;
use super::recorder::{Recorded, ResponseRecorder};
use crate::error::AppError;
use crate::fingerprint::Fingerprint;
use crate::metrics::{self, outcome};
use crate::record::{IdempotencyRecord, StoredEntry};
use crate::store::{CallBudget, SharedStore, StoreError, StoreResult};

/// Response header marking replayed (`HIT`) and freshly stored (`MISS`) responses.
pub const IDEMPOTENT_CACHE_HEADER: &str = "x-idempotent-cache";

/// Idempotency gate settings.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Lifetime of a completed record.
    pub record_ttl: Duration,
    /// Lifetime of a reservation placeholder.
    pub reservation_ttl: Duration,
    /// How long a duplicate waits for an in-flight request before a 409.
    pub in_flight_wait: Duration,
    /// Pause between lookups while waiting.
    pub poll_interval: Duration,
    /// Largest response body that is stored.
    pub max_cacheable_bytes: usize,
    /// Upper bound for each store call.
    pub store_timeout: Duration,
    /// Behaviour when the store fails before the handler has run.
    pub failure_policy: FailurePolicy,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(24 * 60 * 60),
            reservation_ttl: Duration::from_secs(30),
            in_flight_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            max_cacheable_bytes: 1024 * 1024,
            store_timeout: Duration::from_millis(500),
            failure_policy: FailurePolicy::Open,
        }
    }
}

/// Rejected gate settings.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyConfigError {
    #[error("record TTL must be greater than zero")]
    ZeroRecordTtl,

    #[error("reservation TTL must be greater than zero")]
    ZeroReservationTtl,

    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("store timeout must be greater than zero")]
    ZeroStoreTimeout,
}

impl IdempotencyConfig {
    pub fn validate(&self) -> Result<(), IdempotencyConfigError> {
        if self.record_ttl.is_zero() {
            return Err(IdempotencyConfigError::ZeroRecordTtl);
        }
        if self.reservation_ttl.is_zero() {
            return Err(IdempotencyConfigError::ZeroReservationTtl);
        }
        if self.poll_interval.is_zero() {
            return Err(IdempotencyConfigError::ZeroPollInterval);
        }
        if self.store_timeout.is_zero() {
            return Err(IdempotencyConfigError::ZeroStoreTimeout);
        }
        Ok(())
    }
}

struct Gate {
    store: Arc<dyn SharedStore>,
    config: IdempotencyConfig,
    recorder: ResponseRecorder,
}

enum Resolution {
    Replay(IdempotencyRecord),
    Acquired(ReservationGuard),
    InFlight,
}

/// Tower layer installing the idempotency gate.
///
/// # Example
///
/// ```rust,ignore
/// let gate = IdempotencyLayer::new(store.clone(), IdempotencyConfig::default())?;
/// let app = Router::new()
///     .route("/payments", post(create_payment))
///     .layer(gate);
/// ```
#[derive(Clone)]
pub struct IdempotencyLayer {
    gate: Arc<Gate>,
}

impl IdempotencyLayer {
    /// # Errors
    ///
    /// Returns an error if any duration in `config` is zero.
    pub fn new(
        store: Arc<dyn SharedStore>,
        config: IdempotencyConfig,
    ) -> Result<Self, IdempotencyConfigError> {
        config.validate()?;
        Ok(Self {
            gate: Arc::new(Gate {
                store,
                recorder: ResponseRecorder::new(config.max_cacheable_bytes),
                config,
            }),
        })
    }
}

impl<S> Layer<S> for IdempotencyLayer {
    type Service = IdempotencyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IdempotencyService {
            inner,
            gate: self.gate.clone(),
        }
    }
}

/// Idempotency gate service wrapper.
#[derive(Clone)]
pub struct IdempotencyService<S> {
    inner: S,
    gate: Arc<Gate>,
}

impl<S> Service<Request<Body>> for IdempotencyService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send,
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
        let gate = self.gate.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // No key (or an empty one): behave as if the gate were absent
            let Some(fingerprint) = Fingerprint::from_headers(req.headers()) else {
                return inner.call(req).await;
            };

            let budget = CallBudget::for_request(&req, gate.config.store_timeout);
            let key = fingerprint.store_key();

            match gate.resolve(&key, &budget).await {
                Ok(Resolution::Replay(record)) => {
                    info!(fingerprint = %fingerprint, status = record.status.as_u16(), "Replaying stored response");
                    metrics::record_idempotency_outcome(outcome::HIT);
                    let mut response = record.into_response();
                    response
                        .headers_mut()
                        .insert(IDEMPOTENT_CACHE_HEADER, HeaderValue::from_static("HIT"));
                    Ok(response)
                }
                Ok(Resolution::InFlight) => {
                    warn!(fingerprint = %fingerprint, "Duplicate request still in flight, giving up");
                    metrics::record_idempotency_outcome(outcome::CONFLICT);
                    let mut response = AppError::Conflict(fingerprint.to_string()).into_response();
                    response
                        .headers_mut()
                        .insert(RETRY_AFTER, HeaderValue::from_static("1"));
                    Ok(response)
                }
                Ok(Resolution::Acquired(guard)) => {
                    debug!(fingerprint = %fingerprint, "Reservation acquired");
                    gate.execute(inner, req, &key, guard, &budget).await
                }
                Err(e) => {
                    metrics::record_idempotency_outcome(outcome::STORE_ERROR);
                    match gate.config.failure_policy {
                        FailurePolicy::Open => {
                            warn!(fingerprint = %fingerprint, error = %e, "Idempotency store failed, serving without caching");
                            inner.call(req).await
                        }
                        FailurePolicy::Closed => Ok(AppError::Internal(format!(
                            "idempotency store failed: {e}"
                        ))
                        .into_response()),
                    }
                }
            }
        })
    }
}

impl Gate {
    /// Replay, reserve, or give up waiting on an in-flight duplicate.
    ///
    /// Once another request is known to hold the key, a store error or timeout
    /// resolves to `InFlight`: the failure policy must not run the handler
    /// beside a live reservation.
    async fn resolve(&self, key: &str, budget: &CallBudget) -> StoreResult<Resolution> {
        let started = Instant::now();
        let wait_until = match budget.deadline() {
            Some(deadline) => deadline.min(started + self.config.in_flight_wait),
            None => started + self.config.in_flight_wait,
        };
        let mut contended = false;

        loop {
            if contended && Instant::now() >= wait_until {
                metrics::record_idempotency_wait(started.elapsed().as_secs_f64());
                return Ok(Resolution::InFlight);
            }

            let entry = match self.lookup(key, budget).await {
                Ok(entry) => entry,
                Err(e) if contended => {
                    warn!(key, error = %e, "Lookup failed while waiting on in-flight duplicate");
                    metrics::record_idempotency_wait(started.elapsed().as_secs_f64());
                    return Ok(Resolution::InFlight);
                }
                Err(e) => return Err(e),
            };

            match entry {
                Some(StoredEntry::Complete(record)) => {
                    if contended {
                        metrics::record_idempotency_wait(started.elapsed().as_secs_f64());
                    }
                    return Ok(Resolution::Replay(record));
                }
                Some(StoredEntry::Pending(_)) => {
                    contended = true;
                    let now = Instant::now();
                    if now < wait_until {
                        tokio::time::sleep(self.poll_delay().min(wait_until - now)).await;
                    }
                }
                None => {
                    let token = Uuid::new_v4();
                    let placeholder = StoredEntry::Pending(token).encode();
                    let acquired = budget
                        .run(
                            "set_if_absent",
                            self.store
                                .set_if_absent(key, &placeholder, self.config.reservation_ttl),
                        )
                        .await;
                    let acquired = match acquired {
                        Ok(acquired) => acquired,
                        Err(e) if contended => {
                            warn!(key, error = %e, "Reservation failed after waiting on in-flight duplicate");
                            return Ok(Resolution::InFlight);
                        }
                        Err(e) => return Err(e),
                    };
                    if acquired {
                        return Ok(Resolution::Acquired(ReservationGuard {
                            store: self.store.clone(),
                            key: key.to_string(),
                            placeholder,
                            timeout: self.config.store_timeout,
                            armed: true,
                        }));
                    }
                    // Another request reserved it first
                    contended = true;
                }
            }
        }
    }

    async fn lookup(&self, key: &str, budget: &CallBudget) -> StoreResult<Option<StoredEntry>> {
        let Some(raw) = budget.run("get", self.store.get(key)).await? else {
            return Ok(None);
        };
        StoredEntry::decode(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    /// Poll interval with up to ±20% jitter so waiters do not poll in lockstep.
    fn poll_delay(&self) -> Duration {
        let base = self.config.poll_interval;
        let spread = base / 5;
        if spread.is_zero() {
            return base;
        }
        let offset = rand::rng().random_range(Duration::ZERO..=spread * 2);
        base - spread + offset
    }

    /// Run the handler once under a reservation and commit its response.
    async fn execute<S>(
        &self,
        mut inner: S,
        req: Request<Body>,
        key: &str,
        guard: ReservationGuard,
        budget: &CallBudget,
    ) -> Result<Response<Body>, S::Error>
    where
        S: Service<Request<Body>, Response = Response<Body>>,
    {
        let response = match inner.call(req).await {
            Ok(response) => response,
            Err(e) => {
                guard.release(budget).await;
                return Err(e);
            }
        };

        if response.status().is_server_error() {
            debug!(key, status = response.status().as_u16(), "Not caching server error");
            metrics::record_idempotency_outcome(outcome::NOT_CACHED);
            guard.release(budget).await;
            return Ok(response);
        }

        let (parts, body) = match self.recorder.record(response).await {
            Recorded::Complete { parts, body } => (parts, body),
            Recorded::Oversized(response) => {
                info!(
                    key,
                    limit = self.recorder.max_bytes(),
                    "Response too large to cache, delivering uncached"
                );
                metrics::record_idempotency_outcome(outcome::NOT_CACHED);
                guard.release(budget).await;
                return Ok(response);
            }
            Recorded::Failed(e) => {
                metrics::record_idempotency_outcome(outcome::NOT_CACHED);
                guard.release(budget).await;
                return Ok(AppError::Internal(format!("response body failed: {e}")).into_response());
            }
        };

        let record = StoredEntry::Complete(IdempotencyRecord {
            status: parts.status,
            content_type: parts.headers.get(CONTENT_TYPE).cloned(),
            body: body.clone(),
        });
        let mut response = Response::from_parts(parts, Body::from(body));

        let committed = budget
            .run(
                "set_with_ttl",
                self.store
                    .set_with_ttl(key, &record.encode(), self.config.record_ttl),
            )
            .await;

        match committed {
            Ok(()) => {
                guard.disarm();
                metrics::record_idempotency_outcome(outcome::MISS);
                response
                    .headers_mut()
                    .insert(IDEMPOTENT_CACHE_HEADER, HeaderValue::from_static("MISS"));
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to store idempotency record, delivering uncached");
                metrics::record_idempotency_outcome(outcome::NOT_CACHED);
                guard.release(budget).await;
            }
        }

        Ok(response)
    }
}

/// Ownership of a reservation placeholder.
///
/// Dropped while armed (the request future was cancelled mid-handler), it
/// releases the placeholder from a spawned task bounded by the store timeout.
struct ReservationGuard {
    store: Arc<dyn SharedStore>,
    key: String,
    placeholder: Vec<u8>,
    timeout: Duration,
    armed: bool,
}

impl ReservationGuard {
    /// Delete the placeholder if this request still owns it.
    async fn release(mut self, budget: &CallBudget) {
        self.armed = false;
        let released = budget
            .run(
                "delete_if_equal",
                self.store.delete_if_equal(&self.key, &self.placeholder),
            )
            .await;

        match released {
            Ok(true) => debug!(key = %self.key, "Reservation released"),
            Ok(false) => debug!(key = %self.key, "Reservation already gone"),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to release reservation, it will expire")
            }
        }
    }

    /// The placeholder was overwritten by the committed record.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let placeholder = std::mem::take(&mut self.placeholder);
        let timeout = self.timeout;

        handle.spawn(async move {
            match tokio::time::timeout(timeout, store.delete_if_equal(&key, &placeholder)).await {
                Ok(Ok(_)) => debug!(key, "Reservation released after cancellation"),
                Ok(Err(e)) => warn!(key, error = %e, "Failed to release abandoned reservation"),
                Err(_) => warn!(key, "Timed out releasing abandoned reservation"),
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn test_config_validation() {
        assert!(IdempotencyConfig::default().validate().is_ok());

        let config = IdempotencyConfig {
            reservation_ttl: Duration::ZERO,
            ..IdempotencyConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(IdempotencyConfigError::ZeroReservationTtl)
        );

        let config = IdempotencyConfig {
            poll_interval: Duration::ZERO,
            ..IdempotencyConfig::default()
        };
        assert!(IdempotencyLayer::new(Arc::new(InMemoryStore::new()), config).is_err());
    }

    #[test]
    fn test_poll_delay_within_jitter() {
        let gate = Gate {
            store: Arc::new(InMemoryStore::new()),
            config: IdempotencyConfig::default(),
            recorder: ResponseRecorder::new(16),
        };

        for _ in 0..100 {
            let delay = gate.poll_delay();
            assert!(delay >= Duration::from_millis(40), "{delay:?}");
            assert!(delay <= Duration::from_millis(60), "{delay:?}");
        }
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_reservation() {
        let store = InMemoryStore::new();
        let placeholder = StoredEntry::Pending(Uuid::new_v4()).encode();
        store
            .set_if_absent("idempotency:x", &placeholder, Duration::from_secs(30))
            .await
            .unwrap();

        drop(ReservationGuard {
            store: Arc::new(store.clone()),
            key: "idempotency:x".to_string(),
            placeholder,
            timeout: Duration::from_secs(1),
            armed: true,
        });

        for _ in 0..50 {
            if !store.contains_key("idempotency:x") {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("reservation was not released");
    }

    #[tokio::test]
    async fn test_release_keeps_foreign_placeholder() {
        let store = InMemoryStore::new();
        let theirs = StoredEntry::Pending(Uuid::new_v4()).encode();
        store
            .set_with_ttl("idempotency:y", &theirs, Duration::from_secs(30))
            .await
            .unwrap();

        let guard = ReservationGuard {
            store: Arc::new(store.clone()),
            key: "idempotency:y".to_string(),
            placeholder: StoredEntry::Pending(Uuid::new_v4()).encode(),
            timeout: Duration::from_secs(1),
            armed: true,
        };
        guard.release(&CallBudget::new(Duration::from_secs(1))).await;

        assert_eq!(store.get("idempotency:y").await.unwrap(), Some(theirs));
    }
}
