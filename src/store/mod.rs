//! Shared key-value store consumed by the admission middleware.
//!
//! Both the idempotency gate and the keyed rate limiter coordinate across
//! processes exclusively through the atomic primitives of [`SharedStore`].
//! No component keeps an authoritative copy of any record in process memory.
//!
//! # Implementations
//!
//! - [`RedisStore`] - production store over a Redis `ConnectionManager`
//! - [`InMemoryStore`] - single-process store with Redis-equivalent semantics,
//!   failure injection and TTL inspection for tests
//!
//! # Bounded Calls
//!
//! Every store round-trip made on behalf of a request goes through
//! [`CallBudget::run`], which bounds the call by the configured store timeout
//! and by whatever remains of the request's own deadline. A timeout is reported
//! as [`StoreError::Timeout`] and is handled exactly like an unreachable store.
//!
//! ```text
//!   request deadline ──┐
//!                      ├─► min(...) ─► tokio::time::timeout(store call)
//!   store timeout ─────┘
//! ```

mod memory;
mod redis_store;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::Request;
use thiserror::Error;
use tokio::time::Instant;

use crate::metrics;
use crate::middleware::timeout::RequestTimeout;

pub use self::memory::InMemoryStore;
pub use self::redis_store::{RedisConfig, RedisStore};

/// Errors surfaced by store operations.
///
/// Components never propagate these to the transport layer; each one maps them
/// onto its configured [`FailurePolicy`](crate::middleware::FailurePolicy).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "unavailable",
            StoreError::Timeout(_) => "timeout",
            StoreError::Corrupt { .. } => "corrupt",
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Atomic key-value primitives shared by every request-handling process.
///
/// Semantics follow Redis: TTLs are per key, `increment` creates a missing key
/// at 0 before incrementing, list indices may be negative (counting from the
/// tail), and an expired key behaves exactly like an absent one.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Fetch a value, `None` on miss.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Unconditionally store `value` with a TTL, replacing any previous value.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Store `value` only if `key` is absent. Returns `true` if it was stored.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// Delete `key` only if it currently holds exactly `expected`.
    async fn delete_if_equal(&self, key: &str, expected: &[u8]) -> StoreResult<bool>;

    /// Atomically increment an integer counter and return the new value.
    async fn increment(&self, key: &str) -> StoreResult<i64>;

    /// Set the TTL of an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Atomically increment a fixed-window counter and return the new value.
    ///
    /// The TTL is set to `window` when the counter has none (it was just
    /// created, or an earlier expiry was lost). An existing TTL is never
    /// touched, so the window stays anchored at its first request.
    async fn increment_in_window(&self, key: &str, window: Duration) -> StoreResult<i64>;

    /// Prepend a value to a list, creating the list if needed.
    async fn list_push_front(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Keep only the elements in `start..=stop` of a list.
    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()>;

    /// Read the elements in `start..=stop` of a list.
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Vec<u8>>>;

    /// Round-trip check used by health probes.
    async fn ping(&self) -> StoreResult<()>;
}

/// Time allowance for the store calls made while handling one request.
#[derive(Debug, Clone, Copy)]
pub struct CallBudget {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl CallBudget {
    /// Budget bounded only by the store timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    /// Budget for a request, honouring a client deadline when one is attached.
    pub fn for_request<B>(req: &Request<B>, timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: req
                .extensions()
                .get::<RequestTimeout>()
                .map(RequestTimeout::deadline),
        }
    }

    /// The request deadline, if the client attached one.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time allowed for the next store call.
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => self
                .timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.timeout,
        }
    }

    /// Run one store call within the budget.
    ///
    /// The call is dropped (and with it any in-flight round-trip) once the
    /// budget runs out.
    pub async fn run<T, F>(&self, operation: &'static str, call: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let allowed = self.remaining();
        let started = std::time::Instant::now();

        let result = match tokio::time::timeout(allowed, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(allowed)),
        };

        metrics::record_store_duration(operation, started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            metrics::record_store_error(operation, e.kind());
        }

        result
    }
}
