//! Admission middleware backed by the shared store.
//!
//! - **Idempotency gate**: replays the stored response for a repeated
//!   `Idempotency-Key` and runs the handler at most once per key
//! - **Keyed rate limiter**: fixed-window quota per composite key, with a
//!   bounded violation audit log
//! - **Request timeout**: client deadline that bounds every store call
//! - **Client IP**: caller identity for limiter keys and audit entries
//!
//! # Architecture
//!
//! ```text
//! Request → Timeout → Request ID → Trace → Idempotency Gate → Rate Limiter → Handler
//!                                              ↓      ↓             ↓
//!                                            HIT     409           429 / 500
//! ```
//!
//! The gate sits outside the limiter, so a replayed response never consumes
//! quota.
//!
//! # Store Failures
//!
//! Each component carries its own [`FailurePolicy`]. The gate defaults to
//! [`FailurePolicy::Open`] (serve without caching), the limiter to
//! [`FailurePolicy::Closed`] (reject with a server error).

pub mod idempotency;
pub mod ip;
pub mod rate_limit;
pub mod recorder;
pub mod timeout;

use std::fmt;
use std::str::FromStr;

pub use idempotency::{
    IDEMPOTENT_CACHE_HEADER, IdempotencyConfig, IdempotencyConfigError, IdempotencyLayer,
    IdempotencyService,
};
pub use ip::{FORWARDED_FOR_HEADER, UNKNOWN_IP, client_ip};
pub use rate_limit::{
    KeyFn, KeyedRateLimitLayer, KeyedRateLimitService, RateLimitBuilder, RateLimitError,
};
pub use recorder::{BodyPeek, Recorded, ResponseRecorder, peek_request_body};
pub use timeout::{
    MAX_REQUEST_TIMEOUT_MS, MIN_REQUEST_TIMEOUT_MS, REQUEST_TIMEOUT_HEADER, RequestTimeout,
    extract_request_timeout,
};

/// What a component does when the shared store cannot be reached or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Admit the request without the component's guarantee.
    Open,
    /// Reject the request with a server error.
    Closed,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Open => f.write_str("open"),
            FailurePolicy::Closed => f.write_str("closed"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(FailurePolicy::Open),
            "closed" => Ok(FailurePolicy::Closed),
            other => Err(format!("expected \"open\" or \"closed\", got \"{other}\"")),
        }
    }
}
