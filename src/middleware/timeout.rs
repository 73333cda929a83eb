//! Client deadline propagation.
//!
//! Clients may state how long they are willing to wait via the
//! `X-Request-Timeout` header:
//!
//! ```text
//! X-Request-Timeout: 5000  # 5 seconds in milliseconds
//! ```
//!
//! A valid value is turned into a deadline anchored at the moment the request
//! was received and stored in the request extensions. The idempotency gate and
//! the rate limiter read it through [`CallBudget`](crate::store::CallBudget) so
//! no store round-trip outlives the caller's patience, and the gate never waits
//! on an in-flight duplicate past it.
//!
//! # Bounds
//!
//! - Values outside `MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS` are ignored
//! - Non-numeric values are ignored (the server-side store timeout applies)

use std::time::Duration;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tokio::time::Instant;
use tracing::debug;

/// Minimum accepted request timeout (100ms).
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 100;

/// Maximum accepted request timeout (5 minutes).
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;

/// Header name for the client-specified request timeout.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// Client deadline stored in request extensions.
#[derive(Debug, Clone, Copy)]
pub struct RequestTimeout {
    /// The timeout duration specified by the client.
    pub duration: Duration,
    /// When the request was received.
    pub received_at: Instant,
}

impl RequestTimeout {
    /// Create a timeout starting now.
    ///
    /// Returns `None` if the value is outside the allowed range.
    pub fn from_millis(ms: u64) -> Option<Self> {
        if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&ms) {
            return None;
        }
        Some(Self {
            duration: Duration::from_millis(ms),
            received_at: Instant::now(),
        })
    }

    /// Instant after which the client no longer waits for a response.
    pub fn deadline(&self) -> Instant {
        self.received_at + self.duration
    }
}

/// Middleware that parses `X-Request-Timeout` into a [`RequestTimeout`] extension.
pub async fn extract_request_timeout(mut request: Request, next: Next) -> Response {
    if let Some(timeout) = parse_timeout_header(&request) {
        request.extensions_mut().insert(timeout);
    }

    next.run(request).await
}

fn parse_timeout_header<B>(request: &axum::http::Request<B>) -> Option<RequestTimeout> {
    let value = request.headers().get(REQUEST_TIMEOUT_HEADER)?.to_str().ok()?;

    let Ok(ms) = value.trim().parse::<u64>() else {
        debug!(value, "Invalid X-Request-Timeout header value, ignoring");
        return None;
    };

    let timeout = RequestTimeout::from_millis(ms);
    if timeout.is_none() {
        debug!(
            timeout_ms = ms,
            min = MIN_REQUEST_TIMEOUT_MS,
            max = MAX_REQUEST_TIMEOUT_MS,
            "Client timeout outside allowed range, ignoring"
        );
    }
    timeout
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(value: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .header(REQUEST_TIMEOUT_HEADER, value)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_request_timeout_bounds() {
        assert!(RequestTimeout::from_millis(MIN_REQUEST_TIMEOUT_MS).is_some());
        assert!(RequestTimeout::from_millis(MAX_REQUEST_TIMEOUT_MS).is_some());
        assert!(RequestTimeout::from_millis(MIN_REQUEST_TIMEOUT_MS - 1).is_none());
        assert!(RequestTimeout::from_millis(MAX_REQUEST_TIMEOUT_MS + 1).is_none());
        assert!(RequestTimeout::from_millis(0).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_anchored_at_receipt() {
        let timeout = RequestTimeout::from_millis(5000).unwrap();
        assert_eq!(timeout.deadline() - timeout.received_at, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_valid_header() {
        let parsed = parse_timeout_header(&request_with(" 2500 ")).unwrap();
        assert_eq!(parsed.duration, Duration::from_millis(2500));
    }

    #[test]
    fn test_parse_rejects_garbage_and_out_of_range() {
        assert!(parse_timeout_header(&request_with("soon")).is_none());
        assert!(parse_timeout_header(&request_with("-5")).is_none());
        assert!(parse_timeout_header(&request_with("10")).is_none());
    }

    #[test]
    fn test_parse_missing_header() {
        let req = axum::http::Request::builder().body(Body::empty()).unwrap();
        assert!(parse_timeout_header(&req).is_none());
    }
}
