//! Bounded body capture.
//!
//! [`ResponseRecorder`] buffers a downstream response so it can be stored and
//! replayed, up to a byte cap. Past the cap it stops accumulating and hands back
//! a response that streams the already-read prefix followed by the unread
//! remainder, so large responses are still delivered intact.
//!
//! [`peek_request_body`] does the same for request bodies read for audit
//! purposes: at most `limit` bytes are inspected, reading stops after a time
//! allowance, and every consumed byte is put back in front of the rest of the
//! stream.

use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::http::{Request, Response, response};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream;
use http_body_util::BodyExt;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

/// Outcome of recording a response.
pub enum Recorded {
    /// The whole body fit under the cap.
    Complete { parts: response::Parts, body: Bytes },
    /// The body exceeded the cap. The response is intact but was not captured.
    Oversized(Response<Body>),
    /// The body stream failed mid-read.
    Failed(axum::Error),
}

/// Captures a response's status, headers and body up to `max_bytes`.
#[derive(Debug, Clone, Copy)]
pub struct ResponseRecorder {
    max_bytes: usize,
}

impl ResponseRecorder {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub async fn record(&self, response: Response<Body>) -> Recorded {
        let (parts, mut body) = response.into_parts();
        let mut captured = BytesMut::new();

        while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => return Recorded::Failed(e),
            };
            // Trailers are not replayed.
            let Ok(data) = frame.into_data() else {
                continue;
            };

            if captured.len() + data.len() > self.max_bytes {
                debug!(
                    limit = self.max_bytes,
                    read = captured.len() + data.len(),
                    "Response exceeds capture limit, streaming through"
                );
                let head = stream::iter([Ok::<_, axum::Error>(captured.freeze()), Ok(data)]);
                let body = Body::from_stream(head.chain(body.into_data_stream()));
                return Recorded::Oversized(Response::from_parts(parts, body));
            }

            captured.extend_from_slice(&data);
        }

        Recorded::Complete {
            parts,
            body: captured.freeze(),
        }
    }
}

/// The first bytes of a request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyPeek {
    pub bytes: Bytes,
    pub truncated: bool,
}

/// Read up to `limit` bytes of the request body without consuming it.
///
/// The returned request carries a body that yields every byte of the original.
/// `truncated` is set when more data follows the inspected prefix, the body
/// failed before it ended, or it did not deliver `limit` bytes (or its end)
/// within `within`.
pub async fn peek_request_body(
    req: Request<Body>,
    limit: usize,
    within: Duration,
) -> (Request<Body>, BodyPeek) {
    let (parts, mut body) = req.into_parts();
    let mut consumed = BytesMut::new();
    let mut cut_short = false;
    let deadline = Instant::now() + within;

    while consumed.len() < limit {
        match timeout_at(deadline, body.frame()).await {
            Ok(Some(Ok(frame))) => {
                if let Ok(data) = frame.into_data() {
                    consumed.extend_from_slice(&data);
                }
            }
            Ok(Some(Err(e))) => {
                debug!(error = %e, "Request body failed during peek");
                cut_short = true;
                break;
            }
            Ok(None) => break,
            Err(_) => {
                debug!(read = consumed.len(), "Request body too slow, peek cut short");
                cut_short = true;
                break;
            }
        }
    }

    let consumed = consumed.freeze();
    let truncated = cut_short
        || consumed.len() > limit
        || (consumed.len() == limit && !HttpBody::is_end_stream(&body));
    let peek = BodyPeek {
        bytes: consumed.slice(..consumed.len().min(limit)),
        truncated,
    };

    let restored = stream::iter([Ok::<_, axum::Error>(consumed)]).chain(body.into_data_stream());
    (Request::from_parts(parts, Body::from_stream(restored)), peek)
}
