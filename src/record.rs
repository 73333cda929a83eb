//! Stored representation of idempotency records.
//!
//! A fingerprint's store value is either a reservation placeholder written
//! before the protected handler runs, or the completed response written after.
//!
//! # Wire Format
//!
//! ```text
//! Pending:   'P' | token (16 bytes, UUID)
//! Complete:  'C' | status (u16 BE) | ct_len (u16 BE) | content-type | body
//! ```
//!
//! The body is stored and replayed byte-for-byte. Decoding validates every
//! length and never panics on arbitrary input.

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Response, StatusCode};
use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

const TAG_PENDING: u8 = b'P';
const TAG_COMPLETE: u8 = b'C';

/// Errors decoding a stored value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("empty value")]
    Empty,

    #[error("unknown record tag {0:#04x}")]
    UnknownTag(u8),

    #[error("value truncated")]
    Truncated,

    #[error("invalid status code {0}")]
    InvalidStatus(u16),

    #[error("invalid content type")]
    InvalidContentType,
}

/// A captured response, replayed verbatim for the lifetime of the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

impl IdempotencyRecord {
    /// Rebuild the stored response.
    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        if let Some(content_type) = self.content_type {
            response.headers_mut().insert(CONTENT_TYPE, content_type);
        }
        response
    }
}

/// Value held at an idempotency store key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredEntry {
    /// A request holding this token is executing the handler.
    Pending(Uuid),
    /// The handler finished and its response is stored.
    Complete(IdempotencyRecord),
}

impl StoredEntry {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            StoredEntry::Pending(token) => {
                let mut out = Vec::with_capacity(17);
                out.push(TAG_PENDING);
                out.extend_from_slice(token.as_bytes());
                out
            }
            StoredEntry::Complete(record) => {
                // Content types longer than u16::MAX are not replayed.
                let content_type = record
                    .content_type
                    .as_ref()
                    .map(HeaderValue::as_bytes)
                    .filter(|ct| ct.len() <= usize::from(u16::MAX))
                    .unwrap_or_default();
                let ct_len = u16::try_from(content_type.len()).unwrap_or(0);

                let mut out = Vec::with_capacity(5 + content_type.len() + record.body.len());
                out.push(TAG_COMPLETE);
                out.extend_from_slice(&record.status.as_u16().to_be_bytes());
                out.extend_from_slice(&ct_len.to_be_bytes());
                out.extend_from_slice(content_type);
                out.extend_from_slice(&record.body);
                out
            }
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Self, RecordError> {
        let (&tag, rest) = raw.split_first().ok_or(RecordError::Empty)?;

        match tag {
            TAG_PENDING => {
                let token = Uuid::from_slice(rest).map_err(|_| RecordError::Truncated)?;
                Ok(StoredEntry::Pending(token))
            }
            TAG_COMPLETE => {
                let (status, rest) = take_u16(rest)?;
                let (ct_len, rest) = take_u16(rest)?;
                let (content_type, body) = rest
                    .split_at_checked(usize::from(ct_len))
                    .ok_or(RecordError::Truncated)?;

                let status =
                    StatusCode::from_u16(status).map_err(|_| RecordError::InvalidStatus(status))?;
                let content_type = if content_type.is_empty() {
                    None
                } else {
                    Some(
                        HeaderValue::from_bytes(content_type)
                            .map_err(|_| RecordError::InvalidContentType)?,
                    )
                };

                Ok(StoredEntry::Complete(IdempotencyRecord {
                    status,
                    content_type,
                    body: Bytes::copy_from_slice(body),
                }))
            }
            other => Err(RecordError::UnknownTag(other)),
        }
    }
}

fn take_u16(raw: &[u8]) -> Result<(u16, &[u8]), RecordError> {
    let (head, rest) = raw.split_first_chunk::<2>().ok_or(RecordError::Truncated)?;
    Ok((u16::from_be_bytes(*head), rest))
}
