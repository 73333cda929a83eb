//! Idempotency key fingerprinting.
//!
//! Client keys are opaque and unbounded, so they are never used as store keys
//! directly. Each key is reduced to the lowercase hex SHA-256 digest of its
//! bytes, which has a fixed length and negligible collision probability.
//!
//! An empty key produces no fingerprint: the request is handled as if the
//! idempotency gate were not installed at all.

use std::fmt;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

/// Request header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Store key namespace for idempotency records.
const STORE_PREFIX: &str = "idempotency:";

/// SHA-256 digest of a client idempotency key, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a key. Returns `None` for an empty key.
    pub fn of(key: &str) -> Option<Self> {
        Self::of_bytes(key.as_bytes())
    }

    /// Fingerprint a key given as raw bytes, which need not be UTF-8.
    pub fn of_bytes(key: &[u8]) -> Option<Self> {
        if key.is_empty() {
            return None;
        }
        Some(Self(hex::encode(Sha256::digest(key))))
    }

    /// Fingerprint the `Idempotency-Key` header, if present and non-empty.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|v| Self::of_bytes(v.as_bytes()))
    }

    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key under which the record for this fingerprint is stored.
    pub fn store_key(&self) -> String {
        format!("{STORE_PREFIX}{}", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_known_digest() {
        let fp = Fingerprint::of("abc").unwrap();
        assert_eq!(
            fp.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            fp.store_key(),
            "idempotency:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_stable_and_distinct() {
        assert_eq!(Fingerprint::of("order-1"), Fingerprint::of("order-1"));
        assert_ne!(Fingerprint::of("order-1"), Fingerprint::of("order-2"));
        assert_eq!(Fingerprint::of("x").unwrap().as_str().len(), 64);
    }

    #[test]
    fn test_empty_key_disables() {
        assert!(Fingerprint::of("").is_none());

        let mut headers = HeaderMap::new();
        assert!(Fingerprint::from_headers(&headers).is_none());

        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static(""));
        assert!(Fingerprint::from_headers(&headers).is_none());
    }

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("Idempotency-Key", HeaderValue::from_static("abc"));
        assert_eq!(Fingerprint::from_headers(&headers), Fingerprint::of("abc"));
    }

    #[test]
    fn test_non_utf8_header_is_fingerprinted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            IDEMPOTENCY_KEY_HEADER,
            HeaderValue::from_bytes(b"caf\xe9-1").unwrap(),
        );

        let fp = Fingerprint::from_headers(&headers).unwrap();
        assert_eq!(Some(fp), Fingerprint::of_bytes(b"caf\xe9-1"));
        assert_ne!(Fingerprint::of_bytes(b"caf\xe9-1"), Fingerprint::of("caf-1"));
    }
}
