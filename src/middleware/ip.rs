//! Caller IP resolution for rate-limit keys and violation audit entries.
//!
//! # Resolution Order
//!
//! 1. First comma-separated entry of `X-Forwarded-For` (trimmed, if non-empty)
//! 2. Transport peer address from axum's `ConnectInfo<SocketAddr>`
//! 3. [`UNKNOWN_IP`]
//!
//! The peer address is only available when the server is started with
//! `into_make_service_with_connect_info::<SocketAddr>()`.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! `X-Forwarded-For` is client-controlled unless an edge proxy overwrites it.
//! Deploy behind a proxy that replaces (not appends to) the header, and block
//! direct access to this service; otherwise a client can rotate spoofed values
//! to escape an IP-keyed rate limit.

use std::borrow::Cow;
use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;

/// Header carrying the proxy chain, client first.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Fallback when neither a forwarded address nor a peer address is known.
///
/// All such requests share one rate-limit identity.
pub const UNKNOWN_IP: &str = "unknown";

#[inline]
fn forwarded_for<B>(req: &Request<B>) -> Option<&str> {
    let value = req.headers().get(FORWARDED_FOR_HEADER)?.to_str().ok()?;
    let first = value.split(',').next()?.trim();
    (!first.is_empty()).then_some(first)
}

/// Resolve the caller's IP address.
///
/// Returns `Cow::Borrowed(UNKNOWN_IP)` without allocating when nothing is known.
#[inline]
pub fn client_ip<B>(req: &Request<B>) -> Cow<'static, str> {
    if let Some(ip) = forwarded_for(req) {
        return Cow::Owned(ip.to_string());
    }

    if let Some(ConnectInfo(peer)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Cow::Owned(peer.ip().to_string());
    }

    Cow::Borrowed(UNKNOWN_IP)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn with_peer(mut req: Request<Body>, addr: &str) -> Request<Body> {
        req.extensions_mut()
            .insert(ConnectInfo(addr.parse::<SocketAddr>().unwrap()));
        req
    }

    #[test]
    fn test_first_forwarded_entry_wins() {
        let req = Request::builder()
            .header("x-forwarded-for", "  192.168.1.1  , 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(client_ip(&req), "192.168.1.1");
    }

    #[test]
    fn test_forwarded_for_beats_peer_address() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.50")
            .body(Body::empty())
            .unwrap();
        let req = with_peer(req, "10.1.2.3:55000");

        assert_eq!(client_ip(&req), "203.0.113.50");
    }

    #[test]
    fn test_peer_address_without_port() {
        let req = with_peer(Request::builder().body(Body::empty()).unwrap(), "10.1.2.3:55000");
        assert_eq!(client_ip(&req), "10.1.2.3");

        let req = with_peer(Request::builder().body(Body::empty()).unwrap(), "[::1]:8080");
        assert_eq!(client_ip(&req), "::1");
    }

    #[test]
    fn test_blank_forwarded_for_falls_back_to_peer() {
        let req = Request::builder()
            .header("x-forwarded-for", "   , 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        let req = with_peer(req, "172.16.0.9:1234");

        assert_eq!(client_ip(&req), "172.16.0.9");
    }

    #[test]
    fn test_forwarded_ipv6() {
        let req = Request::builder()
            .header("x-forwarded-for", "2001:db8::1, 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(client_ip(&req), "2001:db8::1");
    }

    #[test]
    fn test_unknown_is_borrowed() {
        let req = Request::builder().body(Body::empty()).unwrap();
        let ip = client_ip(&req);

        assert_eq!(ip, UNKNOWN_IP);
        assert!(matches!(ip, Cow::Borrowed(_)));
    }
}
