//! Translation of HTTP requests into pipeline inputs.

use std::net::SocketAddr;

use axum::http::HeaderMap;
use pipeline::{InboundHeaders, OriginKey};

/// Header carrying the operator token for `POST /test`.
pub const TEST_TOKEN_HEADER: &str = "x-test-token";

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Copies the request headers. Values that are not visible ASCII are dropped.
pub fn inbound_headers(headers: &HeaderMap) -> InboundHeaders {
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
        .collect()
}

/// Rate-limit bucket for a request: the peer IP, or the first
/// `X-Forwarded-For` entry when the relay sits behind a trusted proxy.
pub fn origin_key(
    peer: SocketAddr,
    headers: &HeaderMap,
    trust_forwarded_for: bool,
) -> Option<OriginKey> {
    let forwarded = trust_forwarded_for
        .then(|| headers.get(FORWARDED_FOR))
        .flatten()
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| OriginKey::new(first.trim()));

    forwarded.or_else(|| OriginKey::new(peer.ip().to_string()))
}
