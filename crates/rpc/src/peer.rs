//! Peer identity used as the rate limiter key.

use axum::http::HeaderMap;
use std::net::SocketAddr;

/// The value of the trusted forwarding header when one is configured and
/// present, otherwise the remote IP without its port.
pub fn determine_peer(remote: SocketAddr, headers: &HeaderMap, forward_header: Option<&str>) -> String {
    forward_header
        .and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| remote.ip().to_string())
}
