//! Client IP resolution and address classification for auth decisions.
//!
//! The gateway trusts forwarded headers only when the hop that wrote them is
//! a configured reverse proxy; everything else falls back to the TCP peer.

use std::net::{IpAddr, SocketAddr};

use {axum::http::HeaderMap, ipnet::IpNet};

/// Returns `true` when common proxy/forwarding headers are present.
pub fn has_proxy_headers(headers: &HeaderMap) -> bool {
    headers.contains_key("x-forwarded-for")
        || headers.contains_key("x-real-ip")
        || headers.get("forwarded").is_some()
}

/// Loopback check, including IPv4-mapped IPv6 loopback.
pub fn is_loopback_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        },
    }
}

/// Private or loopback: the address space where machine-scoped endpoints may
/// fall back to the sibling-connection check.
pub fn is_private_or_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return v4.is_loopback() || v4.is_private() || v4.is_link_local();
            }
            // ULA fc00::/7 and link-local fe80::/10.
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        },
    }
}

/// Mesh (overlay VPN) address ranges: CGNAT IPv4 100.64.0.0/10 and the
/// matching fd7a:115c:a1e0::/48 IPv6 block. Requests from these ranges may
/// bypass credential checks when the permissive mesh flag is configured.
pub fn is_mesh_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 100 && (o[1] & 0xc0) == 0x40
        },
        IpAddr::V6(v6) => {
            let s = v6.segments();
            s[0] == 0xfd7a && s[1] == 0x115c && s[2] == 0xa1e0
        },
    }
}

/// Returns `true` when `host` (without port) is a loopback name/address.
fn is_loopback_host(host: &str) -> bool {
    let name = if host.starts_with('[') {
        host.rsplit_once("]:")
            .map_or(host, |(addr, _)| addr)
            .trim_start_matches('[')
            .trim_end_matches(']')
    } else if host.matches(':').count() > 1 {
        // Bare IPv6 like ::1: the colons belong to the address, not a port.
        host
    } else {
        host.rsplit_once(':').map_or(host, |(addr, _)| addr)
    };
    matches!(name, "localhost" | "127.0.0.1" | "::1") || name.ends_with(".localhost")
}

/// Determine whether a connection is a **direct local** connection: loopback
/// TCP peer with no intermediary claiming otherwise (no forwarding headers,
/// no foreign Host).
pub fn is_direct_local(headers: &HeaderMap, remote: SocketAddr) -> bool {
    if has_proxy_headers(headers) {
        return false;
    }
    if let Some(host) = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        && !is_loopback_host(host)
    {
        return false;
    }
    is_loopback_ip(remote.ip())
}

fn is_trusted_proxy(ip: IpAddr, trusted: &[IpNet]) -> bool {
    trusted.iter().any(|net| net.contains(&ip))
}

/// Resolve the effective client IP: walk the `X-Forwarded-For` chain
/// right-to-left, discarding hops that belong to a trusted-proxy CIDR; the
/// first untrusted hop is the client. Falls back to `X-Real-IP` when no
/// forwarded chain exists, then to the TCP peer.
pub fn resolve_client_ip(headers: &HeaderMap, remote: SocketAddr, trusted: &[IpNet]) -> IpAddr {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        for candidate in xff.split(',').rev() {
            if let Some(ip) = parse_ip(candidate.trim())
                && !is_trusted_proxy(ip, trusted)
            {
                return ip;
            }
        }
        // Every hop in the chain was a trusted proxy; the nearest hop wins.
        return remote.ip();
    }
    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_ip(v.trim()))
    {
        return ip;
    }
    remote.ip()
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    if value.is_empty() {
        return None;
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    None
}
