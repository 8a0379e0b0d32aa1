//! Startup resolution of the configured public endpoint.
//!
//! The endpoint is `host` or `host:port`. The host is kept as-is when it
//! is already an IPv4 literal, otherwise it is resolved and the first A
//! answer wins. With no IPv4 answer the service still runs; clients see
//! 0.0.0.0 and treat the address as unknown.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use tracing::{debug, warn};

/// Resolve the configured endpoint to the IPv4 literal carried in
/// public-address responses.
pub fn resolve_external_ip(endpoint: &str) -> Ipv4Addr {
    let host = strip_port(endpoint);

    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return ip;
    }

    match lookup_ipv4(host) {
        Some(ip) => {
            debug!("resolved endpoint {} to {}", host, ip);
            ip
        }
        None => {
            warn!(
                "no IPv4 address for endpoint {}; public address responses will report 0.0.0.0",
                host
            );
            Ipv4Addr::UNSPECIFIED
        }
    }
}

/// Split a trailing `:port` off the endpoint, if present.
fn strip_port(endpoint: &str) -> &str {
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => host,
        _ => endpoint,
    }
}

fn lookup_ipv4(host: &str) -> Option<Ipv4Addr> {
    let addrs = (host, 0u16).to_socket_addrs().ok()?;
    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .next()
}
