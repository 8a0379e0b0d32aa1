//! Configuration types

use crate::telemetry::LogConfig;
use crate::{Error, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;

/// User-defined configuration (warren.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub port_forward: PortForwardConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// The WireGuard interface this process manages.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Interface name, e.g. "wg0"
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Server address on the tunnel, CIDR notation (e.g. "10.8.0.1/24").
    /// The host part is also the bind address for the NAT-PMP socket.
    #[serde(default = "default_address_v4")]
    pub address_v4: String,
    /// WireGuard listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Publicly reachable endpoint, "host" or "host:port". Handed to
    /// clients and resolved at startup for NAT-PMP public-address replies.
    #[serde(default)]
    pub endpoint: String,
}

/// In-tunnel NAT-PMP port forwarding.
#[derive(Debug, Clone, Deserialize)]
pub struct PortForwardConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Lowest external port clients may claim
    #[serde(default = "default_min_port")]
    pub min_port: u16,
    /// Highest external port clients may claim
    #[serde(default = "default_max_port")]
    pub max_port: u16,
    /// Maximum number of concurrent mappings per client address
    #[serde(default = "default_max_per_client")]
    pub max_per_client: usize,
    /// Lifetime in seconds for mappings created without one (admin plane)
    #[serde(default = "default_lifetime")]
    pub default_lifetime: u32,
}

fn default_interface() -> String {
    "wg0".to_string()
}

fn default_address_v4() -> String {
    "10.8.0.1/24".to_string()
}

fn default_listen_port() -> u16 {
    51820
}

fn default_min_port() -> u16 {
    1024
}

fn default_max_port() -> u16 {
    65535
}

fn default_max_per_client() -> usize {
    10
}

fn default_lifetime() -> u32 {
    3600
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            address_v4: default_address_v4(),
            listen_port: default_listen_port(),
            endpoint: String::new(),
        }
    }
}

impl Default for PortForwardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_port: default_min_port(),
            max_port: default_max_port(),
            max_per_client: default_max_per_client(),
            default_lifetime: default_lifetime(),
        }
    }
}

impl TunnelConfig {
    /// The server's own address on the tunnel (host part of `address_v4`).
    pub fn server_ip(&self) -> Result<Ipv4Addr> {
        Ok(parse_cidr(&self.address_v4)?.0)
    }

    /// Prefix length of the tunnel subnet.
    pub fn prefix_len(&self) -> Result<u8> {
        Ok(parse_cidr(&self.address_v4)?.1)
    }
}

/// Parse "a.b.c.d/len" into address and prefix length.
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::Parse(format!("invalid CIDR: {}", cidr)))?;

    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::Parse(format!("invalid IP: {}", addr)))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| Error::Parse(format!("invalid prefix: {}", prefix)))?;

    if prefix > 32 {
        return Err(Error::Parse(format!("invalid prefix: {}", prefix)));
    }

    Ok((addr, prefix))
}
