//! Warren - Tunnel Management Plane
//!
//! Manages WireGuard tunnel peers and exposes an in-tunnel NAT-PMP
//! port-forwarding service, so tunneled clients can request that external
//! TCP/UDP ports on the host be forwarded to their tunnel address.

pub mod config;
pub mod error;
pub mod portmap;
pub mod protocol;
pub mod telemetry;
pub mod tunnel;

pub use error::{Error, Result};
