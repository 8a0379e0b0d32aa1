//! Tunnel peer management
//!
//! Peer registry, keypair handling, and the wg command surface.

mod keys;
mod manager;

pub use keys::{generate_keypair, public_from_private, Keypair};
pub use manager::{Peer, PeerRemovedHook, TunnelManager, WgCli, WgControl};
