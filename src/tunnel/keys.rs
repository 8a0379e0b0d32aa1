//! X25519 keypairs for tunnel peers.
//!
//! Keys are carried base64-encoded, the form the wg tooling and client
//! config files expect.

use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// A peer keypair, base64-encoded.
#[derive(Debug, Clone)]
pub struct Keypair {
    pub private: String,
    pub public: String,
}

/// Generate a fresh X25519 keypair.
pub fn generate_keypair() -> Keypair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    Keypair {
        private: BASE64.encode(secret.to_bytes()),
        public: BASE64.encode(public.as_bytes()),
    }
}

/// Derive the base64 public key from a base64 private key.
pub fn public_from_private(private: &str) -> Result<String> {
    let bytes = BASE64
        .decode(private)
        .map_err(|e| Error::Parse(format!("invalid private key: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Parse("private key must be 32 bytes".to_string()))?;

    let secret = StaticSecret::from(bytes);
    Ok(BASE64.encode(PublicKey::from(&secret).as_bytes()))
}
