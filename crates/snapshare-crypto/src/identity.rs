//! Local peer identity
//!
//! The token is derived from the display name plus random salt, so two
//! processes on the same host still get distinct tokens. Name collisions
//! across devices are not resolved; peers are told apart by token only.

use std::sync::OnceLock;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use snapshare_core::{truncate_name, PeerIdentity, PeerToken};

/// Name used when the environment offers nothing better
pub const FALLBACK_DEVICE_NAME: &str = "snapshare-device";

const NAME_VARS: [&str; 3] = ["SNAPSHARE_DEVICE_NAME", "HOSTNAME", "COMPUTERNAME"];

static CURRENT: OnceLock<PeerIdentity> = OnceLock::new();

/// Create a fresh identity for `name`
pub fn generate(name: &str) -> PeerIdentity {
    let name = truncate_name(name);
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);

    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(salt);
    let digest = hasher.finalize();

    let mut token = [0u8; 8];
    token.copy_from_slice(&digest[..8]);
    let mut token = PeerToken::from_bytes(token);
    // Zero is reserved as "no peer"
    if token == PeerToken::ZERO {
        token = PeerToken::new(1);
    }
    PeerIdentity::new(token, name)
}

/// The locally available device name
pub fn device_name() -> String {
    NAME_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|v| v.trim().to_owned())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| FALLBACK_DEVICE_NAME.to_owned())
}

/// This process's identity, created on first use and stable afterwards
pub fn current() -> PeerIdentity {
    CURRENT
        .get_or_init(|| {
            let identity = generate(&device_name());
            tracing::debug!(peer = %identity, token = %identity.token(), "Local identity created");
            identity
        })
        .clone()
}
