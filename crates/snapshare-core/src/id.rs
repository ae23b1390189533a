//! Identity types for snapshare
//!
//! A peer is keyed by a 64-bit token; the display name travels with it
//! for presentation but never takes part in equality.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Maximum display name length in bytes (fits the wire's u8 length prefix).
pub const MAX_DISPLAY_NAME: usize = 63;

/// Opaque peer token, unique enough for one broadcast domain
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerToken(pub u64);

impl PeerToken {
    pub const ZERO: PeerToken = PeerToken(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        PeerToken(id)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        PeerToken(u64::from_le_bytes(bytes))
    }
}

impl fmt::Debug for PeerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({:016x})", self.0)
    }
}

impl fmt::Display for PeerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Peer identity: token plus human-readable display name.
///
/// Immutable once created. Equality and hashing use the token only, so a
/// `PeerIdentity` can key any peer-indexed map.
#[derive(Clone)]
pub struct PeerIdentity {
    token: PeerToken,
    display_name: Arc<str>,
}

impl PeerIdentity {
    /// Create an identity, truncating the display name to [`MAX_DISPLAY_NAME`] bytes
    pub fn new(token: PeerToken, display_name: &str) -> Self {
        PeerIdentity {
            token,
            display_name: Arc::from(truncate_name(display_name)),
        }
    }

    #[inline]
    pub fn token(&self) -> PeerToken {
        self.token
    }

    #[inline]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:016x})", self.display_name, self.token.0)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}

/// Cut a name down to at most [`MAX_DISPLAY_NAME`] bytes on a char boundary
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_DISPLAY_NAME {
        return name;
    }
    let mut end = MAX_DISPLAY_NAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
