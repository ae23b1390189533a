//! Ephemeral X25519 handshake and link key schedule
//!
//! Both sides generate a fresh key pair per link. The shared secret runs
//! through HKDF-SHA256 salted with the service tag and bound to both tokens
//! and both public keys, yielding one key per direction.

use std::fmt;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use snapshare_core::{PeerToken, ShareError, ShareResult};
use snapshare_wire::PUBLIC_KEY_SIZE;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::aead::KEY_SIZE;

/// HKDF info prefix
pub const LINK_KEY_INFO: &[u8] = b"snapshare/link/v1";

/// Which side of the handshake this node played
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Inviter,
    Acceptor,
}

/// Everything both sides must agree on for the keys to match
#[derive(Clone, Debug)]
pub struct Transcript<'a> {
    pub service_tag: &'a str,
    pub inviter: PeerToken,
    pub acceptor: PeerToken,
    pub inviter_key: [u8; PUBLIC_KEY_SIZE],
    pub acceptor_key: [u8; PUBLIC_KEY_SIZE],
}

impl Transcript<'_> {
    fn info(&self) -> Vec<u8> {
        let mut info = Vec::with_capacity(LINK_KEY_INFO.len() + 16 + 2 * PUBLIC_KEY_SIZE);
        info.extend_from_slice(LINK_KEY_INFO);
        info.extend_from_slice(&self.inviter.to_bytes());
        info.extend_from_slice(&self.acceptor.to_bytes());
        info.extend_from_slice(&self.inviter_key);
        info.extend_from_slice(&self.acceptor_key);
        info
    }
}

/// Directional link keys
#[derive(Clone)]
pub struct LinkKeys {
    pub send: [u8; KEY_SIZE],
    pub recv: [u8; KEY_SIZE],
}

impl fmt::Debug for LinkKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LinkKeys(..)")
    }
}

/// One side's ephemeral key pair
pub struct HandshakeKeys {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl HandshakeKeys {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        HandshakeKeys { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Finish the agreement. A low-order peer key yields
    /// [`ShareError::EncryptionRequired`].
    pub fn complete(
        self,
        peer_public: [u8; PUBLIC_KEY_SIZE],
        transcript: &Transcript<'_>,
        role: Role,
    ) -> ShareResult<LinkKeys> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer_public));
        if !shared.was_contributory() {
            tracing::warn!(peer_key = ?&peer_public[..4], "Non-contributory key exchange refused");
            return Err(ShareError::EncryptionRequired);
        }
        derive_link_keys(shared.as_bytes(), transcript, role)
    }
}

impl fmt::Debug for HandshakeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeKeys")
            .field("public", &self.public.as_bytes()[..4].to_vec())
            .finish_non_exhaustive()
    }
}

/// Expand a shared secret into directional keys for `role`
pub fn derive_link_keys(
    shared: &[u8; 32],
    transcript: &Transcript<'_>,
    role: Role,
) -> ShareResult<LinkKeys> {
    let hkdf = Hkdf::<Sha256>::new(Some(transcript.service_tag.as_bytes()), shared);
    let mut okm = [0u8; 2 * KEY_SIZE];
    hkdf.expand(&transcript.info(), &mut okm)
        .map_err(|_| ShareError::EncryptionRequired)?;

    let mut to_acceptor = [0u8; KEY_SIZE];
    let mut to_inviter = [0u8; KEY_SIZE];
    to_acceptor.copy_from_slice(&okm[..KEY_SIZE]);
    to_inviter.copy_from_slice(&okm[KEY_SIZE..]);

    Ok(match role {
        Role::Inviter => LinkKeys {
            send: to_acceptor,
            recv: to_inviter,
        },
        Role::Acceptor => LinkKeys {
            send: to_inviter,
            recv: to_acceptor,
        },
    })
}
