//! Link cipher: ChaCha20-Poly1305 with one key per direction

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use snapshare_core::{PeerToken, ShareError, ShareResult};
use snapshare_wire::sealed_aad;

use crate::{LinkKeys, ReplayWindow};

/// Key size for ChaCha20-Poly1305
pub const KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305
pub const NONCE_SIZE: usize = 12;

/// Tag size for ChaCha20-Poly1305
pub const TAG_SIZE: usize = 16;

/// Nonce for a direction-local counter. Keys are never shared between
/// directions, so the counter alone is unique per key.
pub fn counter_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypts outgoing and authenticates incoming sealed packets of one link
pub struct LinkCipher {
    send: ChaCha20Poly1305,
    recv: ChaCha20Poly1305,
    next_counter: u64,
    replay: ReplayWindow,
}

impl LinkCipher {
    pub fn new(keys: &LinkKeys) -> Self {
        LinkCipher {
            send: ChaCha20Poly1305::new(Key::from_slice(&keys.send)),
            recv: ChaCha20Poly1305::new(Key::from_slice(&keys.recv)),
            next_counter: 0,
            replay: ReplayWindow::new(),
        }
    }

    /// Seal `plaintext` as sent by `local`; returns the counter and ciphertext
    pub fn seal(&mut self, local: PeerToken, plaintext: &[u8]) -> ShareResult<(u64, Vec<u8>)> {
        let counter = self.next_counter;
        let aad = sealed_aad(local, counter);
        let ciphertext = self
            .send
            .encrypt(
                Nonce::from_slice(&counter_nonce(counter)),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| ShareError::DecryptionFailed)?;
        self.next_counter += 1;
        Ok((counter, ciphertext))
    }

    /// Authenticate and decrypt a sealed packet from `remote`
    pub fn open(
        &mut self,
        remote: PeerToken,
        counter: u64,
        ciphertext: &[u8],
    ) -> ShareResult<Vec<u8>> {
        if !self.replay.check(counter) {
            return Err(ShareError::ReplayDetected(counter));
        }

        let aad = sealed_aad(remote, counter);
        let plaintext = self
            .recv
            .decrypt(
                Nonce::from_slice(&counter_nonce(counter)),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| ShareError::DecryptionFailed)?;

        // Only authenticated counters move the window
        self.replay.accept(counter);
        Ok(plaintext)
    }

    /// Counter the next sealed packet will carry
    pub fn next_counter(&self) -> u64 {
        self.next_counter
    }
}
