//! snapshare Crypto - Identity and link encryption
//!
//! - Identity: display-name-derived peer tokens
//! - Handshake: ephemeral X25519 agreement, HKDF-SHA256 key schedule
//! - AEAD: ChaCha20-Poly1305 per direction, counter nonces
//! - Replay: sliding window over receive counters

pub mod aead;
pub mod handshake;
pub mod identity;
pub mod replay;

pub use aead::*;
pub use handshake::*;
pub use replay::*;
