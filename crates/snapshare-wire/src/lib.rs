//! snapshare Wire Protocol - Binary packet format
//!
//! Every datagram is a 10-byte header followed by a kind-specific body:
//! - Discovery: beacons and probes (plaintext)
//! - Handshake: invite, accept, reject (plaintext, carries X25519 keys)
//! - Sealed: AEAD-protected link messages (confirm, data, ack, ping, bye)

pub mod codec;
pub mod discovery;
pub mod handshake;
pub mod header;
pub mod link;
pub mod packet;

pub use discovery::*;
pub use handshake::*;
pub use header::*;
pub use link::*;
pub use packet::*;

/// Maximum datagram size (MTU-friendly)
pub const MAX_DATAGRAM_SIZE: usize = 1400;
