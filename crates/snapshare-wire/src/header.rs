//! Packet header
//!
//! Header is 10 bytes:
//! - Byte 0: Wire version
//! - Byte 1: Packet kind
//! - Bytes 2-9: Sender peer token (LE)

use bytes::BufMut;
use snapshare_core::{PeerToken, ShareError, ShareResult};

/// Header size in bytes
pub const HEADER_SIZE: usize = 10;

/// Current wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Packet kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    // Discovery
    Beacon = 0x01,
    Probe = 0x02,

    // Handshake
    Invite = 0x10,
    Accept = 0x11,
    Reject = 0x12,

    // Encrypted link traffic
    Sealed = 0x20,
}

impl PacketKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(PacketKind::Beacon),
            0x02 => Some(PacketKind::Probe),
            0x10 => Some(PacketKind::Invite),
            0x11 => Some(PacketKind::Accept),
            0x12 => Some(PacketKind::Reject),
            0x20 => Some(PacketKind::Sealed),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Discovery traffic is handled by advertisers and browsers, not links
    pub fn is_discovery(self) -> bool {
        matches!(self, PacketKind::Beacon | PacketKind::Probe)
    }
}

/// Cipher suites a handshake may offer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuite {
    /// No encryption; always refused
    Plaintext = 0x00,
    /// X25519 + HKDF-SHA256 + ChaCha20-Poly1305
    X25519ChaCha20Poly1305 = 0x01,
}

impl CipherSuite {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(CipherSuite::Plaintext),
            0x01 => Some(CipherSuite::X25519ChaCha20Poly1305),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Whether this suite satisfies the mandatory-encryption policy
    pub fn is_encrypted(self) -> bool {
        !matches!(self, CipherSuite::Plaintext)
    }
}

impl Default for CipherSuite {
    fn default() -> Self {
        CipherSuite::X25519ChaCha20Poly1305
    }
}

/// Packet header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub kind: PacketKind,
    pub sender: PeerToken,
}

impl PacketHeader {
    pub fn new(kind: PacketKind, sender: PeerToken) -> Self {
        PacketHeader {
            version: WIRE_VERSION,
            kind,
            sender,
        }
    }

    /// Parse header from bytes
    pub fn parse(buf: &[u8]) -> ShareResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ShareError::BufferTooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let version = buf[0];
        if version != WIRE_VERSION {
            return Err(ShareError::InvalidWireFormat(format!(
                "Unsupported wire version {}",
                version
            )));
        }

        let kind = PacketKind::from_byte(buf[1]).ok_or(ShareError::UnknownPacketKind(buf[1]))?;

        let mut token = [0u8; 8];
        token.copy_from_slice(&buf[2..10]);

        Ok(PacketHeader {
            version,
            kind,
            sender: PeerToken::from_bytes(token),
        })
    }

    /// Serialize header
    pub fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u8(self.version);
        out.put_u8(self.kind.to_byte());
        out.put_u64_le(self.sender.0);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.kind.to_byte();
        buf[2..10].copy_from_slice(&self.sender.to_bytes());
        buf
    }
}
