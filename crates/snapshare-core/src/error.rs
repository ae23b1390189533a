//! Error types for snapshare

use thiserror::Error;

use crate::PeerIdentity;

/// Core snapshare errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShareError {
    // Transport errors
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    // Crypto errors
    #[error("Encryption required: peer could not negotiate an encrypted link")]
    EncryptionRequired,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Replay detected: counter {0}")]
    ReplayDetected(u64),

    // Delivery errors
    #[error("Delivery failed to {}", peer_list(.targets))]
    DeliveryFailed { targets: Vec<PeerIdentity> },

    #[error("Payload too large: {size} bytes exceeds {max}")]
    PayloadTooLarge { size: usize, max: usize },

    // Decode errors
    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Unknown packet kind: {0:#04x}")]
    UnknownPacketKind(u8),

    // Session errors
    #[error("Session closed")]
    SessionClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ShareError {
    /// Peers a failed reliable send did not reach, if this is a delivery failure
    pub fn failed_targets(&self) -> &[PeerIdentity] {
        match self {
            ShareError::DeliveryFailed { targets } => targets,
            _ => &[],
        }
    }
}

fn peer_list(targets: &[PeerIdentity]) -> String {
    targets
        .iter()
        .map(|p| p.display_name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for snapshare operations
pub type ShareResult<T> = Result<T, ShareError>;
