//! Payloads carried by the broadcast channel

use bytes::Bytes;

use crate::{PeerIdentity, Reliability};

/// Immutable byte sequence plus sender and reliability tag.
///
/// `sender` is `None` for self-originated payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    bytes: Bytes,
    sender: Option<PeerIdentity>,
    reliability: Reliability,
}

impl Payload {
    /// Payload originating on this device
    pub fn outbound(bytes: impl Into<Bytes>, reliability: Reliability) -> Self {
        Payload {
            bytes: bytes.into(),
            sender: None,
            reliability,
        }
    }

    /// Payload delivered by a peer
    pub fn received(bytes: Bytes, sender: PeerIdentity, reliability: Reliability) -> Self {
        Payload {
            bytes,
            sender: Some(sender),
            reliability,
        }
    }

    /// Shorthand for a reliable outbound payload
    pub fn reliable(bytes: impl Into<Bytes>) -> Self {
        Self::outbound(bytes, Reliability::Reliable)
    }

    /// Shorthand for a best-effort outbound payload
    pub fn best_effort(bytes: impl Into<Bytes>) -> Self {
        Self::outbound(bytes, Reliability::BestEffort)
    }

    #[inline]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Sender of the payload, `None` when self-originated
    #[inline]
    pub fn sender(&self) -> Option<&PeerIdentity> {
        self.sender.as_ref()
    }

    #[inline]
    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}
