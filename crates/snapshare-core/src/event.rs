//! Connection states and session events
//!
//! Transport notifications collapse into a small closed set of variants:
//! link changes drive the per-peer state machine, session events are what
//! observers see.

use std::fmt;

use crate::PeerIdentity;

/// Per-peer connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Terminal. A reconnect creates a new connection.
    Disconnected,
}

impl ConnectionState {
    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Connecting, ConnectionState::Connected)
                | (ConnectionState::Connecting, ConnectionState::Disconnected)
                | (ConnectionState::Connected, ConnectionState::Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Why a peer ended up `disconnected`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Handshake did not meet the mandatory-encryption policy
    EncryptionRequired = 0x01,
    /// Handshake retransmissions exhausted
    HandshakeTimeout = 0x02,
    /// Remote side refused the invitation
    Rejected = 0x03,
    /// Link went silent or reliable retries were exhausted
    LinkLost = 0x04,
    /// Remote side said goodbye or restarted
    RemoteClosed = 0x05,
    /// Local session teardown
    LocalTeardown = 0x06,
}

impl DisconnectReason {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(DisconnectReason::EncryptionRequired),
            0x02 => Some(DisconnectReason::HandshakeTimeout),
            0x03 => Some(DisconnectReason::Rejected),
            0x04 => Some(DisconnectReason::LinkLost),
            0x05 => Some(DisconnectReason::RemoteClosed),
            0x06 => Some(DisconnectReason::LocalTeardown),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// A transition reported by the transport for one peer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkChange {
    Connecting,
    Connected,
    Disconnected(DisconnectReason),
}

impl LinkChange {
    pub fn state(self) -> ConnectionState {
        match self {
            LinkChange::Connecting => ConnectionState::Connecting,
            LinkChange::Connected => ConnectionState::Connected,
            LinkChange::Disconnected(_) => ConnectionState::Disconnected,
        }
    }
}

/// Membership change published to session observers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new connection started negotiating
    PeerConnecting(PeerIdentity),
    /// Peer reached `connected` and is now a broadcast target
    PeerJoined(PeerIdentity),
    /// Peer reached `disconnected` and was removed from the session
    PeerLeft {
        peer: PeerIdentity,
        reason: DisconnectReason,
        /// Whether the peer had been `connected` before leaving
        was_connected: bool,
    },
}

impl SessionEvent {
    pub fn peer(&self) -> &PeerIdentity {
        match self {
            SessionEvent::PeerConnecting(peer) | SessionEvent::PeerJoined(peer) => peer,
            SessionEvent::PeerLeft { peer, .. } => peer,
        }
    }
}

/// Delivery reliability of a payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Reliability {
    /// Delivery confirmed per target, or an explicit failure
    #[default]
    Reliable = 0x00,
    /// No delivery guarantee, never reports per-target failure
    BestEffort = 0x01,
}

impl Reliability {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Reliability::Reliable),
            0x01 => Some(Reliability::BestEffort),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use ConnectionState::*;

        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnected));

        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connected));
    }

    #[test]
    fn test_disconnect_reason_bytes() {
        for reason in [
            DisconnectReason::EncryptionRequired,
            DisconnectReason::HandshakeTimeout,
            DisconnectReason::Rejected,
            DisconnectReason::LinkLost,
            DisconnectReason::RemoteClosed,
            DisconnectReason::LocalTeardown,
        ] {
            assert_eq!(DisconnectReason::from_byte(reason.to_byte()), Some(reason));
        }
        assert_eq!(DisconnectReason::from_byte(0x00), None);
    }

    #[test]
    fn test_link_change_state() {
        assert_eq!(LinkChange::Connecting.state(), ConnectionState::Connecting);
        assert_eq!(
            LinkChange::Disconnected(DisconnectReason::LinkLost).state(),
            ConnectionState::Disconnected
        );
    }
}
