//! Session and the per-peer connection state machine
//!
//! [`Session`] is the shared, read-only view handed to the broadcast channel
//! and presentation code. [`SessionManager`] is its only mutator and lives on
//! the node driver, which applies transport-reported transitions one at a
//! time in the order they were observed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use snapshare_core::{ConnectionState, LinkChange, PeerIdentity, PeerToken, SessionEvent};

use crate::events::{EventStream, Subscribers};

/// One other peer's link to this device
#[derive(Clone, Debug)]
pub struct PeerConnection {
    pub identity: PeerIdentity,
    pub state: ConnectionState,
    /// When the current state was entered
    pub since: Instant,
    /// Distinguishes a reconnect from the connection it replaced
    pub generation: u64,
}

struct SessionInner {
    local: PeerIdentity,
    peers: RwLock<HashMap<PeerToken, PeerConnection>>,
    events: Subscribers<SessionEvent>,
}

/// This device's identity plus its live peer connections
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    fn new(local: PeerIdentity) -> Self {
        Session {
            inner: Arc::new(SessionInner {
                local,
                peers: RwLock::new(HashMap::new()),
                events: Subscribers::new(),
            }),
        }
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.inner.local
    }

    /// Snapshot of the peers currently `connected`
    pub fn connected_peers(&self) -> HashSet<PeerIdentity> {
        self.inner
            .peers
            .read()
            .values()
            .filter(|c| c.state == ConnectionState::Connected)
            .map(|c| c.identity.clone())
            .collect()
    }

    pub fn is_connected(&self, token: PeerToken) -> bool {
        self.inner
            .peers
            .read()
            .get(&token)
            .is_some_and(|c| c.state == ConnectionState::Connected)
    }

    pub fn peer(&self, token: PeerToken) -> Option<PeerConnection> {
        self.inner.peers.read().get(&token).cloned()
    }

    /// Every connecting or connected peer
    pub fn peers(&self) -> Vec<PeerConnection> {
        self.inner.peers.read().values().cloned().collect()
    }

    /// Membership changes from now on
    pub fn subscribe(&self) -> EventStream<SessionEvent> {
        self.inner.events.subscribe()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local", &self.inner.local)
            .field("peers", &self.inner.peers.read().len())
            .finish()
    }
}

/// Sole mutator of a [`Session`]
pub struct SessionManager {
    session: Session,
    next_generation: u64,
}

impl SessionManager {
    pub fn new(local: PeerIdentity) -> Self {
        SessionManager {
            session: Session::new(local),
            next_generation: 1,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Apply one transition and publish the resulting membership event.
    ///
    /// Transitions the state machine does not allow are ignored and return
    /// `None`. A `disconnected` peer is removed; a later `connecting` starts a
    /// new connection with a fresh generation.
    pub fn on_link_state_changed(
        &mut self,
        peer: &PeerIdentity,
        change: LinkChange,
    ) -> Option<SessionEvent> {
        let token = peer.token();
        let now = Instant::now();

        let event = {
            let mut peers = self.session.inner.peers.write();
            let current = peers.get(&token).map(|c| c.state);

            match (current, change) {
                (None, LinkChange::Connecting) => {
                    let generation = self.next_generation;
                    self.next_generation += 1;
                    peers.insert(
                        token,
                        PeerConnection {
                            identity: peer.clone(),
                            state: ConnectionState::Connecting,
                            since: now,
                            generation,
                        },
                    );
                    SessionEvent::PeerConnecting(peer.clone())
                }
                (Some(state), LinkChange::Connected)
                    if state.can_transition_to(ConnectionState::Connected) =>
                {
                    let conn = peers.get_mut(&token)?;
                    conn.state = ConnectionState::Connected;
                    conn.since = now;
                    SessionEvent::PeerJoined(conn.identity.clone())
                }
                (Some(state), LinkChange::Disconnected(reason)) => {
                    let conn = peers.remove(&token)?;
                    SessionEvent::PeerLeft {
                        peer: conn.identity,
                        reason,
                        was_connected: state == ConnectionState::Connected,
                    }
                }
                (current, change) => {
                    tracing::debug!(
                        peer = %peer,
                        from = ?current,
                        to = %change.state(),
                        "Ignoring invalid transition"
                    );
                    return None;
                }
            }
        };

        match &event {
            SessionEvent::PeerConnecting(p) => {
                tracing::debug!(peer = %p, token = %p.token(), "Peer connecting")
            }
            SessionEvent::PeerJoined(p) => {
                tracing::info!(peer = %p, token = %p.token(), "Peer connected")
            }
            SessionEvent::PeerLeft {
                peer,
                reason,
                was_connected,
            } => tracing::info!(peer = %peer, ?reason, was_connected, "Peer disconnected"),
        }

        self.session.inner.events.publish(event.clone());
        Some(event)
    }

    /// End every membership stream
    pub fn close(&self) {
        self.session.inner.events.close();
    }
}
