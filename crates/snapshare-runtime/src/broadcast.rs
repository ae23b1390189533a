//! Broadcast channel
//!
//! Sends resolve their targets against the session at call time and hand
//! the work to the node driver; the caller awaits the per-send outcome
//! without ever blocking inbound delivery.

use std::sync::Arc;

use snapshare_core::{Payload, PeerIdentity, Reliability, ShareError, ShareResult};
use tokio::sync::{mpsc, oneshot};

use crate::events::{EventStream, Subscribers};
use crate::node::Command;
use crate::Session;

/// Who a send goes to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Targets {
    /// Every peer connected when the send is issued
    #[default]
    Connected,
    Only(Vec<PeerIdentity>),
}

/// A payload delivered by a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inbound {
    pub from: PeerIdentity,
    pub payload: Payload,
}

/// Fan-out over the session's connected peers
#[derive(Clone)]
pub struct BroadcastChannel {
    commands: mpsc::Sender<Command>,
    session: Session,
    inbound: Arc<Subscribers<Inbound>>,
    max_payload_size: usize,
}

impl BroadcastChannel {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        session: Session,
        inbound: Arc<Subscribers<Inbound>>,
        max_payload_size: usize,
    ) -> Self {
        BroadcastChannel {
            commands,
            session,
            inbound,
            max_payload_size,
        }
    }

    /// Send `payload` to each target independently.
    ///
    /// Reliable sends resolve once every target acknowledged or failed; if
    /// any failed the error is [`ShareError::DeliveryFailed`] naming them,
    /// and the others still received the payload. Best-effort sends never
    /// report per-target failure. An empty target set is a no-op.
    pub async fn send(&self, payload: Payload, targets: Targets) -> ShareResult<()> {
        if payload.len() > self.max_payload_size {
            return Err(ShareError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload_size,
            });
        }

        let targets: Vec<PeerIdentity> = match targets {
            Targets::Connected => self.session.connected_peers().into_iter().collect(),
            Targets::Only(mut peers) => {
                peers.sort_by_key(|p| p.token());
                peers.dedup();
                peers
            }
        };
        if targets.is_empty() {
            tracing::debug!("Send with no targets");
            return Ok(());
        }

        let reliability = payload.reliability();
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Send {
                payload,
                targets,
                reply,
            })
            .await
            .map_err(|_| ShareError::SessionClosed)?;

        match outcome.await {
            Ok(result) => result,
            // Driver went away mid-send
            Err(_) if reliability == Reliability::BestEffort => Ok(()),
            Err(_) => Err(ShareError::SessionClosed),
        }
    }

    /// Every inbound payload from now on, FIFO per sender
    pub fn on_receive(&self) -> EventStream<Inbound> {
        self.inbound.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}
