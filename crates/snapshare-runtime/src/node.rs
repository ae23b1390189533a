//! snapshare Node - Driver loop implementation
//!
//! One driver task per node owns the medium, every link and the session
//! manager. It serializes inbound datagrams, API commands and timer ticks,
//! so per-peer transitions are applied exactly in the order observed.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use snapshare_core::{
    DisconnectReason, LinkChange, Payload, PeerIdentity, PeerToken, Reliability, ShareError,
    ShareResult,
};
use snapshare_crypto::{identity, HandshakeKeys, Role, Transcript};
use snapshare_transport::{
    Medium, MediumGuard, MediumSender, PacketReceiver, UdpConfig, UdpTransport,
};
use snapshare_wire::{
    Accept, Beacon, CipherSuite, DataFrame, Datagram, Invite, LinkMessage, Packet, Probe, Reject,
    Sealed,
};

use crate::advertiser::{AdvertiseHandle, Advertiser};
use crate::browser::{BrowseEvent, BrowseStream, Browser, DiscoveredPeer};
use crate::config::validate_service_tag;
use crate::events::{EventStream, Subscribers};
use crate::link::{Link, Phase};
use crate::reliable::{SendId, SenderPoll};
use crate::{BroadcastChannel, Inbound, NodeConfig, Session, SessionManager};

/// Requests from node handles to the driver
pub(crate) enum Command {
    Send {
        payload: Payload,
        targets: Vec<PeerIdentity>,
        reply: oneshot::Sender<ShareResult<()>>,
    },
    StartAdvertising {
        service_tag: String,
        reply: oneshot::Sender<ShareResult<AdvertiseHandle>>,
    },
    StopAdvertising {
        handle: AdvertiseHandle,
        reply: oneshot::Sender<()>,
    },
    Browse {
        service_tag: String,
        reply: oneshot::Sender<ShareResult<EventStream<BrowseEvent>>>,
    },
    Invite {
        peer: DiscoveredPeer,
    },
    Shutdown,
}

/// A device participating in one session
pub struct Node {
    identity: PeerIdentity,
    session: Session,
    channel: BroadcastChannel,
    commands: mpsc::Sender<Command>,
    advertised: Arc<RwLock<Option<String>>>,
    local_addr: SocketAddr,
    driver: Option<JoinHandle<()>>,
}

impl Node {
    /// Bind a UDP socket and start a node on it.
    ///
    /// The identity comes from `config.device_name` when set, otherwise the
    /// process-wide [`identity::current`].
    pub async fn bind_udp(config: NodeConfig, udp: &UdpConfig) -> ShareResult<Node> {
        let identity = match &config.device_name {
            Some(name) => identity::generate(name),
            None => identity::current(),
        };
        let transport = UdpTransport::bind(udp).await?;
        Node::with_medium(config, identity, transport.into_medium())
    }

    /// Start a node on any medium. Must be called inside a Tokio runtime.
    pub fn with_medium(
        config: NodeConfig,
        identity: PeerIdentity,
        medium: Medium,
    ) -> ShareResult<Node> {
        config.validate()?;

        let local_addr = medium.local_addr();
        let (sender, packets, guard) = medium.into_parts(config.packet_buffer);
        let manager = SessionManager::new(identity.clone());
        let session = manager.session().clone();
        let inbound = Arc::new(Subscribers::new());
        let advertised = Arc::new(RwLock::new(None));
        let (commands, command_rx) = mpsc::channel(config.packet_buffer);

        let channel = BroadcastChannel::new(
            commands.clone(),
            session.clone(),
            Arc::clone(&inbound),
            config.max_payload_size,
        );

        tracing::info!(peer = %identity, token = %identity.token(), %local_addr, "Node started");

        let driver = Driver {
            local: identity.clone(),
            advertiser: Advertiser::new(config.advertise_interval),
            browser: Browser::new(config.advertise_interval),
            config,
            medium: sender,
            packets,
            commands: command_rx,
            manager,
            links: HashMap::new(),
            pending: HashMap::new(),
            next_send_id: 1,
            inbound,
            advertised: Arc::clone(&advertised),
        };
        let handle = tokio::spawn(driver.run(guard));

        Ok(Node {
            identity,
            session,
            channel,
            commands,
            advertised,
            local_addr,
            driver: Some(handle),
        })
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Handle for sending and receiving payloads
    pub fn broadcast(&self) -> BroadcastChannel {
        self.channel.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Advertise under `service_tag`, auto-accepting invitations for it.
    ///
    /// Restarts the advertisement if one is active. Fails with
    /// [`ShareError::TransportUnavailable`] if the first beacon cannot be sent.
    pub async fn start_advertising(&self, service_tag: &str) -> ShareResult<AdvertiseHandle> {
        validate_service_tag(service_tag)?;
        let (reply, rx) = oneshot::channel();
        self.command(Command::StartAdvertising {
            service_tag: service_tag.to_owned(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ShareError::SessionClosed)?
    }

    /// Stop advertising; established links are unaffected
    pub async fn stop_advertising(&self, handle: &AdvertiseHandle) -> ShareResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::StopAdvertising {
            handle: handle.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ShareError::SessionClosed)
    }

    /// Tag currently advertised, if any
    pub fn advertised_tag(&self) -> Option<String> {
        self.advertised.read().clone()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertised.read().is_some()
    }

    /// Browse for peers advertising `service_tag`. Dropping the stream stops browsing.
    pub async fn start_browsing(&self, service_tag: &str) -> ShareResult<BrowseStream> {
        validate_service_tag(service_tag)?;
        let (reply, rx) = oneshot::channel();
        self.command(Command::Browse {
            service_tag: service_tag.to_owned(),
            reply,
        })
        .await?;
        let events = rx.await.map_err(|_| ShareError::SessionClosed)??;
        Ok(BrowseStream::new(service_tag.to_owned(), events))
    }

    /// Invite a discovered peer. The outcome shows up as session events.
    pub async fn invite(&self, peer: &DiscoveredPeer) -> ShareResult<()> {
        self.command(Command::Invite { peer: peer.clone() }).await
    }

    /// Tear the session down: every peer ends `disconnected`, outstanding
    /// sends fail and all streams end before this returns.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                tracing::warn!("Driver task failed: {}", e);
            }
        }
    }

    async fn command(&self, command: Command) -> ShareResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ShareError::SessionClosed)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// One reliable send across its targets
struct PendingSend {
    remaining: HashSet<PeerToken>,
    failed: Vec<PeerIdentity>,
    reply: oneshot::Sender<ShareResult<()>>,
}

struct Driver {
    local: PeerIdentity,
    config: NodeConfig,
    medium: MediumSender,
    packets: PacketReceiver,
    commands: mpsc::Receiver<Command>,
    manager: SessionManager,
    advertiser: Advertiser,
    browser: Browser,
    links: HashMap<PeerToken, Link>,
    pending: HashMap<SendId, PendingSend>,
    next_send_id: SendId,
    inbound: Arc<Subscribers<Inbound>>,
    advertised: Arc<RwLock<Option<String>>>,
}

impl Driver {
    async fn run(mut self, guard: MediumGuard) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut packets_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                packet = self.packets.recv(), if packets_open => match packet {
                    Some((bytes, addr)) => self.handle_datagram(bytes, addr).await,
                    None => {
                        tracing::warn!("Medium closed; no more inbound traffic");
                        packets_open = false;
                    }
                },
                _ = ticker.tick() => self.on_tick(Instant::now()).await,
            }
        }

        self.teardown().await;
        guard.close().await;
        tracing::info!(peer = %self.local, "Node stopped");
    }

    fn token(&self) -> PeerToken {
        self.local.token()
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                payload,
                targets,
                reply,
            } => self.send(payload, targets, reply).await,
            Command::StartAdvertising { service_tag, reply } => {
                let _ = reply.send(self.start_advertising(&service_tag).await);
            }
            Command::StopAdvertising { handle, reply } => {
                if let Some(tag) = self.advertiser.stop(&handle) {
                    self.withdraw_beacon(&tag).await;
                    *self.advertised.write() = None;
                    tracing::info!(tag = %tag, "Advertising stopped");
                }
                let _ = reply.send(());
            }
            Command::Browse { service_tag, reply } => {
                let _ = reply.send(self.start_browsing(&service_tag).await);
            }
            Command::Invite { peer } => self.invite(peer).await,
            // Handled by the run loop
            Command::Shutdown => {}
        }
    }

    async fn start_advertising(&mut self, service_tag: &str) -> ShareResult<AdvertiseHandle> {
        let previous = self.advertiser.active_tag().map(str::to_owned);
        let announce = Beacon::announce(service_tag, self.local.display_name());
        let beacon = self.encode(Packet::Beacon(announce))?;
        if let Err(e) = self.medium.broadcast(&beacon).await {
            tracing::warn!(tag = service_tag, error = %e, "Cannot advertise");
            return Err(e);
        }

        if let Some(old) = previous.filter(|old| old != service_tag) {
            self.withdraw_beacon(&old).await;
        }
        let now = Instant::now();
        let handle = self.advertiser.start(service_tag, now);
        // The beacon above counts as the first one
        let _ = self.advertiser.due(now);
        *self.advertised.write() = Some(service_tag.to_owned());
        tracing::info!(tag = service_tag, "Advertising started");
        Ok(handle)
    }

    async fn start_browsing(&mut self, service_tag: &str) -> ShareResult<EventStream<BrowseEvent>> {
        let (events, created) = self.browser.subscribe(service_tag, Instant::now());
        if created {
            let probe = self.encode(Packet::Probe(Probe::new(service_tag)))?;
            if let Err(e) = self.medium.broadcast(&probe).await {
                tracing::warn!(tag = service_tag, error = %e, "Cannot browse");
                self.browser.remove_scope(service_tag);
                return Err(e);
            }
            tracing::info!(tag = service_tag, "Browsing started");
        }
        Ok(events)
    }

    async fn invite(&mut self, peer: DiscoveredPeer) {
        let token = peer.identity.token();
        if token == self.token() {
            return;
        }
        if self.links.contains_key(&token) {
            tracing::debug!(peer = %peer.identity, "Already linked; invite ignored");
            return;
        }

        let keys = HandshakeKeys::generate();
        let invite = match self.encode(Packet::Invite(Invite {
            service_tag: peer.service_tag.clone(),
            display_name: self.local.display_name().to_owned(),
            suite: CipherSuite::default(),
            public_key: keys.public_bytes(),
        })) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(peer = %peer.identity, error = %e, "Cannot encode invite");
                return;
            }
        };

        self.manager
            .on_link_state_changed(&peer.identity, LinkChange::Connecting);
        if let Err(e) = self.medium.send_to(&invite, peer.addr).await {
            // Retransmission keeps trying until the handshake times out
            tracing::debug!(peer = %peer.identity, error = %e, "Invite send failed");
        }
        let link = Link::inviting(
            peer.identity,
            peer.addr,
            keys,
            peer.service_tag,
            invite,
            &self.config,
        );
        self.links.insert(token, link);
    }

    async fn send(
        &mut self,
        payload: Payload,
        targets: Vec<PeerIdentity>,
        reply: oneshot::Sender<ShareResult<()>>,
    ) {
        let reliability = payload.reliability();
        let bytes = payload.into_bytes();

        if reliability == Reliability::BestEffort {
            for target in &targets {
                self.send_best_effort(target.token(), &bytes).await;
            }
            let _ = reply.send(Ok(()));
            return;
        }

        let send_id = self.next_send_id;
        self.next_send_id += 1;
        let mut pending = PendingSend {
            remaining: HashSet::new(),
            failed: Vec::new(),
            reply,
        };

        for target in targets {
            match self.links.get_mut(&target.token()) {
                Some(link) if link.is_established() => {
                    link.tx.push(send_id, &bytes);
                    pending.remaining.insert(target.token());
                }
                _ => {
                    tracing::debug!(peer = %target, "Target not connected");
                    pending.failed.push(target);
                }
            }
        }

        let tokens: Vec<PeerToken> = pending.remaining.iter().copied().collect();
        self.pending.insert(send_id, pending);
        self.finish_if_done(send_id);
        for token in tokens {
            self.flush(token, Instant::now()).await;
        }
    }

    async fn send_best_effort(&mut self, token: PeerToken, bytes: &Bytes) {
        let local = self.token();
        let Some(link) = self.links.get_mut(&token) else {
            return;
        };
        if !link.is_established() {
            return;
        }
        for frame in link.best_effort_frames(bytes) {
            match link.seal(local, &LinkMessage::Data(frame)) {
                Ok(datagram) => {
                    if let Err(e) = self.medium.send_to(&datagram, link.addr).await {
                        tracing::debug!(
                            peer = %link.identity,
                            error = %e,
                            "Best-effort send failed"
                        );
                    }
                }
                Err(e) => tracing::debug!(peer = %link.identity, error = %e, "Seal failed"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound datagrams
    // ------------------------------------------------------------------

    async fn handle_datagram(&mut self, bytes: Bytes, addr: SocketAddr) {
        let datagram = match Datagram::decode(bytes) {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!(%addr, error = %e, "Malformed datagram dropped");
                return;
            }
        };

        let from = datagram.sender();
        if from == self.token() {
            return;
        }

        match datagram.packet {
            Packet::Beacon(beacon) => self.on_beacon(from, beacon, addr),
            Packet::Probe(probe) => self.on_probe(probe, addr).await,
            Packet::Invite(invite) => self.on_invite(from, invite, addr).await,
            Packet::Accept(accept) => self.on_accept(from, accept, addr).await,
            Packet::Reject(reject) => self.on_reject(from, reject),
            Packet::Sealed(sealed) => self.on_sealed(from, sealed, addr).await,
        }
    }

    fn on_beacon(&mut self, from: PeerToken, beacon: Beacon, addr: SocketAddr) {
        if beacon.is_withdraw() {
            self.browser.withdraw(&beacon.service_tag, from);
        } else if self.browser.is_browsing(&beacon.service_tag) {
            let identity = PeerIdentity::new(from, &beacon.display_name);
            self.browser
                .observe(&beacon.service_tag, identity, addr, Instant::now());
        }
    }

    async fn on_probe(&mut self, probe: Probe, addr: SocketAddr) {
        if !self.advertiser.accepts(&probe.service_tag) {
            return;
        }
        let beacon =
            Packet::Beacon(Beacon::announce(&probe.service_tag, self.local.display_name()));
        if let Ok(bytes) = self.encode(beacon) {
            if let Err(e) = self.medium.send_to(&bytes, addr).await {
                tracing::debug!(%addr, error = %e, "Probe answer failed");
            }
        }
    }

    async fn on_invite(&mut self, from: PeerToken, invite: Invite, addr: SocketAddr) {
        if !self.advertiser.accepts(&invite.service_tag) {
            tracing::debug!(tag = %invite.service_tag, "Invite for a tag we do not advertise");
            return;
        }

        let mut announce = true;
        if let Some(link) = self.links.get(&from) {
            match (&link.phase, link.remote_key) {
                (Phase::Inviting { .. }, _) => {
                    // Both sides invited; the smaller token stays inviter
                    if self.token() < from {
                        tracing::debug!(
                            peer = %link.identity,
                            "Simultaneous invite; keeping inviter role"
                        );
                        return;
                    }
                    tracing::debug!(
                        peer = %link.identity,
                        "Simultaneous invite; switching to acceptor"
                    );
                    self.links.remove(&from);
                    announce = false;
                }
                (_, Some(key)) if key == invite.public_key => {
                    // Retransmitted invite: our Accept was lost
                    let resend = link.handshake_packet.clone().map(|packet| (packet, link.addr));
                    if let Some((packet, to)) = resend {
                        if let Err(e) = self.medium.send_to(&packet, to).await {
                            tracing::debug!(error = %e, "Accept resend failed");
                        }
                    }
                    return;
                }
                _ => {
                    tracing::info!(peer = %link.identity, "Peer restarted; replacing connection");
                    self.close_link(from, DisconnectReason::RemoteClosed);
                }
            }
        }

        let identity = PeerIdentity::new(from, &invite.display_name);
        if announce {
            self.manager
                .on_link_state_changed(&identity, LinkChange::Connecting);
        }

        if !invite.suite.is_encrypted() {
            tracing::warn!(peer = %identity, suite = ?invite.suite, "Unencrypted invite refused");
            self.refuse(&identity, addr).await;
            return;
        }

        let keys = HandshakeKeys::generate();
        let local_key = keys.public_bytes();
        let transcript = Transcript {
            service_tag: &invite.service_tag,
            inviter: from,
            acceptor: self.token(),
            inviter_key: invite.public_key,
            acceptor_key: local_key,
        };
        let link_keys = match keys.complete(invite.public_key, &transcript, Role::Acceptor) {
            Ok(k) => k,
            Err(_) => {
                self.refuse(&identity, addr).await;
                return;
            }
        };

        let accept = match self.encode(Packet::Accept(Accept {
            display_name: self.local.display_name().to_owned(),
            suite: CipherSuite::default(),
            public_key: local_key,
        })) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot encode accept");
                self.manager.on_link_state_changed(
                    &identity,
                    LinkChange::Disconnected(DisconnectReason::Rejected),
                );
                return;
            }
        };

        if let Err(e) = self.medium.send_to(&accept, addr).await {
            tracing::debug!(peer = %identity, error = %e, "Accept send failed");
        }
        let link = Link::accepting(
            identity,
            addr,
            invite.public_key,
            &link_keys,
            accept,
            &self.config,
        );
        self.links.insert(from, link);
    }

    async fn on_accept(&mut self, from: PeerToken, accept: Accept, addr: SocketAddr) {
        let local = self.token();
        let Some(link) = self.links.get_mut(&from) else {
            tracing::debug!(%addr, "Unsolicited accept dropped");
            return;
        };

        let (keys, service_tag) = match std::mem::replace(&mut link.phase, Phase::Confirming) {
            Phase::Inviting { keys, service_tag } => (keys, service_tag),
            other => {
                // Duplicate accept
                link.phase = other;
                return;
            }
        };

        if !accept.suite.is_encrypted() {
            tracing::warn!(peer = %link.identity, "Unencrypted accept refused");
            let identity = link.identity.clone();
            self.links.remove(&from);
            self.refuse(&identity, addr).await;
            return;
        }

        let transcript = Transcript {
            service_tag: &service_tag,
            inviter: local,
            acceptor: from,
            inviter_key: keys.public_bytes(),
            acceptor_key: accept.public_key,
        };
        match keys.complete(accept.public_key, &transcript, Role::Inviter) {
            Ok(link_keys) => {
                link.addr = addr;
                link.confirming(accept.public_key, &link_keys);
                self.send_sealed(from, LinkMessage::Confirm).await;
            }
            Err(_) => {
                let identity = link.identity.clone();
                self.links.remove(&from);
                self.refuse(&identity, addr).await;
            }
        }
    }

    fn on_reject(&mut self, from: PeerToken, reject: Reject) {
        if !self.links.contains_key(&from) {
            return;
        }
        let reason = match reject.reason {
            DisconnectReason::EncryptionRequired => DisconnectReason::EncryptionRequired,
            _ => DisconnectReason::Rejected,
        };
        self.close_link(from, reason);
    }

    async fn on_sealed(&mut self, from: PeerToken, sealed: Sealed, addr: SocketAddr) {
        let Some(link) = self.links.get_mut(&from) else {
            tracing::debug!(%addr, "Sealed packet from unknown peer dropped");
            return;
        };
        if !link.has_cipher() {
            return;
        }

        let message = match link.open(&sealed) {
            Ok(m) => m,
            Err(ShareError::DecryptionFailed) if !link.is_established() => {
                tracing::warn!(peer = %link.identity, "Handshake failed authentication");
                let identity = link.identity.clone();
                self.links.remove(&from);
                self.refuse(&identity, addr).await;
                return;
            }
            Err(e) => {
                tracing::debug!(peer = %link.identity, error = %e, "Sealed packet dropped");
                return;
            }
        };

        link.last_heard = Instant::now();
        link.addr = addr;
        if !link.is_established() {
            link.establish();
            let identity = link.identity.clone();
            self.manager
                .on_link_state_changed(&identity, LinkChange::Connected);
        }

        match message {
            LinkMessage::Confirm => {
                if self.links.get(&from).is_some_and(|l| l.role == Role::Acceptor) {
                    self.send_sealed(from, LinkMessage::Confirm).await;
                }
            }
            LinkMessage::Data(frame) => self.on_data(from, frame).await,
            LinkMessage::Ack { seq } => {
                let completed = self.links.get_mut(&from).and_then(|l| l.tx.on_ack(seq));
                if let Some(send_id) = completed {
                    self.complete_target(send_id, from);
                }
                self.flush(from, Instant::now()).await;
            }
            LinkMessage::Ping => {}
            LinkMessage::Bye => self.close_link(from, DisconnectReason::RemoteClosed),
        }
    }

    async fn on_data(&mut self, from: PeerToken, frame: DataFrame) {
        let Some(link) = self.links.get_mut(&from) else {
            return;
        };
        let identity = link.identity.clone();

        match frame.channel {
            Reliability::Reliable => {
                let seq = frame.seq;
                let received = link.rx.on_frame(frame);
                if received.ack {
                    self.send_sealed(from, LinkMessage::Ack { seq }).await;
                }
                for message in received.messages {
                    self.deliver(&identity, message, Reliability::Reliable);
                }
            }
            Reliability::BestEffort => {
                if let Some(message) = link.partial.push(frame) {
                    self.deliver(&identity, message, Reliability::BestEffort);
                }
            }
        }
    }

    fn deliver(&self, from: &PeerIdentity, bytes: Bytes, reliability: Reliability) {
        tracing::debug!(peer = %from, len = bytes.len(), ?reliability, "Payload received");
        self.inbound.publish(Inbound {
            from: from.clone(),
            payload: Payload::received(bytes, from.clone(), reliability),
        });
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    async fn on_tick(&mut self, now: Instant) {
        if let Some(tag) = self.advertiser.due(now) {
            let beacon = Packet::Beacon(Beacon::announce(&tag, self.local.display_name()));
            self.broadcast_packet(beacon).await;
        }

        self.browser.prune();
        for tag in self.browser.probes_due(now) {
            self.broadcast_packet(Packet::Probe(Probe::new(&tag))).await;
        }
        self.browser.expire(now, self.config.peer_ttl);

        let tokens: Vec<PeerToken> = self.links.keys().copied().collect();
        for token in tokens {
            self.service_link(token, now).await;
        }
    }

    async fn service_link(&mut self, token: PeerToken, now: Instant) {
        let local = self.token();
        let Some(link) = self.links.get_mut(&token) else {
            return;
        };

        if !link.is_established() {
            if now.duration_since(link.last_attempt) < self.config.retry_interval {
                return;
            }
            if link.attempts >= self.config.handshake_retries {
                tracing::info!(peer = %link.identity, "Handshake timed out");
                self.close_link(token, DisconnectReason::HandshakeTimeout);
                return;
            }
            link.attempts += 1;
            link.last_attempt = now;
            let packet = match link.phase {
                Phase::Confirming => link.seal(local, &LinkMessage::Confirm).ok(),
                _ => link.handshake_packet.clone(),
            };
            if let Some(packet) = packet {
                if let Err(e) = self.medium.send_to(&packet, link.addr).await {
                    tracing::debug!(peer = %link.identity, error = %e, "Handshake resend failed");
                }
            }
            return;
        }

        if now.duration_since(link.last_heard) >= self.config.link_timeout {
            tracing::info!(peer = %link.identity, "Link went silent");
            self.close_link(token, DisconnectReason::LinkLost);
            return;
        }

        self.flush(token, now).await;

        let Some(link) = self.links.get_mut(&token) else {
            return;
        };
        if now.duration_since(link.last_sent) >= self.config.keepalive_interval {
            self.send_sealed(token, LinkMessage::Ping).await;
        }
    }

    /// Transmit whatever the link's reliable sender has due
    async fn flush(&mut self, token: PeerToken, now: Instant) {
        let local = self.token();
        let Some(link) = self.links.get_mut(&token) else {
            return;
        };
        if !link.is_established() {
            return;
        }

        let frames = match link.tx.poll(now) {
            SenderPoll::Frames(frames) => frames,
            SenderPoll::Exhausted => {
                tracing::warn!(peer = %link.identity, "Reliable retries exhausted");
                self.close_link(token, DisconnectReason::LinkLost);
                return;
            }
        };

        for frame in frames {
            match link.seal(local, &LinkMessage::Data(frame)) {
                Ok(datagram) => {
                    if let Err(e) = self.medium.send_to(&datagram, link.addr).await {
                        tracing::debug!(peer = %link.identity, error = %e, "Data send failed");
                    }
                }
                Err(e) => tracing::debug!(peer = %link.identity, error = %e, "Seal failed"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn encode(&self, packet: Packet) -> ShareResult<Bytes> {
        Datagram::new(self.token(), packet).encode()
    }

    async fn broadcast_packet(&mut self, packet: Packet) {
        match self.encode(packet) {
            Ok(bytes) => {
                if let Err(e) = self.medium.broadcast(&bytes).await {
                    tracing::debug!(error = %e, "Broadcast failed");
                }
            }
            Err(e) => tracing::debug!(error = %e, "Cannot encode broadcast"),
        }
    }

    async fn withdraw_beacon(&mut self, service_tag: &str) {
        let beacon = Beacon::withdraw(service_tag, self.local.display_name());
        self.broadcast_packet(Packet::Beacon(beacon)).await;
    }

    async fn send_sealed(&mut self, token: PeerToken, message: LinkMessage) {
        let local = self.token();
        let Some(link) = self.links.get_mut(&token) else {
            return;
        };
        match link.seal(local, &message) {
            Ok(datagram) => {
                if let Err(e) = self.medium.send_to(&datagram, link.addr).await {
                    tracing::debug!(peer = %link.identity, error = %e, "Sealed send failed");
                }
            }
            Err(e) => tracing::debug!(peer = %link.identity, error = %e, "Seal failed"),
        }
    }

    /// Refuse a peer that cannot meet the encryption policy
    async fn refuse(&mut self, identity: &PeerIdentity, addr: SocketAddr) {
        let packet = Packet::Reject(Reject::new(DisconnectReason::EncryptionRequired));
        if let Ok(reject) = self.encode(packet) {
            if let Err(e) = self.medium.send_to(&reject, addr).await {
                tracing::debug!(peer = %identity, error = %e, "Reject send failed");
            }
        }
        self.manager.on_link_state_changed(
            identity,
            LinkChange::Disconnected(DisconnectReason::EncryptionRequired),
        );
    }

    /// Drop a link, failing its outstanding sends
    fn close_link(&mut self, token: PeerToken, reason: DisconnectReason) {
        let Some(mut link) = self.links.remove(&token) else {
            return;
        };
        for send_id in link.tx.drain() {
            self.fail_target(send_id, &link.identity);
        }
        self.manager
            .on_link_state_changed(&link.identity, LinkChange::Disconnected(reason));
    }

    fn complete_target(&mut self, send_id: SendId, token: PeerToken) {
        if let Some(pending) = self.pending.get_mut(&send_id) {
            pending.remaining.remove(&token);
        }
        self.finish_if_done(send_id);
    }

    fn fail_target(&mut self, send_id: SendId, peer: &PeerIdentity) {
        if let Some(pending) = self.pending.get_mut(&send_id) {
            if pending.remaining.remove(&peer.token()) {
                pending.failed.push(peer.clone());
            }
        }
        self.finish_if_done(send_id);
    }

    fn finish_if_done(&mut self, send_id: SendId) {
        let done = self
            .pending
            .get(&send_id)
            .is_some_and(|p| p.remaining.is_empty());
        if !done {
            return;
        }
        let Some(pending) = self.pending.remove(&send_id) else {
            return;
        };

        let result = if pending.failed.is_empty() {
            Ok(())
        } else {
            let err = ShareError::DeliveryFailed {
                targets: pending.failed,
            };
            tracing::warn!(send_id, "{}", err);
            Err(err)
        };
        let _ = pending.reply.send(result);
    }

    async fn teardown(&mut self) {
        if let Some(tag) = self.advertiser.clear() {
            self.withdraw_beacon(&tag).await;
        }
        *self.advertised.write() = None;

        let tokens: Vec<PeerToken> = self.links.keys().copied().collect();
        for token in tokens {
            if self.links.get(&token).is_some_and(|l| l.has_cipher()) {
                self.send_sealed(token, LinkMessage::Bye).await;
            }
            self.close_link(token, DisconnectReason::LocalTeardown);
        }

        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(ShareError::SessionClosed));
        }

        self.manager.close();
        self.inbound.close();
        self.browser.close();
    }
}
