//! In-memory cluster harness
//!
//! Nodes run their real driver over a [`MemoryNetwork`], with timers shrunk
//! so that discovery, handshakes and failure detection finish in well under
//! a second.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use snapshare_core::{
    DisconnectReason, Image, PeerIdentity, PeerToken, SessionEvent, ShareError, ShareResult,
};
use snapshare_crypto::identity;
use snapshare_runtime::{BrowseEvent, DiscoveredPeer, EventStream, Inbound, Node, NodeConfig};
use snapshare_transport::{MemoryNetwork, MemoryPort};
use snapshare_wire::{Datagram, Packet};

/// Service tag shared by every harness node
pub const TEST_TAG: &str = "snapshare-test";

/// Upper bound on any single wait
pub const WAIT: Duration = Duration::from_secs(5);

/// Timers tuned for the in-memory network
pub fn fast_config() -> NodeConfig {
    NodeConfig {
        service_tag: TEST_TAG.to_string(),
        tick_interval: Duration::from_millis(5),
        advertise_interval: Duration::from_millis(50),
        peer_ttl: Duration::from_millis(300),
        retry_interval: Duration::from_millis(30),
        max_retries: 5,
        handshake_retries: 10,
        keepalive_interval: Duration::from_millis(50),
        link_timeout: Duration::from_millis(400),
        ..NodeConfig::default()
    }
}

/// Minimal PNG: signature plus an IHDR chunk header and dimensions
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(33);
    out.put_slice(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    out.put_u32(13);
    out.put_slice(b"IHDR");
    out.put_u32(width);
    out.put_u32(height);
    out.put_slice(&[8, 6, 0, 0, 0]);
    out.to_vec()
}

pub fn png_image(width: u32, height: u32) -> Image {
    match Image::decode(png(width, height)) {
        Ok(image) => image,
        Err(e) => panic!("harness PNG must decode: {}", e),
    }
}

/// A set of nodes sharing one simulated broadcast domain
pub struct Cluster {
    pub network: MemoryNetwork,
    pub config: NodeConfig,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: NodeConfig) -> Self {
        Cluster {
            network: MemoryNetwork::new(),
            config,
        }
    }

    /// Start a node named `name`. Must be called inside a Tokio runtime.
    pub fn spawn(&self, name: &str) -> ShareResult<TestNode> {
        let port = self.network.attach();
        let addr = port.local_addr();
        let node = Node::with_medium(
            self.config.clone(),
            identity::generate(name),
            port.into_medium(),
        )?;
        let events = node.session().subscribe();
        let inbound = node.broadcast().on_receive();
        Ok(TestNode {
            node,
            addr,
            events,
            inbound,
        })
    }

    /// Attach a bare port that speaks the wire format directly
    pub fn raw_peer(&self, name: &str) -> RawPeer {
        RawPeer {
            identity: identity::generate(name),
            port: self.network.attach(),
        }
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

/// A running node plus the streams the scenarios observe
pub struct TestNode {
    pub node: Node,
    pub addr: SocketAddr,
    pub events: EventStream<SessionEvent>,
    pub inbound: EventStream<Inbound>,
}

impl TestNode {
    pub fn identity(&self) -> &PeerIdentity {
        self.node.identity()
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        tokio::time::timeout(WAIT, self.events.recv()).await.ok().flatten()
    }

    /// Wait until `peer` joins; false on timeout or if it left first
    pub async fn wait_joined(&mut self, peer: &PeerIdentity) -> bool {
        while let Some(event) = self.next_event().await {
            match event {
                SessionEvent::PeerJoined(p) if &p == peer => return true,
                SessionEvent::PeerLeft { peer: p, .. } if &p == peer => return false,
                _ => {}
            }
        }
        false
    }

    /// Wait until `peer` leaves and return why
    pub async fn wait_left(&mut self, peer: &PeerIdentity) -> Option<DisconnectReason> {
        while let Some(event) = self.next_event().await {
            if let SessionEvent::PeerLeft { peer: p, reason, .. } = event {
                if &p == peer {
                    return Some(reason);
                }
            }
        }
        None
    }

    pub async fn next_inbound(&mut self) -> Option<Inbound> {
        tokio::time::timeout(WAIT, self.inbound.recv()).await.ok().flatten()
    }

    /// Browse until `peer` is found under `tag`
    pub async fn discover(&self, tag: &str, peer: PeerToken) -> ShareResult<DiscoveredPeer> {
        let mut stream = self.node.start_browsing(tag).await?;
        let found = tokio::time::timeout(WAIT, async {
            while let Some(event) = stream.next().await {
                if let BrowseEvent::Found(found) = event {
                    if found.identity.token() == peer {
                        return Some(found);
                    }
                }
            }
            None
        })
        .await;

        match found {
            Ok(Some(found)) => Ok(found),
            _ => Err(ShareError::TransportUnavailable(format!("peer {} not discovered", peer))),
        }
    }
}

/// Connect `guest` to `host`, advertising on the host if needed
pub async fn connect(host: &mut TestNode, guest: &mut TestNode) -> ShareResult<()> {
    if host.node.advertised_tag().as_deref() != Some(TEST_TAG) {
        host.node.start_advertising(TEST_TAG).await?;
    }
    let found = guest.discover(TEST_TAG, host.identity().token()).await?;
    guest.node.invite(&found).await?;

    let host_identity = host.identity().clone();
    let guest_identity = guest.identity().clone();
    if guest.wait_joined(&host_identity).await && host.wait_joined(&guest_identity).await {
        Ok(())
    } else {
        Err(ShareError::SessionClosed)
    }
}

/// A hand-driven peer for exercising the node's packet handling
pub struct RawPeer {
    pub identity: PeerIdentity,
    pub port: MemoryPort,
}

impl RawPeer {
    pub fn send(&self, packet: Packet, to: SocketAddr) -> ShareResult<()> {
        let bytes = Datagram::new(self.identity.token(), packet).encode()?;
        self.port.send_to(&bytes, to)
    }

    /// Next datagram of any kind other than discovery chatter
    pub async fn recv_handshake(&mut self) -> Option<Datagram> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let (bytes, _) = tokio::time::timeout_at(deadline, self.port.recv())
                .await
                .ok()
                .flatten()?;
            let datagram = match Datagram::decode(bytes) {
                Ok(d) => d,
                Err(_) => continue,
            };
            if !matches!(datagram.packet, Packet::Beacon(_) | Packet::Probe(_)) {
                return Some(datagram);
            }
        }
    }
}
