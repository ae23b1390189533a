//! UDP transport

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use snapshare_core::{ShareError, ShareResult};
use snapshare_wire::MAX_DATAGRAM_SIZE;

use crate::{Medium, PacketReceiver};

/// Default port for discovery and link traffic
pub const DEFAULT_PORT: u16 = 47800;

/// UDP configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Local address to bind
    pub bind_addr: SocketAddr,
    /// Where beacons and probes are sent
    pub discovery_targets: Vec<SocketAddr>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            discovery_targets: vec![SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::BROADCAST,
                DEFAULT_PORT,
            ))],
        }
    }
}

fn unavailable(e: std::io::Error) -> ShareError {
    ShareError::TransportUnavailable(e.to_string())
}

/// UDP transport for snapshare; cheap to clone
#[derive(Clone, Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    targets: Arc<[SocketAddr]>,
}

impl UdpTransport {
    /// Bind and enable broadcast
    pub async fn bind(config: &UdpConfig) -> ShareResult<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await.map_err(unavailable)?;
        socket.set_broadcast(true).map_err(unavailable)?;
        let local_addr = socket.local_addr().map_err(unavailable)?;

        tracing::debug!(%local_addr, targets = ?config.discovery_targets, "UDP transport bound");

        Ok(UdpTransport {
            socket: Arc::new(socket),
            local_addr,
            targets: config.discovery_targets.clone().into(),
        })
    }

    /// Get local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn discovery_targets(&self) -> &[SocketAddr] {
        &self.targets
    }

    /// Send raw bytes to a destination
    pub async fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> ShareResult<()> {
        self.socket.send_to(bytes, dest).await.map_err(unavailable)?;
        Ok(())
    }

    /// Send to every discovery target. Fails only if no target could be reached.
    pub async fn broadcast(&self, bytes: &[u8]) -> ShareResult<()> {
        let mut last_error = None;
        let mut delivered = 0usize;

        for target in self.targets.iter() {
            match self.socket.send_to(bytes, *target).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    tracing::debug!(%target, error = %e, "Broadcast send failed");
                    last_error = Some(e);
                }
            }
        }

        match (delivered, last_error) {
            (0, Some(e)) => Err(unavailable(e)),
            (0, None) => Err(ShareError::TransportUnavailable(
                "No discovery targets configured".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Get a clone of the socket for concurrent operations
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    pub fn into_medium(self) -> Medium {
        Medium::Udp(self)
    }
}

/// Start a background receive loop
pub fn start_receive_loop(
    socket: Arc<UdpSocket>,
    buffer_size: usize,
) -> (PacketReceiver, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));

    let handle = tokio::spawn(async move {
        // One spare byte reveals oversize datagrams
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, _)) if len > MAX_DATAGRAM_SIZE => {
                    tracing::debug!(len, "Oversize datagram dropped");
                }
                Ok((len, addr)) => {
                    let packet = Bytes::copy_from_slice(&buf[..len]);
                    if tx.send((packet, addr)).await.is_err() {
                        break; // Receiver dropped
                    }
                }
                Err(e) => {
                    tracing::warn!("UDP receive error: {}", e);
                }
            }
        }
    });

    (rx, handle)
}
