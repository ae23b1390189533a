//! Transport-agnostic datagram medium

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use snapshare_core::ShareResult;

use crate::{start_receive_loop, MemoryLink, MemoryPort, UdpTransport};

/// Inbound datagrams with their source address
pub type PacketReceiver = mpsc::Receiver<(Bytes, SocketAddr)>;

/// A medium a node can run on
pub enum Medium {
    Udp(UdpTransport),
    Memory(MemoryPort),
}

impl Medium {
    /// Split into a sender, a receiver and the guard owning the receive side
    pub fn into_parts(self, buffer_size: usize) -> (MediumSender, PacketReceiver, MediumGuard) {
        match self {
            Medium::Udp(transport) => {
                let (rx, task) = start_receive_loop(transport.socket(), buffer_size);
                let guard = MediumGuard {
                    task: Some(task),
                    port: None,
                };
                (MediumSender::Udp(transport), rx, guard)
            }
            Medium::Memory(port) => {
                let (link, rx) = port.split();
                let guard = MediumGuard {
                    task: None,
                    port: Some(link.clone()),
                };
                (MediumSender::Memory(link), rx, guard)
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Medium::Udp(t) => t.local_addr(),
            Medium::Memory(p) => p.local_addr(),
        }
    }
}

/// Sending half of a medium
#[derive(Clone)]
pub enum MediumSender {
    Udp(UdpTransport),
    Memory(MemoryLink),
}

impl MediumSender {
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            MediumSender::Udp(t) => t.local_addr(),
            MediumSender::Memory(l) => l.local_addr(),
        }
    }

    pub async fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> ShareResult<()> {
        match self {
            MediumSender::Udp(t) => t.send_to(bytes, dest).await,
            MediumSender::Memory(l) => l.send_to(bytes, dest),
        }
    }

    /// Send to the whole broadcast domain
    pub async fn broadcast(&self, bytes: &[u8]) -> ShareResult<()> {
        match self {
            MediumSender::Udp(t) => t.broadcast(bytes).await,
            MediumSender::Memory(l) => l.broadcast(bytes),
        }
    }
}

/// Owns background receive work and any memory port; dropping it stops
/// receiving and detaches the port from its network
pub struct MediumGuard {
    task: Option<JoinHandle<()>>,
    port: Option<MemoryLink>,
}

impl MediumGuard {
    /// Stop the receive task and wait until it is gone
    pub async fn close(mut self) {
        self.release_port();
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    fn release_port(&mut self) {
        if let Some(port) = self.port.take() {
            port.detach();
        }
    }
}

impl Drop for MediumGuard {
    fn drop(&mut self) {
        self.release_port();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
