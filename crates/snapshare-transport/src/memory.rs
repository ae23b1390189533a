//! In-process broadcast domain
//!
//! Every attached port sees every broadcast, like hosts on one LAN segment.
//! Ports can be isolated (traffic silently dropped, a network drop) or
//! unplugged (sends fail, no usable interface).

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use snapshare_core::{ShareError, ShareResult};

use crate::{Medium, PacketReceiver, DEFAULT_PORT};

/// Queue depth of each memory port
pub const MEMORY_PORT_BUFFER: usize = 1024;

struct PortState {
    tx: mpsc::Sender<(Bytes, SocketAddr)>,
    isolated: bool,
    unplugged: bool,
    sent: usize,
}

#[derive(Default)]
struct NetworkInner {
    ports: HashMap<SocketAddr, PortState>,
    next_host: u32,
}

/// A simulated LAN segment
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new host with the next free address
    pub fn attach(&self) -> MemoryPort {
        let (tx, rx) = mpsc::channel(MEMORY_PORT_BUFFER);
        let mut inner = self.inner.lock();
        inner.next_host += 1;
        let host = inner.next_host;
        let addr = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(10, 0, (host >> 8) as u8, host as u8),
            DEFAULT_PORT,
        ));
        inner.ports.insert(
            addr,
            PortState {
                tx,
                isolated: false,
                unplugged: false,
                sent: 0,
            },
        );

        MemoryPort {
            link: MemoryLink {
                addr,
                network: self.clone(),
            },
            rx,
        }
    }

    /// Drop all traffic to and from `addr`
    pub fn isolate(&self, addr: SocketAddr) {
        self.update(addr, |p| p.isolated = true);
    }

    pub fn restore(&self, addr: SocketAddr) {
        self.update(addr, |p| p.isolated = false);
    }

    /// Make sends from `addr` fail as if the interface went away
    pub fn unplug(&self, addr: SocketAddr) {
        self.update(addr, |p| p.unplugged = true);
    }

    pub fn plug(&self, addr: SocketAddr) {
        self.update(addr, |p| p.unplugged = false);
    }

    /// Datagrams sent from `addr` so far, delivered or not
    pub fn sent_from(&self, addr: SocketAddr) -> usize {
        self.inner.lock().ports.get(&addr).map_or(0, |p| p.sent)
    }

    pub fn detach(&self, addr: SocketAddr) {
        self.inner.lock().ports.remove(&addr);
    }

    /// Ports currently attached
    pub fn port_count(&self) -> usize {
        self.inner.lock().ports.len()
    }

    fn update(&self, addr: SocketAddr, f: impl FnOnce(&mut PortState)) {
        if let Some(port) = self.inner.lock().ports.get_mut(&addr) {
            f(port);
        }
    }

    fn deliver(&self, from: SocketAddr, dest: Option<SocketAddr>, bytes: &[u8]) -> ShareResult<()> {
        let mut inner = self.inner.lock();
        let source = inner
            .ports
            .get_mut(&from)
            .ok_or_else(|| ShareError::TransportUnavailable(format!("{} is detached", from)))?;
        if source.unplugged {
            return Err(ShareError::TransportUnavailable(format!(
                "{} has no usable interface",
                from
            )));
        }
        source.sent += 1;
        if source.isolated {
            return Ok(());
        }

        let packet = Bytes::copy_from_slice(bytes);
        let receivers = inner
            .ports
            .iter()
            .filter(|(addr, port)| {
                **addr != from && !port.isolated && dest.map_or(true, |d| d == **addr)
            });
        for (_, port) in receivers {
            // A full or closed queue loses the datagram, as UDP would
            let _ = port.tx.try_send((packet.clone(), from));
        }
        Ok(())
    }
}

/// Sending half of a memory port
#[derive(Clone)]
pub struct MemoryLink {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl MemoryLink {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> ShareResult<()> {
        self.network.deliver(self.addr, Some(dest), bytes)
    }

    pub fn broadcast(&self, bytes: &[u8]) -> ShareResult<()> {
        self.network.deliver(self.addr, None, bytes)
    }

    /// Leave the network; later sends fail
    pub fn detach(&self) {
        self.network.detach(self.addr);
    }
}

/// One host attached to a [`MemoryNetwork`]
pub struct MemoryPort {
    link: MemoryLink,
    rx: PacketReceiver,
}

impl MemoryPort {
    pub fn local_addr(&self) -> SocketAddr {
        self.link.addr
    }

    pub fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> ShareResult<()> {
        self.link.send_to(bytes, dest)
    }

    pub fn broadcast(&self, bytes: &[u8]) -> ShareResult<()> {
        self.link.broadcast(bytes)
    }

    pub async fn recv(&mut self) -> Option<(Bytes, SocketAddr)> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<(Bytes, SocketAddr)> {
        self.rx.try_recv().ok()
    }

    pub fn into_medium(self) -> Medium {
        Medium::Memory(self)
    }

    pub(crate) fn split(self) -> (MemoryLink, PacketReceiver) {
        (self.link, self.rx)
    }
}
