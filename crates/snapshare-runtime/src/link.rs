//! Per-peer link state owned by the node driver

use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use snapshare_core::{PeerIdentity, PeerToken, Reliability, ShareError, ShareResult};
use snapshare_crypto::{HandshakeKeys, LinkCipher, LinkKeys, Role};
use snapshare_wire::{
    split_chunks, DataFrame, Datagram, LinkMessage, Packet, Sealed, PUBLIC_KEY_SIZE,
};

use crate::reliable::{PartialMessages, ReliableReceiver, ReliableSender};
use crate::NodeConfig;

pub(crate) enum Phase {
    /// Invite sent, waiting for Accept
    Inviting {
        keys: HandshakeKeys,
        service_tag: String,
    },
    /// Accept sent, waiting for the inviter's first sealed message
    Accepting,
    /// Keys derived, Confirm sent, waiting for the acceptor's answer
    Confirming,
    Established,
}

pub(crate) struct Link {
    pub identity: PeerIdentity,
    pub addr: SocketAddr,
    pub role: Role,
    pub phase: Phase,
    /// Peer's ephemeral key once known; a different key means a restart
    pub remote_key: Option<[u8; PUBLIC_KEY_SIZE]>,
    cipher: Option<LinkCipher>,
    /// Plaintext Invite or Accept to retransmit
    pub handshake_packet: Option<Bytes>,
    pub attempts: u32,
    pub last_attempt: Instant,
    pub last_heard: Instant,
    pub last_sent: Instant,
    pub tx: ReliableSender,
    pub rx: ReliableReceiver,
    pub partial: PartialMessages,
    next_best_effort_id: u64,
}

impl Link {
    fn new(
        identity: PeerIdentity,
        addr: SocketAddr,
        role: Role,
        phase: Phase,
        config: &NodeConfig,
    ) -> Self {
        let now = Instant::now();
        Link {
            identity,
            addr,
            role,
            phase,
            remote_key: None,
            cipher: None,
            handshake_packet: None,
            attempts: 0,
            last_attempt: now,
            last_heard: now,
            last_sent: now,
            tx: ReliableSender::new(
                config.max_in_flight,
                config.retry_interval,
                config.max_retries,
            ),
            rx: ReliableReceiver::new(),
            partial: PartialMessages::new(),
            next_best_effort_id: 0,
        }
    }

    pub fn inviting(
        identity: PeerIdentity,
        addr: SocketAddr,
        keys: HandshakeKeys,
        service_tag: String,
        invite: Bytes,
        config: &NodeConfig,
    ) -> Self {
        let phase = Phase::Inviting { keys, service_tag };
        let mut link = Link::new(identity, addr, Role::Inviter, phase, config);
        link.handshake_packet = Some(invite);
        link
    }

    pub fn accepting(
        identity: PeerIdentity,
        addr: SocketAddr,
        remote_key: [u8; PUBLIC_KEY_SIZE],
        keys: &LinkKeys,
        accept: Bytes,
        config: &NodeConfig,
    ) -> Self {
        let mut link = Link::new(identity, addr, Role::Acceptor, Phase::Accepting, config);
        link.remote_key = Some(remote_key);
        link.cipher = Some(LinkCipher::new(keys));
        link.handshake_packet = Some(accept);
        link
    }

    /// Inviter side: keys derived from the peer's Accept
    pub fn confirming(&mut self, remote_key: [u8; PUBLIC_KEY_SIZE], keys: &LinkKeys) {
        self.phase = Phase::Confirming;
        self.remote_key = Some(remote_key);
        self.cipher = Some(LinkCipher::new(keys));
        self.handshake_packet = None;
        self.attempts = 0;
        self.last_attempt = Instant::now();
    }

    pub fn establish(&mut self) {
        self.phase = Phase::Established;
        self.handshake_packet = None;
    }

    pub fn is_established(&self) -> bool {
        matches!(self.phase, Phase::Established)
    }

    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seal `message` into a datagram from `local`
    pub fn seal(&mut self, local: PeerToken, message: &LinkMessage) -> ShareResult<Bytes> {
        let cipher = self.cipher.as_mut().ok_or(ShareError::EncryptionRequired)?;
        let (counter, ciphertext) = cipher.seal(local, &message.encode())?;
        let bytes = Datagram::new(
            local,
            Packet::Sealed(Sealed {
                counter,
                ciphertext: Bytes::from(ciphertext),
            }),
        )
        .encode()?;
        self.last_sent = Instant::now();
        Ok(bytes)
    }

    /// Authenticate and decode a sealed packet from this link's peer
    pub fn open(&mut self, sealed: &Sealed) -> ShareResult<LinkMessage> {
        let cipher = self.cipher.as_mut().ok_or(ShareError::EncryptionRequired)?;
        let plaintext = cipher.open(self.identity.token(), sealed.counter, &sealed.ciphertext)?;
        LinkMessage::decode(Bytes::from(plaintext))
    }

    /// Fragments of a best-effort message
    pub fn best_effort_frames(&mut self, payload: &Bytes) -> Vec<DataFrame> {
        let message_id = self.next_best_effort_id;
        self.next_best_effort_id += 1;

        let chunks = split_chunks(payload);
        let count = chunks.len() as u16;
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| DataFrame {
                channel: Reliability::BestEffort,
                seq: 0,
                message_id,
                index: index as u16,
                count,
                chunk,
            })
            .collect()
    }
}
