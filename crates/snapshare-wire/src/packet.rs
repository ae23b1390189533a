//! Complete datagrams: header plus typed body

use bytes::{BufMut, Bytes, BytesMut};
use snapshare_core::{PeerToken, ShareError, ShareResult};

use crate::codec::Reader;
use crate::{
    Accept, Beacon, Invite, PacketHeader, PacketKind, Probe, Reject, HEADER_SIZE,
    MAX_DATAGRAM_SIZE,
};

/// Counter prefix of a sealed body
pub const COUNTER_SIZE: usize = 8;

/// Associated data of a sealed packet: header followed by the counter
pub const SEALED_AAD_SIZE: usize = HEADER_SIZE + COUNTER_SIZE;

/// Encrypted link traffic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sealed {
    /// Per-direction nonce counter
    pub counter: u64,
    /// Ciphertext with the auth tag appended
    pub ciphertext: Bytes,
}

/// Packet body by kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Beacon(Beacon),
    Probe(Probe),
    Invite(Invite),
    Accept(Accept),
    Reject(Reject),
    Sealed(Sealed),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Beacon(_) => PacketKind::Beacon,
            Packet::Probe(_) => PacketKind::Probe,
            Packet::Invite(_) => PacketKind::Invite,
            Packet::Accept(_) => PacketKind::Accept,
            Packet::Reject(_) => PacketKind::Reject,
            Packet::Sealed(_) => PacketKind::Sealed,
        }
    }
}

/// A full datagram as it travels on the medium
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub header: PacketHeader,
    pub packet: Packet,
}

impl Datagram {
    pub fn new(sender: PeerToken, packet: Packet) -> Self {
        Datagram {
            header: PacketHeader::new(packet.kind(), sender),
            packet,
        }
    }

    #[inline]
    pub fn sender(&self) -> PeerToken {
        self.header.sender
    }

    /// Serialize to bytes, refusing datagrams above [`MAX_DATAGRAM_SIZE`]
    pub fn encode(&self) -> ShareResult<Bytes> {
        let mut out = BytesMut::with_capacity(MAX_DATAGRAM_SIZE);
        self.header.write(&mut out);
        match &self.packet {
            Packet::Beacon(b) => b.write(&mut out)?,
            Packet::Probe(p) => p.write(&mut out)?,
            Packet::Invite(i) => i.write(&mut out)?,
            Packet::Accept(a) => a.write(&mut out)?,
            Packet::Reject(r) => r.write(&mut out)?,
            Packet::Sealed(s) => {
                out.put_u64_le(s.counter);
                out.put_slice(&s.ciphertext);
            }
        }

        if out.len() > MAX_DATAGRAM_SIZE {
            return Err(ShareError::InvalidWireFormat(format!(
                "Datagram of {} bytes exceeds {}",
                out.len(),
                MAX_DATAGRAM_SIZE
            )));
        }
        Ok(out.freeze())
    }

    /// Parse a datagram; sealed ciphertext is a zero-copy slice of `buf`
    pub fn decode(buf: Bytes) -> ShareResult<Self> {
        let header = PacketHeader::parse(&buf)?;
        let body = buf.slice(HEADER_SIZE..);
        let mut r = Reader::new(&body);

        let packet = match header.kind {
            PacketKind::Beacon => Packet::Beacon(Beacon::read(&mut r)?),
            PacketKind::Probe => Packet::Probe(Probe::read(&mut r)?),
            PacketKind::Invite => Packet::Invite(Invite::read(&mut r)?),
            PacketKind::Accept => Packet::Accept(Accept::read(&mut r)?),
            PacketKind::Reject => Packet::Reject(Reject::read(&mut r)?),
            PacketKind::Sealed => {
                let counter = r.u64()?;
                let ciphertext = r.rest_bytes(&body);
                Packet::Sealed(Sealed {
                    counter,
                    ciphertext,
                })
            }
        };

        Ok(Datagram { header, packet })
    }
}

/// Associated data binding a sealed packet's header and counter to its ciphertext
pub fn sealed_aad(sender: PeerToken, counter: u64) -> [u8; SEALED_AAD_SIZE] {
    let mut aad = [0u8; SEALED_AAD_SIZE];
    aad[..HEADER_SIZE].copy_from_slice(&PacketHeader::new(PacketKind::Sealed, sender).to_bytes());
    aad[HEADER_SIZE..].copy_from_slice(&counter.to_le_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CipherSuite;
    use snapshare_core::DisconnectReason;

    fn roundtrip(packet: Packet) {
        let datagram = Datagram::new(PeerToken::new(0xABCD), packet);
        let bytes = datagram.encode().unwrap();
        assert_eq!(Datagram::decode(bytes).unwrap(), datagram);
    }

    #[test]
    fn test_every_kind_roundtrips() {
        roundtrip(Packet::Beacon(Beacon::announce("selfie-share", "Alice")));
        roundtrip(Packet::Beacon(Beacon::withdraw("selfie-share", "Alice")));
        roundtrip(Packet::Probe(Probe::new("selfie-share")));
        roundtrip(Packet::Invite(Invite {
            service_tag: "selfie-share".into(),
            display_name: "Bob".into(),
            suite: CipherSuite::X25519ChaCha20Poly1305,
            public_key: [9u8; 32],
        }));
        roundtrip(Packet::Accept(Accept {
            display_name: "Alice".into(),
            suite: CipherSuite::X25519ChaCha20Poly1305,
            public_key: [4u8; 32],
        }));
        roundtrip(Packet::Reject(Reject::new(DisconnectReason::EncryptionRequired)));
        roundtrip(Packet::Sealed(Sealed {
            counter: 77,
            ciphertext: Bytes::from_static(&[1, 2, 3, 4]),
        }));
    }

    #[test]
    fn test_withdraw_flag() {
        assert!(Beacon::withdraw("t", "n").is_withdraw());
        assert!(!Beacon::announce("t", "n").is_withdraw());
    }

    #[test]
    fn test_oversize_datagram_refused() {
        let datagram = Datagram::new(
            PeerToken::new(1),
            Packet::Sealed(Sealed {
                counter: 0,
                ciphertext: Bytes::from(vec![0u8; MAX_DATAGRAM_SIZE]),
            }),
        );
        assert!(datagram.encode().is_err());
    }

    #[test]
    fn test_truncated_invite() {
        let datagram = Datagram::new(
            PeerToken::new(1),
            Packet::Invite(Invite {
                service_tag: "selfie-share".into(),
                display_name: "Bob".into(),
                suite: CipherSuite::X25519ChaCha20Poly1305,
                public_key: [1u8; 32],
            }),
        );
        let bytes = datagram.encode().unwrap();
        let truncated = bytes.slice(..bytes.len() - 5);
        assert!(matches!(
            Datagram::decode(truncated),
            Err(ShareError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_sealed_aad_matches_header() {
        let aad = sealed_aad(PeerToken::new(5), 11);
        let header = PacketHeader::parse(&aad).unwrap();

        assert_eq!(header.kind, PacketKind::Sealed);
        assert_eq!(header.sender, PeerToken::new(5));
        assert_eq!(u64::from_le_bytes(aad[HEADER_SIZE..].try_into().unwrap()), 11);
    }

    proptest::proptest! {
        #[test]
        fn prop_decode_arbitrary_bytes_never_panics(
            data in proptest::collection::vec(proptest::num::u8::ANY, 0..256)
        ) {
            let _ = Datagram::decode(Bytes::from(data));
        }

        #[test]
        fn prop_decode_with_valid_header_never_panics(
            kind in proptest::sample::select(vec![0x01u8, 0x02, 0x10, 0x11, 0x12, 0x20]),
            body in proptest::collection::vec(proptest::num::u8::ANY, 0..128)
        ) {
            let mut data = vec![crate::WIRE_VERSION, kind];
            data.extend_from_slice(&[0u8; 8]);
            data.extend(body);
            let _ = Datagram::decode(Bytes::from(data));
        }
    }
}
