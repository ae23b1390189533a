//! Handshake packets
//!
//! Invite and Accept carry ephemeral X25519 public keys in the clear; the
//! link keys derived from them protect everything that follows.

use bytes::BufMut;
use snapshare_core::{DisconnectReason, ShareError, ShareResult};

use crate::codec::{put_short_str, Reader};
use crate::CipherSuite;

/// X25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

fn read_suite(r: &mut Reader<'_>) -> ShareResult<CipherSuite> {
    let b = r.u8()?;
    CipherSuite::from_byte(b)
        .ok_or_else(|| ShareError::InvalidWireFormat(format!("Unknown cipher suite {:#04x}", b)))
}

/// Connection invitation from a browser to an advertiser
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invite {
    pub service_tag: String,
    pub display_name: String,
    pub suite: CipherSuite,
    pub public_key: [u8; PUBLIC_KEY_SIZE],
}

impl Invite {
    pub fn write<B: BufMut>(&self, out: &mut B) -> ShareResult<()> {
        put_short_str(out, &self.service_tag)?;
        put_short_str(out, &self.display_name)?;
        out.put_u8(self.suite.to_byte());
        out.put_slice(&self.public_key);
        Ok(())
    }

    pub fn read(r: &mut Reader<'_>) -> ShareResult<Self> {
        let invite = Invite {
            service_tag: r.short_str()?,
            display_name: r.short_str()?,
            suite: read_suite(r)?,
            public_key: r.array()?,
        };
        r.finish()?;
        Ok(invite)
    }
}

/// Invitation accepted; carries the acceptor's ephemeral key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accept {
    pub display_name: String,
    pub suite: CipherSuite,
    pub public_key: [u8; PUBLIC_KEY_SIZE],
}

impl Accept {
    pub fn write<B: BufMut>(&self, out: &mut B) -> ShareResult<()> {
        put_short_str(out, &self.display_name)?;
        out.put_u8(self.suite.to_byte());
        out.put_slice(&self.public_key);
        Ok(())
    }

    pub fn read(r: &mut Reader<'_>) -> ShareResult<Self> {
        let accept = Accept {
            display_name: r.short_str()?,
            suite: read_suite(r)?,
            public_key: r.array()?,
        };
        r.finish()?;
        Ok(accept)
    }
}

/// Handshake refused or torn down
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reject {
    pub reason: DisconnectReason,
}

impl Reject {
    pub fn new(reason: DisconnectReason) -> Self {
        Reject { reason }
    }

    pub fn write<B: BufMut>(&self, out: &mut B) -> ShareResult<()> {
        out.put_u8(self.reason.to_byte());
        Ok(())
    }

    pub fn read(r: &mut Reader<'_>) -> ShareResult<Self> {
        let b = r.u8()?;
        r.finish()?;
        // Unknown codes from newer peers still end the handshake
        let reason = DisconnectReason::from_byte(b).unwrap_or(DisconnectReason::Rejected);
        Ok(Reject { reason })
    }
}
