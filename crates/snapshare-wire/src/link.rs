//! Link messages: the plaintext inside a sealed packet

use bytes::{BufMut, Bytes};
use snapshare_core::{Reliability, ShareError, ShareResult};

use crate::codec::Reader;

/// Largest payload fragment carried by one data message
pub const MAX_CHUNK_SIZE: usize = 1200;

/// Data message header: channel, seq, message id, index, count
pub const DATA_HEADER_SIZE: usize = 1 + 1 + 8 + 8 + 2 + 2;

/// Link message type tags
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkMessageType {
    Confirm = 0x01,
    Data = 0x02,
    Ack = 0x03,
    Ping = 0x04,
    Bye = 0x05,
}

impl LinkMessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(LinkMessageType::Confirm),
            0x02 => Some(LinkMessageType::Data),
            0x03 => Some(LinkMessageType::Ack),
            0x04 => Some(LinkMessageType::Ping),
            0x05 => Some(LinkMessageType::Bye),
            _ => None,
        }
    }
}

/// One fragment of a payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataFrame {
    pub channel: Reliability,
    /// Per-link, per-channel sequence number
    pub seq: u64,
    /// Per-link message counter shared by all fragments of one payload
    pub message_id: u64,
    pub index: u16,
    pub count: u16,
    pub chunk: Bytes,
}

impl DataFrame {
    #[inline]
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.count
    }
}

/// Authenticated link message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkMessage {
    /// Key confirmation; completes the handshake
    Confirm,
    Data(DataFrame),
    /// Reliable-channel acknowledgement of one sequence number
    Ack { seq: u64 },
    /// Keepalive
    Ping,
    /// Graceful teardown
    Bye,
}

impl LinkMessage {
    pub fn message_type(&self) -> LinkMessageType {
        match self {
            LinkMessage::Confirm => LinkMessageType::Confirm,
            LinkMessage::Data(_) => LinkMessageType::Data,
            LinkMessage::Ack { .. } => LinkMessageType::Ack,
            LinkMessage::Ping => LinkMessageType::Ping,
            LinkMessage::Bye => LinkMessageType::Bye,
        }
    }

    /// Encode to plaintext
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(match self {
            LinkMessage::Data(frame) => 1 + DATA_HEADER_SIZE + frame.chunk.len(),
            _ => 9,
        });
        out.put_u8(self.message_type() as u8);
        match self {
            LinkMessage::Data(frame) => {
                out.put_u8(frame.channel.to_byte());
                out.put_u64_le(frame.seq);
                out.put_u64_le(frame.message_id);
                out.put_u16_le(frame.index);
                out.put_u16_le(frame.count);
                out.put_slice(&frame.chunk);
            }
            LinkMessage::Ack { seq } => out.put_u64_le(*seq),
            LinkMessage::Confirm | LinkMessage::Ping | LinkMessage::Bye => {}
        }
        out
    }

    /// Decode from plaintext; data chunks are zero-copy slices of `plaintext`
    pub fn decode(plaintext: Bytes) -> ShareResult<Self> {
        let mut r = Reader::new(&plaintext);
        let tag = r.u8()?;
        let msg_type = LinkMessageType::from_byte(tag).ok_or_else(|| {
            ShareError::InvalidWireFormat(format!("Unknown link message {:#04x}", tag))
        })?;

        let message = match msg_type {
            LinkMessageType::Confirm => LinkMessage::Confirm,
            LinkMessageType::Ping => LinkMessage::Ping,
            LinkMessageType::Bye => LinkMessage::Bye,
            LinkMessageType::Ack => LinkMessage::Ack { seq: r.u64()? },
            LinkMessageType::Data => {
                let channel_byte = r.u8()?;
                let channel = Reliability::from_byte(channel_byte).ok_or_else(|| {
                    ShareError::InvalidWireFormat(format!("Unknown channel {:#04x}", channel_byte))
                })?;
                let seq = r.u64()?;
                let message_id = r.u64()?;
                let index = r.u16()?;
                let count = r.u16()?;
                if count == 0 || index >= count {
                    return Err(ShareError::InvalidWireFormat(format!(
                        "Fragment {} of {}",
                        index, count
                    )));
                }
                let chunk = r.rest_bytes(&plaintext);
                LinkMessage::Data(DataFrame {
                    channel,
                    seq,
                    message_id,
                    index,
                    count,
                    chunk,
                })
            }
        };
        r.finish()?;
        Ok(message)
    }
}

/// Split a payload into chunks of at most [`MAX_CHUNK_SIZE`] bytes.
///
/// An empty payload yields one empty chunk so it is still delivered.
pub fn split_chunks(payload: &Bytes) -> Vec<Bytes> {
    if payload.is_empty() {
        return vec![Bytes::new()];
    }
    (0..payload.len())
        .step_by(MAX_CHUNK_SIZE)
        .map(|start| payload.slice(start..(start + MAX_CHUNK_SIZE).min(payload.len())))
        .collect()
}

/// Largest payload that fits the u16 fragment count
pub const MAX_FRAGMENTED_PAYLOAD: usize = MAX_CHUNK_SIZE * u16::MAX as usize;
