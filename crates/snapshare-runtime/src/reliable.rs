//! Per-link delivery machinery
//!
//! Reliable traffic: every fragment gets a link sequence number, the
//! receiver acks each one selectively and releases fragments strictly in
//! sequence order. The sender keeps at most `max_in_flight` sequence numbers
//! open past the oldest unacknowledged one and retransmits on a timer.
//!
//! Best-effort traffic carries no sequence state; whole messages are
//! delivered when all of their fragments happen to arrive.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use snapshare_core::Reliability;
use snapshare_wire::{split_chunks, DataFrame};

/// Identifies one `send` call across all of its targets
pub type SendId = u64;

/// Sequence numbers accepted ahead of the next expected one
pub const RECEIVE_WINDOW: u64 = 1024;

/// Incomplete best-effort messages kept per link
pub const MAX_PARTIAL_MESSAGES: usize = 8;

struct Outstanding {
    send_id: SendId,
    frame: DataFrame,
    last_sent: Option<Instant>,
    retries: u32,
}

/// What the sender wants transmitted now
#[derive(Debug)]
pub enum SenderPoll {
    Frames(Vec<DataFrame>),
    /// A fragment ran out of retransmissions
    Exhausted,
}

/// Reliable sending half of one link
pub struct ReliableSender {
    next_seq: u64,
    next_message_id: u64,
    /// Fragmented but not yet admitted to the window
    queue: VecDeque<Outstanding>,
    in_flight: BTreeMap<u64, Outstanding>,
    /// Unacknowledged fragments per send
    remaining: HashMap<SendId, usize>,
    max_in_flight: u64,
    retry_interval: Duration,
    max_retries: u32,
}

impl ReliableSender {
    pub fn new(max_in_flight: usize, retry_interval: Duration, max_retries: u32) -> Self {
        ReliableSender {
            next_seq: 0,
            next_message_id: 0,
            queue: VecDeque::new(),
            in_flight: BTreeMap::new(),
            remaining: HashMap::new(),
            max_in_flight: max_in_flight.max(1) as u64,
            retry_interval,
            max_retries,
        }
    }

    /// Fragment `payload` and queue it; returns the message id
    pub fn push(&mut self, send_id: SendId, payload: &Bytes) -> u64 {
        let message_id = self.next_message_id;
        self.next_message_id += 1;

        let chunks = split_chunks(payload);
        let count = chunks.len() as u16;
        *self.remaining.entry(send_id).or_insert(0) += chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.queue.push_back(Outstanding {
                send_id,
                frame: DataFrame {
                    channel: Reliability::Reliable,
                    seq,
                    message_id,
                    index: index as u16,
                    count,
                    chunk,
                },
                last_sent: None,
                retries: 0,
            });
        }
        message_id
    }

    /// Frames due for (re)transmission at `now`
    pub fn poll(&mut self, now: Instant) -> SenderPoll {
        let mut frames = Vec::new();

        for out in self.in_flight.values_mut() {
            let due = out
                .last_sent
                .map_or(true, |t| now.duration_since(t) >= self.retry_interval);
            if !due {
                continue;
            }
            if out.retries >= self.max_retries {
                return SenderPoll::Exhausted;
            }
            out.retries += 1;
            out.last_sent = Some(now);
            frames.push(out.frame.clone());
        }

        // Admit queued fragments while they fit the window
        while let Some(next) = self.queue.front() {
            let base = self.in_flight.keys().next().copied().unwrap_or(next.frame.seq);
            if next.frame.seq >= base + self.max_in_flight {
                break;
            }
            let Some(mut out) = self.queue.pop_front() else {
                break;
            };
            out.last_sent = Some(now);
            frames.push(out.frame.clone());
            self.in_flight.insert(out.frame.seq, out);
        }

        SenderPoll::Frames(frames)
    }

    /// Returns the send whose last fragment this ack completed
    pub fn on_ack(&mut self, seq: u64) -> Option<SendId> {
        let out = self.in_flight.remove(&seq)?;
        let left = self.remaining.get_mut(&out.send_id)?;
        *left -= 1;
        if *left == 0 {
            self.remaining.remove(&out.send_id);
            return Some(out.send_id);
        }
        None
    }

    /// Abandon everything; returns the sends that did not complete
    pub fn drain(&mut self) -> Vec<SendId> {
        self.queue.clear();
        self.in_flight.clear();
        self.remaining.drain().map(|(id, _)| id).collect()
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }
}

/// Rebuilds messages from fragments that arrive in sequence order
#[derive(Default)]
pub struct Assembler {
    current: Option<(u64, u16, BytesMut)>,
    expected_index: u16,
}

impl Assembler {
    pub fn push(&mut self, frame: DataFrame) -> Option<Bytes> {
        if frame.index == 0 {
            if self.current.take().is_some() {
                tracing::debug!(message_id = frame.message_id, "Incomplete message abandoned");
            }
            if frame.count == 1 {
                return Some(frame.chunk);
            }
            let mut buf = BytesMut::with_capacity(frame.chunk.len() * frame.count as usize);
            buf.extend_from_slice(&frame.chunk);
            self.current = Some((frame.message_id, frame.count, buf));
            self.expected_index = 1;
            return None;
        }

        let (message_id, count, buf) = self.current.as_mut()?;
        if *message_id != frame.message_id
            || *count != frame.count
            || frame.index != self.expected_index
        {
            tracing::debug!(
                message_id = frame.message_id,
                index = frame.index,
                "Out of place fragment"
            );
            self.current = None;
            return None;
        }

        buf.extend_from_slice(&frame.chunk);
        self.expected_index += 1;
        if frame.is_last() {
            return self.current.take().map(|(_, _, buf)| buf.freeze());
        }
        None
    }
}

/// Outcome of one reliable frame
#[derive(Debug, Default)]
pub struct Received {
    /// Whether to acknowledge the frame's sequence number
    pub ack: bool,
    /// Messages completed by this frame, in order
    pub messages: Vec<Bytes>,
}

/// Reliable receiving half of one link
#[derive(Default)]
pub struct ReliableReceiver {
    next_seq: u64,
    pending: BTreeMap<u64, DataFrame>,
    assembler: Assembler,
}

impl ReliableReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_frame(&mut self, frame: DataFrame) -> Received {
        let seq = frame.seq;
        if seq < self.next_seq {
            // Delivered already; our ack was probably lost
            return Received {
                ack: true,
                messages: Vec::new(),
            };
        }
        if seq >= self.next_seq + RECEIVE_WINDOW {
            return Received::default();
        }

        self.pending.entry(seq).or_insert(frame);

        let mut messages = Vec::new();
        while let Some(frame) = self.pending.remove(&self.next_seq) {
            self.next_seq += 1;
            if let Some(message) = self.assembler.push(frame) {
                messages.push(message);
            }
        }

        Received { ack: true, messages }
    }

    /// Next sequence number expected
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

struct Partial {
    message_id: u64,
    chunks: Vec<Option<Bytes>>,
    received: usize,
}

/// Best-effort reassembly with bounded memory
#[derive(Default)]
pub struct PartialMessages {
    partial: VecDeque<Partial>,
}

impl PartialMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: DataFrame) -> Option<Bytes> {
        if frame.count == 1 {
            return Some(frame.chunk);
        }

        let pos = match self.partial.iter().position(|p| p.message_id == frame.message_id) {
            Some(pos) => pos,
            None => {
                if self.partial.len() >= MAX_PARTIAL_MESSAGES {
                    self.partial.pop_front();
                }
                self.partial.push_back(Partial {
                    message_id: frame.message_id,
                    chunks: vec![None; frame.count as usize],
                    received: 0,
                });
                self.partial.len() - 1
            }
        };

        let partial = &mut self.partial[pos];
        let slot = partial.chunks.get_mut(frame.index as usize)?;
        if slot.is_none() {
            *slot = Some(frame.chunk);
            partial.received += 1;
        }
        if partial.received < partial.chunks.len() {
            return None;
        }

        let done = self.partial.remove(pos)?;
        let mut buf = BytesMut::new();
        for chunk in done.chunks.into_iter().flatten() {
            buf.extend_from_slice(&chunk);
        }
        Some(buf.freeze())
    }

    pub fn len(&self) -> usize {
        self.partial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partial.is_empty()
    }
}
