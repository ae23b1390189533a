//! Newest-first image store
//!
//! Local and received inserts go through one write lock, so interleaved
//! prepends are never lost. Readers take the read lock briefly and get a
//! cheap clone (image bytes are reference counted).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use snapshare_core::{Image, PeerIdentity};
use tokio::sync::watch;

/// Where an image came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageOrigin {
    Local,
    Received(PeerIdentity),
}

/// A decoded image plus its arrival order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRecord {
    pub image: Image,
    pub origin: ImageOrigin,
    /// Monotonic across the store, starting at 0
    pub arrival: u64,
}

struct Records {
    items: VecDeque<ImageRecord>,
    next_arrival: u64,
}

struct StoreInner {
    records: RwLock<Records>,
    revision: watch::Sender<u64>,
}

/// Shared handle to the image sequence
#[derive(Clone)]
pub struct ImageStore {
    inner: Arc<StoreInner>,
}

impl ImageStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        ImageStore {
            inner: Arc::new(StoreInner {
                records: RwLock::new(Records {
                    items: VecDeque::new(),
                    next_arrival: 0,
                }),
                revision,
            }),
        }
    }

    /// Prepend an image this device captured
    pub fn insert_local(&self, image: Image) -> u64 {
        self.insert(image, ImageOrigin::Local)
    }

    /// Prepend an image received from `peer`
    pub fn insert_received(&self, peer: PeerIdentity, image: Image) -> u64 {
        self.insert(image, ImageOrigin::Received(peer))
    }

    fn insert(&self, image: Image, origin: ImageOrigin) -> u64 {
        let arrival = {
            let mut records = self.inner.records.write();
            let arrival = records.next_arrival;
            records.next_arrival += 1;
            records.items.push_front(ImageRecord {
                image,
                origin,
                arrival,
            });
            arrival
        };
        self.inner.revision.send_replace(arrival + 1);
        arrival
    }

    /// All records, newest first
    pub fn all(&self) -> Vec<ImageRecord> {
        self.inner.records.read().items.iter().cloned().collect()
    }

    pub fn get(&self, index: usize) -> Option<ImageRecord> {
        self.inner.records.read().items.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.records.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch the insert count; changes on every insert
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }
}

impl Default for ImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ImageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStore").field("len", &self.len()).finish()
    }
}
