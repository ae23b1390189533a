//! Event fan-out
//!
//! Every subscriber gets its own unbounded queue, so a slow reader never
//! makes the driver wait and no event is silently dropped.

use parking_lot::Mutex;
use tokio::sync::mpsc;

struct State<T> {
    senders: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

/// Publishing side shared by the driver and the handles that subscribe
pub struct Subscribers<T> {
    state: Mutex<State<T>>,
}

impl<T: Clone> Subscribers<T> {
    pub fn new() -> Self {
        Subscribers {
            state: Mutex::new(State {
                senders: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn subscribe(&self) -> EventStream<T> {
        self.subscribe_with(std::iter::empty())
    }

    /// Subscribe with `initial` events queued ahead of anything published later
    pub fn subscribe_with(&self, initial: impl IntoIterator<Item = T>) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if !state.closed {
            for event in initial {
                let _ = tx.send(event);
            }
            state.senders.push(tx);
        }
        EventStream { rx }
    }

    pub fn publish(&self, event: T) {
        let mut state = self.state.lock();
        state.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Forget dropped streams; returns how many remain
    pub fn retain_open(&self) -> usize {
        let mut state = self.state.lock();
        state.senders.retain(|tx| !tx.is_closed());
        state.senders.len()
    }

    /// End every stream; later subscriptions end immediately
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.senders.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl<T: Clone> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of one subscription
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> EventStream<T> {
    /// Next event, or `None` once the publisher closed
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> std::fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}
