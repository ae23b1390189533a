//! Replay window over sealed-packet counters

/// Bits tracked behind the highest accepted counter
pub const REPLAY_WINDOW_SIZE: u64 = 64;

/// Sliding window for one receive direction of a link
#[derive(Clone, Debug)]
pub struct ReplayWindow {
    /// Lowest counter still tracked
    min_counter: u64,
    /// Bit `i` set when `min_counter + i` has been accepted
    bitmap: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        ReplayWindow {
            min_counter: 0,
            bitmap: 0,
        }
    }

    /// Whether `counter` would be accepted
    pub fn check(&self, counter: u64) -> bool {
        if counter < self.min_counter {
            // Fell behind the window
            return false;
        }

        let offset = counter - self.min_counter;
        if offset >= REPLAY_WINDOW_SIZE {
            return true;
        }

        self.bitmap & (1u64 << offset) == 0
    }

    /// Mark `counter` as received; false if it is a replay or too old
    pub fn accept(&mut self, counter: u64) -> bool {
        if !self.check(counter) {
            return false;
        }

        let offset = counter - self.min_counter;
        if offset >= REPLAY_WINDOW_SIZE {
            let advance = offset - REPLAY_WINDOW_SIZE + 1;
            if advance >= REPLAY_WINDOW_SIZE {
                self.bitmap = 0;
            } else {
                self.bitmap >>= advance;
            }
            self.min_counter = counter - (REPLAY_WINDOW_SIZE - 1);
        }

        self.bitmap |= 1u64 << (counter - self.min_counter);
        true
    }

    pub fn min_counter(&self) -> u64 {
        self.min_counter
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}
