//! Second-granularity timer wheel for idle timeouts.
//!
//! One wheel per reactor, sized to `2 x net_timeout` slots so an entry
//! inserted `net_timeout` ahead never wraps past the current tick. The
//! wheel holds at most one entry per connection; activity does not move
//! the entry. Instead the reactor re-checks the task's true idle time when
//! an entry fires and re-inserts it for the remainder, which keeps every
//! I/O-path timer update O(1).

use std::os::fd::RawFd;

pub(crate) struct TimerWheel {
    slots: Vec<Vec<RawFd>>,
    /// Coarse clock (seconds since service start) up to which slots have
    /// been drained.
    tick: u64,
}

impl TimerWheel {
    pub(crate) fn new(span_secs: u64, now: u64) -> Self {
        let count = (2 * span_secs).max(2) as usize;
        Self {
            slots: (0..count).map(|_| Vec::new()).collect(),
            tick: now,
        }
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Schedule `fd` to fire at `expires` (seconds since service start).
    /// Returns the slot index for later removal. A deadline at or before
    /// the current tick fires on the next advance.
    pub(crate) fn insert(&mut self, expires: u64, fd: RawFd) -> usize {
        let at = expires.max(self.tick + 1);
        let slot = (at % self.slots.len() as u64) as usize;
        self.slots[slot].push(fd);
        slot
    }

    pub(crate) fn remove(&mut self, slot: usize, fd: RawFd) {
        if let Some(pos) = self.slots[slot].iter().position(|&f| f == fd) {
            self.slots[slot].swap_remove(pos);
        }
    }

    /// Drain every slot between the last tick (exclusive) and `now`
    /// (inclusive) into `expired`.
    pub(crate) fn advance(&mut self, now: u64, expired: &mut Vec<RawFd>) {
        if now <= self.tick {
            return;
        }
        let len = self.slots.len() as u64;
        let steps = (now - self.tick).min(len);
        for i in 1..=steps {
            let slot = ((self.tick + i) % len) as usize;
            expired.append(&mut self.slots[slot]);
        }
        self.tick = now;
    }
}
