//! Lock-and-flags word shared by the manager and its background tasks.
//!
//! A single atomic word carries a spin lock bit plus lifecycle and task
//! flags. Locking spins with a bounded number of tries so callers on hot
//! paths can give up instead of blocking behind a global process.

use std::sync::atomic::{AtomicU32, Ordering};

pub const LOCKED: u32 = 0x01;
pub const SHUTTING_DOWN: u32 = 0x02;
pub const SHUT_DOWN: u32 = 0x04;
pub const REBALANCING: u32 = 0x08;
pub const RESIZING: u32 = 0x10;
pub const MIGRATING: u32 = 0x20;

/// Bounded-spin tries for fast-path callers.
pub const TRIES_FAST: u32 = 100;
/// Bounded-spin tries for slow-path callers (shutdown, resize).
pub const TRIES_SLOW: u32 = 10_000;

#[derive(Debug, Default)]
pub struct State {
    word: AtomicU32,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock bit, spinning at most `max_tries` times.
    pub fn lock(&self, max_tries: u32) -> bool {
        for _ in 0..max_tries {
            let current = self.word.load(Ordering::Relaxed);
            if current & LOCKED == 0
                && self
                    .word
                    .compare_exchange_weak(
                        current,
                        current | LOCKED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    /// Release the lock bit. Caller must hold it.
    pub fn unlock(&self) {
        self.word.fetch_and(!LOCKED, Ordering::Release);
    }

    /// Check a flag without taking the lock.
    pub fn is_set(&self, flag: u32) -> bool {
        self.word.load(Ordering::Acquire) & flag != 0
    }

    /// Set or clear a flag. Callers hold the lock while toggling task flags
    /// so at most one global process is marked at a time.
    pub fn toggle(&self, flag: u32, on: bool) {
        if on {
            self.word.fetch_or(flag, Ordering::AcqRel);
        } else {
            self.word.fetch_and(!flag, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock() {
        let state = State::new();
        assert!(state.lock(TRIES_FAST));
        assert!(state.is_set(LOCKED));
        // second locker gives up
        assert!(!state.lock(10));
        state.unlock();
        assert!(!state.is_set(LOCKED));
        assert!(state.lock(TRIES_FAST));
        state.unlock();
    }

    #[test]
    fn test_flags_independent_of_lock() {
        let state = State::new();
        state.toggle(REBALANCING, true);
        assert!(state.is_set(REBALANCING));
        assert!(!state.is_set(RESIZING));
        assert!(state.lock(TRIES_FAST));
        assert!(state.is_set(REBALANCING));
        state.toggle(REBALANCING, false);
        state.unlock();
        assert!(!state.is_set(REBALANCING));
    }

    #[test]
    fn test_shutdown_flags() {
        let state = State::new();
        state.toggle(SHUTTING_DOWN, true);
        assert!(state.is_set(SHUTTING_DOWN));
        state.toggle(SHUT_DOWN, true);
        state.toggle(SHUTTING_DOWN, false);
        assert!(state.is_set(SHUT_DOWN));
    }
}
