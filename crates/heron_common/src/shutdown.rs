//! Cooperative shutdown signal for background workers.
//!
//! Workers sleep in `wait_timeout` instead of `thread::sleep`; `shutdown()`
//! wakes them immediately so a stop request never waits out a full sync
//! interval.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A clonable shutdown signal. Clones observe the same state.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter.
    pub fn shutdown(&self) {
        *self.inner.stopped.lock() = true;
        self.inner.wakeup.notify_all();
    }

    /// Non-blocking check.
    pub fn is_shutdown(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Sleep for at most `duration`, waking early on `shutdown()`. Returns
    /// `true` when the caller should exit its loop.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let mut stopped = self.inner.stopped.lock();
        if *stopped {
            return true;
        }
        // wait_while_for re-checks the flag on spurious wakeups
        self.inner
            .wakeup
            .wait_while_for(&mut stopped, |stopped| !*stopped, duration);
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_clear() {
        assert!(!ShutdownSignal::new().is_shutdown());
    }

    #[test]
    fn test_wait_returns_immediately_after_shutdown() {
        let sig = ShutdownSignal::new();
        sig.shutdown();
        let start = std::time::Instant::now();
        assert!(sig.wait_timeout(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_shutdown_wakes_waiter() {
        let sig = ShutdownSignal::new();
        let waiter = sig.clone();
        let handle = std::thread::spawn(move || {
            let start = std::time::Instant::now();
            (waiter.wait_timeout(Duration::from_secs(10)), start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        sig.shutdown();
        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_timeout_without_shutdown() {
        let sig = ShutdownSignal::new();
        let start = std::time::Instant::now();
        assert!(!sig.wait_timeout(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_clones_share_state() {
        let sig = ShutdownSignal::new();
        let other = sig.clone();
        other.shutdown();
        assert!(sig.is_shutdown());
        assert!(sig.wait_timeout(Duration::from_secs(1)));
    }
}
