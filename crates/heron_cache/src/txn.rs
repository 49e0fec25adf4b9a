//! Cache transaction accounting.
//!
//! Transactional caches must not serve or store data that a running write
//! transaction might roll back. The manager therefore hands out
//! [`CacheTransaction`] handles; while any write transaction is open the
//! current *term* is considered dirty and transactional caches refuse new
//! insertions (and banished keys stay banished).

use std::sync::atomic::{AtomicU64, Ordering};

/// Handle for one transaction's interaction with the cache pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTransaction {
    pub id: u64,
    pub read_only: bool,
    /// The write term this transaction belongs to.
    pub term: u64,
}

/// Tracks open cache transactions and the global write term.
#[derive(Debug, Default)]
pub struct TransactionTracker {
    next_id: AtomicU64,
    open_reads: AtomicU64,
    open_writes: AtomicU64,
    /// Increments whenever the set of open write transactions goes from
    /// empty to non-empty or back — i.e. every "possibly dirty" window gets
    /// its own term.
    term: AtomicU64,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, read_only: bool) -> CacheTransaction {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if read_only {
            self.open_reads.fetch_add(1, Ordering::SeqCst);
        } else if self.open_writes.fetch_add(1, Ordering::SeqCst) == 0 {
            self.term.fetch_add(1, Ordering::SeqCst);
        }
        CacheTransaction {
            id,
            read_only,
            term: self.term.load(Ordering::SeqCst),
        }
    }

    pub fn end(&self, tx: CacheTransaction) {
        if tx.read_only {
            self.open_reads.fetch_sub(1, Ordering::SeqCst);
        } else if self.open_writes.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.term.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Whether any write transaction is currently open.
    pub fn write_in_progress(&self) -> bool {
        self.open_writes.load(Ordering::SeqCst) > 0
    }

    /// The current term. Odd values mark dirty windows (some write open).
    pub fn term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> u64 {
        self.open_reads.load(Ordering::SeqCst) + self.open_writes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_transactions_keep_term() {
        let tracker = TransactionTracker::new();
        let before = tracker.term();
        let tx = tracker.begin(true);
        assert_eq!(tracker.term(), before);
        assert!(!tracker.write_in_progress());
        tracker.end(tx);
        assert_eq!(tracker.open_count(), 0);
    }

    #[test]
    fn test_write_transaction_advances_term() {
        let tracker = TransactionTracker::new();
        let before = tracker.term();
        let tx = tracker.begin(false);
        assert!(tracker.write_in_progress());
        assert_eq!(tracker.term(), before + 1);
        tracker.end(tx);
        assert!(!tracker.write_in_progress());
        assert_eq!(tracker.term(), before + 2);
    }

    #[test]
    fn test_overlapping_writes_share_a_term() {
        let tracker = TransactionTracker::new();
        let t1 = tracker.begin(false);
        let t2 = tracker.begin(false);
        assert_eq!(t1.term, t2.term);
        tracker.end(t1);
        // still dirty: t2 is open
        assert!(tracker.write_in_progress());
        tracker.end(t2);
        assert!(!tracker.write_in_progress());
        // a new write transaction gets a fresh term
        let t3 = tracker.begin(false);
        assert!(t3.term > t2.term);
        tracker.end(t3);
    }
}
