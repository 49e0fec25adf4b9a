//! Fixed-size bucketed hash table backing one cache.
//!
//! Tables come in power-of-two sizes (`2^log_size` buckets) so the manager
//! can pool retired tables in stacks keyed by log size and lease them back
//! out. Each bucket holds a handful of entries guarded by its own lock;
//! within a full bucket the entry with the lowest access frequency is
//! evicted.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Entries per bucket before eviction kicks in.
const BUCKET_ASSOCIATIVITY: usize = 8;
/// Accounted bytes per bucket (slot array + lock overhead).
pub const BUCKET_OVERHEAD: u64 = 64;
/// Accounted bytes per entry on top of key and value payload.
pub const ENTRY_OVERHEAD: u64 = 48;

#[derive(Debug, Clone)]
pub struct Entry {
    pub fingerprint: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub frequency: u32,
}

impl Entry {
    pub fn size(&self) -> u64 {
        ENTRY_OVERHEAD + self.key.len() as u64 + self.value.len() as u64
    }
}

/// Outcome of an insert attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Inserted; `freed` bytes were reclaimed by evicting a colder entry.
    Inserted { freed: u64 },
    /// Replaced an existing entry for the same key; `freed` is its size.
    Updated { freed: u64 },
}

pub struct Table {
    log_size: u32,
    buckets: Vec<Mutex<Vec<Entry>>>,
    /// Bytes of entry payload currently stored.
    data_usage: AtomicU64,
}

impl Table {
    pub fn new(log_size: u32) -> Self {
        let bucket_count = 1usize << log_size;
        Self {
            log_size,
            buckets: (0..bucket_count).map(|_| Mutex::new(Vec::new())).collect(),
            data_usage: AtomicU64::new(0),
        }
    }

    pub fn log_size(&self) -> u32 {
        self.log_size
    }

    /// Memory charged for the table structure itself.
    pub fn memory_usage(&self) -> u64 {
        BUCKET_OVERHEAD << self.log_size
    }

    /// Bytes of cached entries currently held.
    pub fn data_usage(&self) -> u64 {
        self.data_usage.load(Ordering::Relaxed)
    }

    fn bucket(&self, fingerprint: u64) -> &Mutex<Vec<Entry>> {
        let idx = (fingerprint as usize) & (self.buckets.len() - 1);
        &self.buckets[idx]
    }

    /// Look up an entry, bumping its access frequency on a hit.
    pub fn find(&self, fingerprint: u64, key: &[u8]) -> Option<Vec<u8>> {
        let mut bucket = self.bucket(fingerprint).lock();
        for entry in bucket.iter_mut() {
            if entry.fingerprint == fingerprint && entry.key == key {
                entry.frequency = entry.frequency.saturating_add(1);
                return Some(entry.value.clone());
            }
        }
        None
    }

    /// Insert (or replace) an entry, evicting the coldest entry of a full
    /// bucket.
    pub fn insert(&self, entry: Entry) -> InsertOutcome {
        let size = entry.size();
        let mut bucket = self.bucket(entry.fingerprint).lock();

        if let Some(existing) = bucket
            .iter_mut()
            .find(|e| e.fingerprint == entry.fingerprint && e.key == entry.key)
        {
            let freed = existing.size();
            self.data_usage.fetch_sub(freed, Ordering::Relaxed);
            self.data_usage.fetch_add(size, Ordering::Relaxed);
            *existing = entry;
            return InsertOutcome::Updated { freed };
        }

        let mut freed = 0;
        if bucket.len() >= BUCKET_ASSOCIATIVITY {
            let coldest = bucket
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.frequency)
                .map(|(i, _)| i)
                .unwrap_or(0);
            let evicted = bucket.swap_remove(coldest);
            freed = evicted.size();
            self.data_usage.fetch_sub(freed, Ordering::Relaxed);
        }

        self.data_usage.fetch_add(size, Ordering::Relaxed);
        bucket.push(entry);
        InsertOutcome::Inserted { freed }
    }

    /// Remove an entry. Returns its accounted size.
    pub fn remove(&self, fingerprint: u64, key: &[u8]) -> Option<u64> {
        let mut bucket = self.bucket(fingerprint).lock();
        let idx = bucket
            .iter()
            .position(|e| e.fingerprint == fingerprint && e.key == key)?;
        let removed = bucket.swap_remove(idx);
        let size = removed.size();
        self.data_usage.fetch_sub(size, Ordering::Relaxed);
        Some(size)
    }

    /// Drop all entries, e.g. before the table goes back on a spare stack.
    pub fn clear(&self) {
        for bucket in &self.buckets {
            bucket.lock().clear();
        }
        self.data_usage.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict cold entries until the stored payload drops to `target` bytes.
    /// Returns the number of bytes freed.
    pub fn evict_until(&self, target: u64) -> u64 {
        let mut freed = 0;
        for bucket in &self.buckets {
            if self.data_usage() <= target {
                break;
            }
            let mut bucket = bucket.lock();
            while self.data_usage() > target && !bucket.is_empty() {
                let coldest = bucket
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.frequency)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let evicted = bucket.swap_remove(coldest);
                let size = evicted.size();
                self.data_usage.fetch_sub(size, Ordering::Relaxed);
                freed += size;
            }
        }
        freed
    }

    /// Move every entry into `target`. Used by migration; entries that lose
    /// an eviction fight in the target are dropped.
    pub fn drain_into(&self, target: &Table) {
        for bucket in &self.buckets {
            let entries: Vec<Entry> = bucket.lock().drain(..).collect();
            for entry in entries {
                self.data_usage.fetch_sub(entry.size(), Ordering::Relaxed);
                target.insert(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fp: u64, key: &[u8], freq: u32) -> Entry {
        Entry {
            fingerprint: fp,
            key: key.to_vec(),
            value: b"value".to_vec(),
            frequency: freq,
        }
    }

    #[test]
    fn test_memory_usage_by_log_size() {
        assert_eq!(Table::new(4).memory_usage(), BUCKET_OVERHEAD << 4);
        assert_eq!(Table::new(10).memory_usage(), BUCKET_OVERHEAD << 10);
    }

    #[test]
    fn test_insert_find_remove() {
        let table = Table::new(4);
        table.insert(entry(42, b"k", 0));
        assert_eq!(table.find(42, b"k"), Some(b"value".to_vec()));
        assert!(table.find(42, b"other").is_none());
        assert!(table.data_usage() > 0);

        let freed = table.remove(42, b"k").unwrap();
        assert!(freed > 0);
        assert_eq!(table.data_usage(), 0);
        assert!(table.remove(42, b"k").is_none());
    }

    #[test]
    fn test_update_replaces_in_place() {
        let table = Table::new(4);
        table.insert(entry(7, b"k", 0));
        let outcome = table.insert(Entry {
            fingerprint: 7,
            key: b"k".to_vec(),
            value: b"replacement".to_vec(),
            frequency: 0,
        });
        assert!(matches!(outcome, InsertOutcome::Updated { .. }));
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(7, b"k"), Some(b"replacement".to_vec()));
    }

    #[test]
    fn test_full_bucket_evicts_coldest() {
        let table = Table::new(0); // single bucket
        for i in 0..BUCKET_ASSOCIATIVITY as u64 {
            table.insert(entry(i, format!("k{i}").as_bytes(), 5));
        }
        // make k0 hot
        for _ in 0..10 {
            table.find(0, b"k0");
        }
        let outcome = table.insert(entry(99, b"newcomer", 0));
        assert!(matches!(outcome, InsertOutcome::Inserted { freed } if freed > 0));
        assert_eq!(table.len(), BUCKET_ASSOCIATIVITY);
        // the hot entry survived
        assert!(table.find(0, b"k0").is_some());
    }

    #[test]
    fn test_drain_into_migrates_entries() {
        let small = Table::new(1);
        let large = Table::new(4);
        for i in 0..10u64 {
            small.insert(entry(i, format!("k{i}").as_bytes(), 1));
        }
        small.drain_into(&large);
        assert!(small.is_empty());
        assert_eq!(small.data_usage(), 0);
        assert!(large.len() > 0);
        assert!(large.find(3, b"k3").is_some() || large.len() <= 10);
    }

    #[test]
    fn test_clear() {
        let table = Table::new(3);
        for i in 0..5u64 {
            table.insert(entry(i, format!("k{i}").as_bytes(), 0));
        }
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.data_usage(), 0);
    }
}
