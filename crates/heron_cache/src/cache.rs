//! An individual cache leased from the manager.
//!
//! A cache owns its metadata and the table currently leased to it; the
//! manager is held by non-owning reference. All memory growth is
//! cooperative: when an insert does not fit the current limit the cache asks
//! the manager once, and otherwise backs off until the deadline the manager
//! handed back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use xxhash_rust::xxh3::xxh3_64;

use crate::frequency::FrequencyBuffer;
use crate::manager::ManagerCore;
use crate::metadata::Metadata;
use crate::table::{Entry, Table};

/// Plain caches serve any data; transactional caches refuse insertions
/// while a write transaction is open, so rolled-back data never lands in
/// the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    Plain,
    Transactional,
}

pub struct Cache {
    id: u64,
    cache_type: CacheType,
    manager: Weak<ManagerCore>,
    metadata: Mutex<Metadata>,
    table: RwLock<Arc<Table>>,
    /// fingerprint → term it was banished in.
    banished: Mutex<HashMap<u64, u64>>,
    find_hits: AtomicU64,
    find_misses: AtomicU64,
    windowed_stats: Option<FrequencyBuffer<bool>>,
    next_grow_allowed: Mutex<Instant>,
    next_migrate_allowed: Mutex<Instant>,
    shut_down: AtomicBool,
}

impl Cache {
    pub(crate) fn new(
        id: u64,
        cache_type: CacheType,
        manager: Weak<ManagerCore>,
        metadata: Metadata,
        table: Arc<Table>,
        windowed_stats: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            cache_type,
            manager,
            metadata: Mutex::new(metadata),
            table: RwLock::new(table),
            banished: Mutex::new(HashMap::new()),
            find_hits: AtomicU64::new(0),
            find_misses: AtomicU64::new(0),
            windowed_stats: windowed_stats.then(|| FrequencyBuffer::new(1024)),
            next_grow_allowed: Mutex::new(Instant::now()),
            next_migrate_allowed: Mutex::new(Instant::now()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    fn fingerprint(key: &[u8]) -> u64 {
        xxh3_64(key)
    }

    /// Look up a value. Reports the access and the hit/miss to the manager.
    pub fn find(&self, key: &[u8]) -> Option<Vec<u8>> {
        if self.shut_down.load(Ordering::Acquire) {
            return None;
        }
        let fingerprint = Self::fingerprint(key);
        let table = self.table.read().clone();
        let result = table.find(fingerprint, key);

        let hit = result.is_some();
        if hit {
            self.find_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.find_misses.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(stats) = &self.windowed_stats {
            stats.insert_record(hit);
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.report_access(self.id);
            manager.report_hit_stat(hit);
        }
        result
    }

    /// Try to cache a value. Returns `false` when the value was not cached —
    /// never an error, a cache is free to decline.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            return false;
        }
        let manager = match self.manager.upgrade() {
            Some(m) => m,
            None => return false,
        };

        let fingerprint = Self::fingerprint(key);
        if self.cache_type == CacheType::Transactional {
            // data written by a still-open transaction may be rolled back
            if manager.transactions().write_in_progress() {
                return false;
            }
            let mut banished = self.banished.lock();
            if let Some(&term) = banished.get(&fingerprint) {
                if term >= manager.transactions().term() {
                    return false;
                }
                banished.remove(&fingerprint);
            }
        }

        let entry = Entry {
            fingerprint,
            key: key.to_vec(),
            value: value.to_vec(),
            frequency: 1,
        };
        let size = entry.size();

        {
            let mut metadata = self.metadata.lock();
            if !metadata.adjust_usage_if_allowed(size as i64) {
                drop(metadata);
                if !self.try_grow(&manager) {
                    return false;
                }
                let mut metadata = self.metadata.lock();
                if !metadata.adjust_usage_if_allowed(size as i64) {
                    return false;
                }
            }
        }

        let table = self.table.read().clone();
        let freed = match table.insert(entry) {
            crate::table::InsertOutcome::Inserted { freed } => freed,
            crate::table::InsertOutcome::Updated { freed } => freed,
        };
        if freed > 0 {
            self.metadata.lock().adjust_usage_if_allowed(-(freed as i64));
        }
        true
    }

    /// Drop a cached value if present.
    pub fn remove(&self, key: &[u8]) -> bool {
        let fingerprint = Self::fingerprint(key);
        let table = self.table.read().clone();
        match table.remove(fingerprint, key) {
            Some(freed) => {
                self.metadata.lock().adjust_usage_if_allowed(-(freed as i64));
                true
            }
            None => false,
        }
    }

    /// Remove a value and, on a transactional cache inside a dirty term,
    /// keep the key out of the cache until the term closes.
    pub fn banish(&self, key: &[u8]) {
        self.remove(key);
        if self.cache_type == CacheType::Transactional {
            if let Some(manager) = self.manager.upgrade() {
                if manager.transactions().write_in_progress() {
                    let fingerprint = Self::fingerprint(key);
                    self.banished
                        .lock()
                        .insert(fingerprint, manager.transactions().term());
                }
            }
        }
    }

    fn try_grow(&self, manager: &Arc<ManagerCore>) -> bool {
        {
            let next_allowed = self.next_grow_allowed.lock();
            if Instant::now() < *next_allowed {
                return false;
            }
        }
        let (granted, next_allowed) = manager.request_grow(self);
        if !granted {
            *self.next_grow_allowed.lock() = next_allowed;
        }
        granted
    }

    /// Ask the manager to move this cache onto a table of `log_size`.
    pub fn request_migrate(&self, log_size: u32) -> bool {
        {
            let next_allowed = self.next_migrate_allowed.lock();
            if Instant::now() < *next_allowed {
                return false;
            }
        }
        let manager = match self.manager.upgrade() {
            Some(m) => m,
            None => return false,
        };
        let (granted, next_allowed) = manager.request_migrate(self, log_size);
        if !granted {
            *self.next_migrate_allowed.lock() = next_allowed;
        }
        granted
    }

    /// `(lifetime, windowed)` hit rates in percent.
    pub fn hit_rates(&self) -> (f64, f64) {
        let hits = self.find_hits.load(Ordering::Relaxed) as f64;
        let misses = self.find_misses.load(Ordering::Relaxed) as f64;
        let lifetime = if hits + misses > 0.0 {
            100.0 * hits / (hits + misses)
        } else {
            0.0
        };
        let windowed = match &self.windowed_stats {
            Some(stats) => {
                let digest = stats.simple_digest();
                let mut h = 0u64;
                let mut m = 0u64;
                for (was_hit, count) in digest {
                    if was_hit {
                        h += count;
                    } else {
                        m += count;
                    }
                }
                if h + m > 0 {
                    100.0 * h as f64 / (h + m) as f64
                } else {
                    0.0
                }
            }
            None => lifetime,
        };
        (lifetime, windowed)
    }

    pub fn usage(&self) -> u64 {
        self.metadata.lock().usage
    }

    pub fn limit(&self) -> u64 {
        self.metadata.lock().limit
    }

    pub fn allocated(&self) -> u64 {
        self.metadata.lock().allocated()
    }

    pub fn table_log_size(&self) -> u32 {
        self.table.read().log_size()
    }

    pub fn entry_count(&self) -> usize {
        self.table.read().len()
    }

    // ── manager-side hooks ──────────────────────────────────────────────

    pub(crate) fn metadata(&self) -> &Mutex<Metadata> {
        &self.metadata
    }

    pub(crate) fn mark_shut_down(&self) {
        self.shut_down.store(true, Ordering::Release);
    }

    /// Evict entries until usage fits `target`, adjusting the accounting.
    pub(crate) fn free_memory(&self, target_usage: u64) -> u64 {
        let table = self.table.read().clone();
        let freed = table.evict_until(target_usage);
        if freed > 0 {
            self.metadata.lock().adjust_usage_if_allowed(-(freed as i64));
        }
        freed
    }

    /// Swap in a freshly leased table, draining the old one into it.
    /// Returns the retired table for reclamation.
    pub(crate) fn swap_table(&self, new_table: Arc<Table>) -> Arc<Table> {
        let old = {
            let mut slot = self.table.write();
            std::mem::replace(&mut *slot, Arc::clone(&new_table))
        };
        old.drain_into(&new_table);
        // entries that lost eviction fights during the drain are gone;
        // usage follows the surviving payload
        let mut metadata = self.metadata.lock();
        metadata.swap_table(new_table.memory_usage());
        let survived = new_table.data_usage();
        metadata.usage = survived.min(metadata.limit);
        old
    }

    /// The retired table, for the manager's destroy path.
    pub(crate) fn take_table(&self) -> Arc<Table> {
        self.table.read().clone()
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("id", &self.id)
            .field("type", &self.cache_type)
            .field("usage", &self.usage())
            .field("limit", &self.limit())
            .finish()
    }
}
