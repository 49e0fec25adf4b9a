//! Durable per-object document counters.
//!
//! Counters are a cached aggregate: the store itself is the authority. Each
//! entry records the count, the latest revision and the store sequence
//! number it is valid at. A background worker persists dirty counters
//! periodically; on startup the persisted values are reconciled against the
//! write-ahead log so counts survive a crash between two syncs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use heron_common::config::CounterConfig;
use heron_common::error::{HeronError, HeronResult};
use heron_common::shutdown::ShutdownSignal;
use heron_common::types::{ObjectId, RevisionId, SequenceNumber};
use heron_lsm::{BatchHandler, Snapshot, TreeStore, WriteBatch, WriteOptions};

use crate::bounds::KeyBounds;
use crate::keys::{self, EntryType, Key};

/// One counter: valid as of `sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub sequence: SequenceNumber,
    pub count: u64,
    pub revision: RevisionId,
}

#[derive(Default)]
struct CounterMaps {
    current: HashMap<u64, Counter>,
    synced: HashMap<u64, Counter>,
}

pub struct CounterManager {
    store: Arc<TreeStore>,
    maps: RwLock<CounterMaps>,
    syncing: AtomicBool,
    interval: Duration,
    signal: ShutdownSignal,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CounterManager {
    /// Construct synchronously: loads persisted counters, reconciles them
    /// against the write-ahead log, and syncs if anything was recovered.
    pub fn new(store: Arc<TreeStore>, config: &CounterConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            store,
            maps: RwLock::new(CounterMaps::default()),
            syncing: AtomicBool::new(false),
            interval: Duration::from_secs_f64(config.sync_interval_secs.max(0.001)),
            signal: ShutdownSignal::new(),
            worker: Mutex::new(None),
        });

        manager.read_counter_values();
        let have_counters = !manager.maps.read().current.is_empty();
        if have_counters && manager.replay_wal() {
            if let Err(e) = manager.sync() {
                tracing::warn!(error = %e, "counter sync after recovery failed");
            }
        }
        manager
    }

    /// Start the periodic sync worker.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let signal = self.signal.clone();
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name("heron-counter-sync".into())
            .spawn(move || {
                while !signal.wait_timeout(interval) {
                    if let Err(e) = manager.sync() {
                        tracing::warn!(error = %e, "periodic counter sync failed");
                    }
                }
            })
            .expect("failed to spawn counter sync worker");
        *self.worker.lock() = Some(handle);
    }

    /// `(count, latest revision)` for an object; `(0, 0)` if unknown.
    /// Does not create an entry.
    pub fn load(&self, object_id: ObjectId) -> (u64, RevisionId) {
        let maps = self.maps.read();
        match maps.current.get(&object_id.0) {
            Some(counter) => (counter.count, counter.revision),
            None => (0, RevisionId(0)),
        }
    }

    /// Install a counter value as of the committing transaction's snapshot.
    pub fn update(
        &self,
        object_id: ObjectId,
        snapshot: Snapshot,
        count: u64,
        revision: RevisionId,
    ) {
        let mut maps = self.maps.write();
        maps.current.insert(
            object_id.0,
            Counter {
                sequence: snapshot.sequence(),
                count,
                revision,
            },
        );
    }

    /// Drop an object's counter from memory and from the store.
    pub fn remove(&self, object_id: ObjectId) -> HeronResult<()> {
        let mut maps = self.maps.write();
        if maps.current.remove(&object_id.0).is_some() {
            maps.synced.remove(&object_id.0);
            self.store
                .delete(Key::counter_value(object_id).as_slice())?;
        }
        Ok(())
    }

    /// Persist every counter whose sequence differs from its synced value,
    /// as one atomic batch. Advances the synced snapshot only on success; a
    /// failed write leaves all state unchanged and surfaces the error.
    pub fn sync(&self) -> HeronResult<bool> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        let result = self.sync_inner();
        self.syncing.store(false, Ordering::SeqCst);
        result
    }

    fn sync_inner(&self) -> HeronResult<bool> {
        let snapshot: HashMap<u64, Counter> = {
            let maps = self.maps.read();
            maps.current.clone()
        };

        let mut batch = WriteBatch::new();
        {
            let maps = self.maps.read();
            for (&object_id, counter) in &snapshot {
                // skip values which did not change since the last sync
                if maps
                    .synced
                    .get(&object_id)
                    .is_some_and(|synced| synced.sequence == counter.sequence)
                {
                    continue;
                }
                let value = bincode::serialize(counter)
                    .map_err(|e| HeronError::Internal(format!("counter encode: {e}")))?;
                batch.put(
                    Key::counter_value(ObjectId(object_id)).into_bytes(),
                    value,
                );
            }
        }

        if batch.is_empty() {
            return Ok(false);
        }

        self.store.write(batch, &WriteOptions { sync: true })?;
        self.maps.write().synced = snapshot;
        Ok(true)
    }

    /// Populate both maps from the persisted counter records.
    fn read_counter_values(&self) {
        let bounds = KeyBounds::counter_values();
        let mut maps = self.maps.write();
        self.store.iterate(
            bounds.start(),
            bounds.end(),
            &Default::default(),
            |key, value| {
                match (
                    keys::decode_counter(key),
                    bincode::deserialize::<Counter>(value),
                ) {
                    (Ok(object_id), Ok(counter)) => {
                        maps.current.insert(object_id.0, counter);
                    }
                    _ => {
                        tracing::warn!(?key, "skipping unreadable counter record");
                    }
                }
                true
            },
        );
        maps.synced = maps.current.clone();
        tracing::debug!(counters = maps.current.len(), "counter values loaded");
    }

    /// Replay write batches newer than the oldest synced counter, adjusting
    /// counts for document writes the counters have not seen. Returns true
    /// when anything was adjusted. A failed iteration abandons recovery and
    /// keeps the current values.
    fn replay_wal(&self) -> bool {
        let mut maps = self.maps.write();

        let min_sequence = maps
            .synced
            .values()
            .map(|c| c.sequence)
            .min()
            .unwrap_or(u64::MAX);
        if min_sequence == u64::MAX {
            return false;
        }

        let updates = match self.store.updates_since(min_sequence) {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!(error = %e, "WAL replay failed, keeping persisted counters");
                return false;
            }
        };

        let mut replayer = WalReplayer {
            counters: &mut maps.current,
            batch_sequence: 0,
            recovered: false,
        };
        for entry in updates {
            if entry.sequence <= min_sequence {
                continue;
            }
            replayer.batch_sequence = entry.sequence;
            entry.batch.iterate(&mut replayer);
        }
        if replayer.recovered {
            tracing::info!("document counters adjusted from WAL replay");
        }
        replayer.recovered
    }

    /// Signal the worker; it exits before its next wait resolves.
    pub fn begin_shutdown(&self) {
        self.signal.shutdown();
    }

    /// Join the worker and flush counters one final time.
    pub fn shutdown(&self) -> HeronResult<()> {
        self.begin_shutdown();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
        self.sync()?;
        Ok(())
    }
}

/// Batch handler adjusting counters for document operations newer than each
/// counter's own sequence.
struct WalReplayer<'a> {
    counters: &'a mut HashMap<u64, Counter>,
    batch_sequence: SequenceNumber,
    recovered: bool,
}

impl WalReplayer<'_> {
    fn adjust(&mut self, key: &[u8], delta: i64) {
        if keys::entry_type(key) != Some(EntryType::Document) {
            return;
        }
        let (object_id, revision) = match keys::decode_document(key) {
            Ok(parts) => parts,
            Err(_) => return,
        };
        if let Some(counter) = self.counters.get_mut(&object_id.0) {
            if counter.sequence < self.batch_sequence {
                if delta > 0 {
                    counter.count += 1;
                } else {
                    counter.count = counter.count.saturating_sub(1);
                }
                counter.revision = revision;
                self.recovered = true;
            }
        }
    }
}

impl BatchHandler for WalReplayer<'_> {
    fn put(&mut self, key: &[u8], _value: &[u8]) {
        self.adjust(key, 1);
    }

    fn delete(&mut self, key: &[u8]) {
        self.adjust(key, -1);
    }

    fn single_delete(&mut self, key: &[u8]) {
        self.adjust(key, -1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_lsm::StoreConfig;

    fn open_store(dir: &tempfile::TempDir) -> Arc<TreeStore> {
        TreeStore::open(dir.path(), StoreConfig::default()).unwrap()
    }

    fn manager(store: &Arc<TreeStore>) -> Arc<CounterManager> {
        CounterManager::new(Arc::clone(store), &CounterConfig::default())
    }

    #[test]
    fn test_load_absent_returns_zero() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);
        let counters = manager(&store);
        assert_eq!(counters.load(ObjectId(99)), (0, RevisionId(0)));
    }

    #[test]
    fn test_update_load_and_sync_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);
        let counters = manager(&store);

        let snapshot = store.snapshot();
        counters.update(ObjectId(1), snapshot, 5, RevisionId(42));
        assert_eq!(counters.load(ObjectId(1)), (5, RevisionId(42)));

        assert!(counters.sync().unwrap());
        // a second sync has nothing to write
        assert!(!counters.sync().unwrap());

        // after sync, the persisted value matches memory
        let fresh = manager(&store);
        assert_eq!(fresh.load(ObjectId(1)), (5, RevisionId(42)));
    }

    #[test]
    fn test_remove_deletes_persisted_record() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);
        let counters = manager(&store);

        counters.update(ObjectId(1), store.snapshot(), 3, RevisionId(7));
        counters.sync().unwrap();
        counters.remove(ObjectId(1)).unwrap();
        assert_eq!(counters.load(ObjectId(1)), (0, RevisionId(0)));

        let fresh = manager(&store);
        assert_eq!(fresh.load(ObjectId(1)), (0, RevisionId(0)));
    }

    #[test]
    fn test_recovery_without_synced_counters_skips_wal() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);
        // some unrelated writes in the WAL
        store.put(b"unrelated", b"x").unwrap();
        let counters = manager(&store);
        assert_eq!(counters.load(ObjectId(1)), (0, RevisionId(0)));
    }

    #[test]
    fn test_recovery_replays_document_writes_after_sync_point() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);

        // one document exists and the counter knows about it
        store
            .put(Key::document(ObjectId(1), RevisionId(10)).as_slice(), b"{}")
            .unwrap();
        {
            let counters = manager(&store);
            counters.update(ObjectId(1), store.snapshot(), 1, RevisionId(10));
            counters.sync().unwrap();
        }

        // two more inserts and one remove happen after the sync point,
        // as if the process crashed before the next sync
        store
            .put(Key::document(ObjectId(1), RevisionId(11)).as_slice(), b"{}")
            .unwrap();
        store
            .put(Key::document(ObjectId(1), RevisionId(12)).as_slice(), b"{}")
            .unwrap();
        store
            .delete(Key::document(ObjectId(1), RevisionId(10)).as_slice())
            .unwrap();

        let recovered = manager(&store);
        let (count, revision) = recovered.load(ObjectId(1));
        assert_eq!(count, 2);
        assert_eq!(revision, RevisionId(10), "revision follows the last WAL record");
    }

    #[test]
    fn test_recovery_ignores_foreign_objects_and_non_document_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);

        {
            let counters = manager(&store);
            counters.update(ObjectId(1), store.snapshot(), 0, RevisionId(0));
            counters.sync().unwrap();
        }

        // writes for an object with no counter, plus non-document keys
        store
            .put(Key::document(ObjectId(2), RevisionId(5)).as_slice(), b"{}")
            .unwrap();
        store
            .put(Key::counter_value(ObjectId(1)).as_slice(), b"junk-overwritten-later")
            .unwrap();

        let recovered = manager(&store);
        assert_eq!(recovered.load(ObjectId(2)), (0, RevisionId(0)));
    }

    #[test]
    fn test_background_worker_syncs_and_shuts_down() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);
        let counters = CounterManager::new(
            Arc::clone(&store),
            &CounterConfig {
                sync_interval_secs: 0.02,
            },
        );
        counters.start();
        counters.update(ObjectId(9), store.snapshot(), 4, RevisionId(1));

        // wait for the worker to pick it up
        let mut synced = false;
        for _ in 0..100 {
            std::thread::sleep(Duration::from_millis(10));
            let fresh = manager(&store);
            if fresh.load(ObjectId(9)) == (4, RevisionId(1)) {
                synced = true;
                break;
            }
        }
        assert!(synced, "background worker never synced the counter");
        counters.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_performs_final_sync() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);
        let counters = manager(&store);
        counters.update(ObjectId(3), store.snapshot(), 7, RevisionId(70));
        counters.shutdown().unwrap();

        let fresh = manager(&store);
        assert_eq!(fresh.load(ObjectId(3)), (7, RevisionId(70)));
    }
}
