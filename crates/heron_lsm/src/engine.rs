//! The tree store: a durable, multiversion ordered key-value map.
//!
//! Writes go through atomic batches. Each batch is assigned the next
//! sequence number, appended to the batch log and then applied to the
//! in-memory version chains under one write lock — a reader therefore sees
//! either all of a batch or none of it. A snapshot is nothing more than a
//! pinned sequence number; reads resolve each key to the newest version at
//! or below the pin.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use heron_common::error::HeronResult;
use heron_common::types::SequenceNumber;

use crate::batch::{WriteBatch, WriteOp};
use crate::txn::StoreTransaction;
use crate::wal::{BatchLog, LogEntry};

/// Store tuning knobs.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Force every committed batch to stable storage.
    pub sync_writes: bool,
    /// How many recent batches to keep in memory for `updates_since`;
    /// older requests fall back to reading the batch log from disk.
    pub retained_batches: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_writes: false,
            retained_batches: 16 * 1024,
        }
    }
}

/// A consistent read point: the highest sequence number visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Snapshot(pub SequenceNumber);

impl Snapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.0
    }
}

/// Per-read options. Without a snapshot, reads see the latest state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub snapshot: Option<Snapshot>,
}

impl ReadOptions {
    pub fn at(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
        }
    }
}

/// Per-write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Force this batch to stable storage before returning (waitForSync).
    pub sync: bool,
}

#[derive(Debug, Clone)]
struct Version {
    sequence: SequenceNumber,
    /// `None` is a tombstone.
    value: Option<Vec<u8>>,
}

#[derive(Default)]
struct StoreInner {
    data: BTreeMap<Vec<u8>, Vec<Version>>,
    /// Recent batches for fast tailing, oldest first.
    recent: VecDeque<LogEntry>,
}

/// The store itself. Shared via `Arc`; all methods take `&self`.
pub struct TreeStore {
    inner: RwLock<StoreInner>,
    log: Mutex<BatchLog>,
    sequence: AtomicU64,
    config: StoreConfig,
}

impl TreeStore {
    /// Open the store at `path`, replaying the batch log into memory.
    pub fn open(path: &Path, config: StoreConfig) -> HeronResult<Arc<Self>> {
        let (log, entries) = BatchLog::open(path)?;

        let mut inner = StoreInner::default();
        let mut last_sequence = 0;
        for entry in entries {
            apply_batch(&mut inner.data, entry.sequence, &entry.batch);
            last_sequence = last_sequence.max(entry.sequence);
            push_recent(&mut inner.recent, entry, config.retained_batches);
        }

        tracing::debug!(
            sequence = last_sequence,
            keys = inner.data.len(),
            "tree store opened"
        );

        Ok(Arc::new(Self {
            inner: RwLock::new(inner),
            log: Mutex::new(log),
            sequence: AtomicU64::new(last_sequence),
            config,
        }))
    }

    /// The sequence number of the most recent write.
    pub fn latest_sequence(&self) -> SequenceNumber {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Pin the current state for repeatable reads.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.latest_sequence())
    }

    /// Point read under the given options.
    pub fn get(&self, key: &[u8], options: &ReadOptions) -> Option<Vec<u8>> {
        let visible = options.snapshot.map(|s| s.0).unwrap_or(u64::MAX);
        let inner = self.inner.read();
        resolve(inner.data.get(key), visible)
    }

    /// Apply a batch atomically. Returns the assigned sequence number.
    pub fn write(&self, batch: WriteBatch, options: &WriteOptions) -> HeronResult<SequenceNumber> {
        if batch.is_empty() {
            return Ok(self.latest_sequence());
        }

        // The log append and the in-memory apply happen under the write
        // lock, so sequence numbers are assigned in application order and
        // tailing never observes gaps.
        let mut inner = self.inner.write();
        let sequence = self.sequence.load(Ordering::SeqCst) + 1;
        let entry = LogEntry { sequence, batch };

        {
            let mut log = self.log.lock();
            log.append(&entry, options.sync || self.config.sync_writes)?;
        }

        apply_batch(&mut inner.data, sequence, &entry.batch);
        push_recent(&mut inner.recent, entry, self.config.retained_batches);
        self.sequence.store(sequence, Ordering::SeqCst);
        Ok(sequence)
    }

    /// Autocommit single put.
    pub fn put(&self, key: &[u8], value: &[u8]) -> HeronResult<SequenceNumber> {
        let mut batch = WriteBatch::new();
        batch.put(key.to_vec(), value.to_vec());
        self.write(batch, &WriteOptions::default())
    }

    /// Autocommit single delete.
    pub fn delete(&self, key: &[u8]) -> HeronResult<SequenceNumber> {
        let mut batch = WriteBatch::new();
        batch.delete(key.to_vec());
        self.write(batch, &WriteOptions::default())
    }

    /// Forward iteration over live keys in `[start, end)`. The callback
    /// returns `false` to stop early.
    pub fn iterate(
        &self,
        start: &[u8],
        end: &[u8],
        options: &ReadOptions,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) {
        let visible = options.snapshot.map(|s| s.0).unwrap_or(u64::MAX);
        let inner = self.inner.read();
        let range = (
            Bound::Included(start.to_vec()),
            Bound::Excluded(end.to_vec()),
        );
        for (key, versions) in inner.data.range(range) {
            if let Some(value) = resolve(Some(versions), visible) {
                if !f(key, &value) {
                    break;
                }
            }
        }
    }

    /// Count live keys in `[start, end)`.
    pub fn count_range(&self, start: &[u8], end: &[u8], options: &ReadOptions) -> u64 {
        let mut count = 0;
        self.iterate(start, end, options, |_, _| {
            count += 1;
            true
        });
        count
    }

    /// Delete every live key in `[start, end)` as one atomic batch. Used to
    /// drop whole collections and indexes.
    pub fn delete_range(&self, start: &[u8], end: &[u8]) -> HeronResult<u64> {
        let mut batch = WriteBatch::new();
        self.iterate(start, end, &ReadOptions::default(), |key, _| {
            batch.delete(key.to_vec());
            true
        });
        let removed = batch.len() as u64;
        if removed > 0 {
            self.write(batch, &WriteOptions::default())?;
        }
        Ok(removed)
    }

    /// All batches with a sequence number strictly greater than `since`,
    /// oldest first. Falls back to the on-disk log when the request reaches
    /// further back than the retained tail.
    pub fn updates_since(&self, since: SequenceNumber) -> HeronResult<Vec<LogEntry>> {
        if self.latest_sequence() <= since {
            return Ok(Vec::new());
        }
        {
            let inner = self.inner.read();
            if let Some(first) = inner.recent.front() {
                if first.sequence <= since + 1 {
                    return Ok(inner
                        .recent
                        .iter()
                        .filter(|e| e.sequence > since)
                        .cloned()
                        .collect());
                }
            }
        }
        // retained tail is too short; read the full log
        let all = self.log.lock().read_all()?;
        Ok(all.into_iter().filter(|e| e.sequence > since).collect())
    }

    /// Begin a pessimistic transaction with an immediate snapshot.
    pub fn begin_transaction(self: &Arc<Self>) -> StoreTransaction {
        StoreTransaction::begin(Arc::clone(self))
    }

    /// Force the batch log to stable storage.
    pub fn flush(&self) -> HeronResult<()> {
        self.log.lock().sync()
    }

    /// Rough memory footprint of the live data set, for observability.
    pub fn approximate_memory_usage(&self) -> u64 {
        let inner = self.inner.read();
        inner
            .data
            .iter()
            .map(|(k, versions)| {
                k.len() as u64
                    + versions
                        .iter()
                        .map(|v| 16 + v.value.as_ref().map(|b| b.len()).unwrap_or(0) as u64)
                        .sum::<u64>()
            })
            .sum()
    }
}

impl std::fmt::Debug for TreeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeStore")
            .field("sequence", &self.latest_sequence())
            .field("keys", &self.inner.read().data.len())
            .finish()
    }
}

fn apply_batch(
    data: &mut BTreeMap<Vec<u8>, Vec<Version>>,
    sequence: SequenceNumber,
    batch: &WriteBatch,
) {
    for op in batch.ops() {
        let (key, value) = match op {
            WriteOp::Put { key, value } => (key, Some(value.clone())),
            WriteOp::Delete { key } | WriteOp::SingleDelete { key } => (key, None),
        };
        data.entry(key.clone())
            .or_default()
            .push(Version { sequence, value });
    }
}

fn push_recent(recent: &mut VecDeque<LogEntry>, entry: LogEntry, cap: usize) {
    if cap == 0 {
        return;
    }
    if recent.len() >= cap {
        recent.pop_front();
    }
    recent.push_back(entry);
}

fn resolve(versions: Option<&Vec<Version>>, visible: SequenceNumber) -> Option<Vec<u8>> {
    versions?
        .iter()
        .rev()
        .find(|v| v.sequence <= visible)
        .and_then(|v| v.value.clone())
}
