//! Pessimistic store transactions.
//!
//! A transaction pins a snapshot at begin, buffers its writes, and applies
//! them as one atomic batch at commit. Reads observe the transaction's own
//! uncommitted writes first and the begin snapshot for everything else.
//! Save-points are watermarks into the write buffer: rolling back to one
//! discards the operations recorded since, without touching the rest.

use std::sync::Arc;

use heron_common::error::{HeronError, HeronResult};
use heron_common::types::SequenceNumber;

use crate::batch::{WriteBatch, WriteOp};
use crate::engine::{ReadOptions, Snapshot, TreeStore, WriteOptions};

/// A transaction handle. Obtained from [`TreeStore::begin_transaction`].
pub struct StoreTransaction {
    store: Arc<TreeStore>,
    snapshot: Snapshot,
    ops: Vec<WriteOp>,
    savepoints: Vec<usize>,
    finished: bool,
}

impl StoreTransaction {
    pub(crate) fn begin(store: Arc<TreeStore>) -> Self {
        let snapshot = store.snapshot();
        Self {
            store,
            snapshot,
            ops: Vec::new(),
            savepoints: Vec::new(),
            finished: false,
        }
    }

    /// The snapshot taken at begin.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    /// Whether any write has been buffered.
    pub fn has_operations(&self) -> bool {
        !self.ops.is_empty()
    }

    pub fn num_operations(&self) -> usize {
        self.ops.len()
    }

    /// Read-own-writes get: the newest buffered operation for `key` wins,
    /// otherwise the begin snapshot is consulted.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        for op in self.ops.iter().rev() {
            match op {
                WriteOp::Put { key: k, value } if k == key => return Some(value.clone()),
                WriteOp::Delete { key: k } | WriteOp::SingleDelete { key: k } if k == key => {
                    return None
                }
                _ => {}
            }
        }
        self.store.get(key, &ReadOptions::at(self.snapshot))
    }

    /// Iterate `[start, end)` as the transaction sees it: buffered writes
    /// overlay the begin snapshot.
    pub fn iterate(&self, start: &[u8], end: &[u8], mut f: impl FnMut(&[u8], &[u8]) -> bool) {
        use std::collections::BTreeMap;

        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        self.store
            .iterate(start, end, &ReadOptions::at(self.snapshot), |k, v| {
                merged.insert(k.to_vec(), Some(v.to_vec()));
                true
            });
        for op in &self.ops {
            let key = op.key();
            if key >= start && key < end {
                match op {
                    WriteOp::Put { value, .. } => {
                        merged.insert(key.to_vec(), Some(value.clone()));
                    }
                    WriteOp::Delete { .. } | WriteOp::SingleDelete { .. } => {
                        merged.insert(key.to_vec(), None);
                    }
                }
            }
        }
        for (key, value) in merged {
            if let Some(value) = value {
                if !f(&key, &value) {
                    break;
                }
            }
        }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete { key: key.into() });
    }

    pub fn single_delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::SingleDelete { key: key.into() });
    }

    /// Set a save-point at the current write position. Save-points nest.
    pub fn set_savepoint(&mut self) {
        self.savepoints.push(self.ops.len());
    }

    /// Discard every operation recorded since the most recent save-point.
    pub fn rollback_to_savepoint(&mut self) -> HeronResult<()> {
        let mark = self
            .savepoints
            .pop()
            .ok_or_else(|| HeronError::Internal("no save-point to roll back to".into()))?;
        self.ops.truncate(mark);
        Ok(())
    }

    /// Drop the most recent save-point, keeping its writes.
    pub fn release_savepoint(&mut self) -> HeronResult<()> {
        self.savepoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| HeronError::Internal("no save-point to release".into()))
    }

    /// Apply the buffered writes as one atomic batch. Returns the batch's
    /// sequence number (or the current store sequence for an empty
    /// transaction, which writes nothing).
    pub fn commit(mut self, options: &WriteOptions) -> HeronResult<SequenceNumber> {
        self.finished = true;
        let ops = std::mem::take(&mut self.ops);
        self.store.write(WriteBatch::from_ops(ops), options)
    }

    /// Discard all buffered writes.
    pub fn rollback(mut self) {
        self.finished = true;
        self.ops.clear();
    }
}

impl Drop for StoreTransaction {
    fn drop(&mut self) {
        if !self.finished && !self.ops.is_empty() {
            tracing::debug!(
                buffered_ops = self.ops.len(),
                "store transaction dropped without commit, discarding writes"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StoreConfig;

    fn open_store(dir: &tempfile::TempDir) -> Arc<TreeStore> {
        TreeStore::open(dir.path(), StoreConfig::default()).unwrap()
    }

    #[test]
    fn test_commit_makes_writes_visible_atomically() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut txn = store.begin_transaction();
        txn.put(b"a".to_vec(), b"1".to_vec());
        txn.put(b"b".to_vec(), b"2".to_vec());

        // invisible before commit
        assert_eq!(store.get(b"a", &ReadOptions::default()), None);

        let seq = txn.commit(&WriteOptions::default()).unwrap();
        assert_eq!(seq, store.latest_sequence());
        assert_eq!(store.get(b"a", &ReadOptions::default()), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b", &ReadOptions::default()), Some(b"2".to_vec()));
    }

    #[test]
    fn test_rollback_discards_everything() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut txn = store.begin_transaction();
        txn.put(b"x".to_vec(), b"1".to_vec());
        txn.rollback();

        assert_eq!(store.get(b"x", &ReadOptions::default()), None);
    }

    #[test]
    fn test_read_own_writes_and_snapshot_for_the_rest() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);
        store.put(b"shared", b"before").unwrap();

        let mut txn = store.begin_transaction();
        txn.put(b"mine".to_vec(), b"draft".to_vec());

        // concurrent external write, after our snapshot
        store.put(b"shared", b"after").unwrap();

        assert_eq!(txn.get(b"mine"), Some(b"draft".to_vec()));
        assert_eq!(txn.get(b"shared"), Some(b"before".to_vec()));

        txn.delete(b"mine".to_vec());
        assert_eq!(txn.get(b"mine"), None);
    }

    #[test]
    fn test_savepoint_rollback_is_scoped() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut txn = store.begin_transaction();
        txn.put(b"keep".to_vec(), b"1".to_vec());
        txn.set_savepoint();
        txn.put(b"discard".to_vec(), b"2".to_vec());
        txn.delete(b"keep".to_vec());
        txn.rollback_to_savepoint().unwrap();

        txn.commit(&WriteOptions::default()).unwrap();
        assert_eq!(store.get(b"keep", &ReadOptions::default()), Some(b"1".to_vec()));
        assert_eq!(store.get(b"discard", &ReadOptions::default()), None);
    }

    #[test]
    fn test_savepoints_nest() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut txn = store.begin_transaction();
        txn.set_savepoint();
        txn.put(b"a".to_vec(), b"1".to_vec());
        txn.set_savepoint();
        txn.put(b"b".to_vec(), b"2".to_vec());

        txn.rollback_to_savepoint().unwrap(); // drops b
        txn.rollback_to_savepoint().unwrap(); // drops a
        assert!(!txn.has_operations());
        assert!(txn.rollback_to_savepoint().is_err());
    }

    #[test]
    fn test_release_savepoint_keeps_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut txn = store.begin_transaction();
        txn.set_savepoint();
        txn.put(b"kept".to_vec(), b"v".to_vec());
        txn.release_savepoint().unwrap();
        txn.commit(&WriteOptions::default()).unwrap();

        assert_eq!(store.get(b"kept", &ReadOptions::default()), Some(b"v".to_vec()));
    }

    #[test]
    fn test_transaction_iterate_overlays_buffer() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);
        store.put(b"d1", b"old").unwrap();
        store.put(b"d2", b"old").unwrap();

        let mut txn = store.begin_transaction();
        txn.put(b"d3".to_vec(), b"new".to_vec());
        txn.delete(b"d1".to_vec());

        let mut seen = Vec::new();
        txn.iterate(b"d", b"e", |k, v| {
            seen.push((k.to_vec(), v.to_vec()));
            true
        });
        assert_eq!(
            seen,
            vec![
                (b"d2".to_vec(), b"old".to_vec()),
                (b"d3".to_vec(), b"new".to_vec()),
            ]
        );
    }
}
