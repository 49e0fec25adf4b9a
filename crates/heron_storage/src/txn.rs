//! The transaction state machine.
//!
//! A transaction owns the store transaction (with its begin snapshot), the
//! cache-pool transaction handle, and per-collection operation accounting.
//! Collections must be declared on the state before operations touch them.
//! At commit, the accumulated per-collection deltas flow into the physical
//! collections and the counter manager; at abort everything is rolled back
//! and no counter moves.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use heron_cache::CacheTransaction;
use heron_common::error::{HeronError, HeronResult};
use heron_common::types::{CollectionId, RevisionId, TransactionId};
use heron_lsm::{Snapshot, StoreTransaction, WriteOptions};

use crate::collection::Collection;
use crate::engine::StorageServices;

/// Lifecycle of a transaction. Only level-0 calls drive transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Created,
    Running,
    Committed,
    Aborted,
}

/// Behavior switches set at creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionHints {
    /// Force the commit batch to stable storage.
    pub wait_for_sync: bool,
    /// Recovery/restore work: suppresses waitForSync.
    pub recovery: bool,
    pub read_only: bool,
}

/// Document operation kinds, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Remove,
}

/// Per-collection accounting inside one transaction.
#[derive(Debug, Clone, Copy)]
pub struct TransactionCollection {
    pub num_inserts: u64,
    pub num_removes: u64,
    /// Last revision written to this collection (0 = none).
    pub revision: RevisionId,
    pub operation_size: u64,
}

impl Default for TransactionCollection {
    fn default() -> Self {
        Self {
            num_inserts: 0,
            num_removes: 0,
            revision: RevisionId(0),
            operation_size: 0,
        }
    }
}

/// Registry of live transactions.
#[derive(Debug, Default)]
pub struct TransactionManager {
    running: DashMap<u64, TransactionHints>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: TransactionId, hints: TransactionHints) {
        self.running.insert(id.0, hints);
    }

    pub fn unregister(&self, id: TransactionId) {
        self.running.remove(&id.0);
    }

    pub fn is_registered(&self, id: TransactionId) -> bool {
        self.running.contains_key(&id.0)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

pub struct TransactionState {
    id: TransactionId,
    status: TransactionStatus,
    nesting_level: u32,
    hints: TransactionHints,
    services: Arc<StorageServices>,
    store_txn: Option<StoreTransaction>,
    cache_txn: Option<CacheTransaction>,
    snapshot: Option<Snapshot>,
    collections: HashMap<u64, TransactionCollection>,
    used: HashMap<u64, Arc<Collection>>,
    num_inserts: u64,
    num_updates: u64,
    num_removes: u64,
    operation_size: u64,
}

impl TransactionState {
    pub fn new(services: Arc<StorageServices>, hints: TransactionHints) -> Self {
        Self {
            id: TransactionId(0),
            status: TransactionStatus::Created,
            nesting_level: 0,
            hints,
            services,
            store_txn: None,
            cache_txn: None,
            snapshot: None,
            collections: HashMap::new(),
            used: HashMap::new(),
            num_inserts: 0,
            num_updates: 0,
            num_removes: 0,
            operation_size: 0,
        }
    }

    /// Start the transaction: assign a tick id, register it, open the store
    /// transaction with an immediate snapshot and the cache transaction.
    pub fn begin(&mut self) -> HeronResult<()> {
        if self.nesting_level > 0 {
            debug_assert_eq!(self.status, TransactionStatus::Running);
            return Ok(());
        }
        if self.status != TransactionStatus::Created {
            return Err(HeronError::Internal(format!(
                "cannot begin transaction in status {:?}",
                self.status
            )));
        }

        self.id = TransactionId(self.services.ticks.next_tick());
        self.services.transactions.register(self.id, self.hints);

        self.cache_txn = Some(self.services.cache.begin_transaction(self.hints.read_only));
        let store_txn = self.services.store.begin_transaction();
        self.snapshot = Some(store_txn.snapshot());
        self.store_txn = Some(store_txn);

        self.status = TransactionStatus::Running;
        tracing::trace!(txn = %self.id, read_only = self.hints.read_only, "transaction running");
        Ok(())
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn hints(&self) -> TransactionHints {
        self.hints
    }

    /// The snapshot taken at begin.
    pub fn snapshot(&self) -> HeronResult<Snapshot> {
        self.snapshot
            .ok_or_else(|| HeronError::Internal("transaction has no snapshot".into()))
    }

    /// Enter a nested level. Only level 0 drives lifecycle transitions.
    pub fn nest(&mut self) {
        self.nesting_level += 1;
    }

    pub fn unnest(&mut self) {
        debug_assert!(self.nesting_level > 0);
        self.nesting_level = self.nesting_level.saturating_sub(1);
    }

    pub fn nesting_level(&self) -> u32 {
        self.nesting_level
    }

    /// Declare a collection before operating on it.
    pub fn add_collection(&mut self, collection: &Arc<Collection>) {
        let cid = collection.cid().0;
        self.used.entry(cid).or_insert_with(|| Arc::clone(collection));
        self.collections.entry(cid).or_default();
    }

    pub fn has_operations(&self) -> bool {
        self.num_inserts + self.num_updates + self.num_removes > 0
    }

    pub fn num_inserts(&self) -> u64 {
        self.num_inserts
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    pub fn num_removes(&self) -> u64 {
        self.num_removes
    }

    pub fn operation_size(&self) -> u64 {
        self.operation_size
    }

    pub fn collection_stats(&self, cid: CollectionId) -> Option<TransactionCollection> {
        self.collections.get(&cid.0).copied()
    }

    /// The underlying store transaction, for the document operations layer.
    pub fn store_txn_mut(&mut self) -> HeronResult<&mut StoreTransaction> {
        self.store_txn
            .as_mut()
            .ok_or_else(|| HeronError::Internal("transaction is not running".into()))
    }

    pub fn store_txn(&self) -> HeronResult<&StoreTransaction> {
        self.store_txn
            .as_ref()
            .ok_or_else(|| HeronError::Internal("transaction is not running".into()))
    }

    /// Record one document operation against a declared collection.
    pub fn add_operation(
        &mut self,
        cid: CollectionId,
        revision: RevisionId,
        operation: OperationType,
        size: u64,
    ) -> HeronResult<()> {
        let entry = self.collections.get_mut(&cid.0).ok_or_else(|| {
            HeronError::Internal("collection not found in transaction state".into())
        })?;

        match operation {
            OperationType::Insert => {
                entry.num_inserts += 1;
                self.num_inserts += 1;
            }
            OperationType::Update | OperationType::Replace => {
                self.num_updates += 1;
            }
            OperationType::Remove => {
                entry.num_removes += 1;
                self.num_removes += 1;
            }
        }
        entry.revision = revision;
        entry.operation_size += size;
        self.operation_size += size;
        Ok(())
    }

    fn end_cache_transaction(&mut self) {
        if let Some(cache_txn) = self.cache_txn.take() {
            self.services.cache.end_transaction(cache_txn);
        }
    }

    /// Commit: end the cache transaction, commit the store batch, then fold
    /// the per-collection deltas into the physical collections and the
    /// counter manager. A failed store commit aborts the transaction.
    pub fn commit(mut self) -> HeronResult<()> {
        if self.nesting_level > 0 {
            return Err(HeronError::Internal(
                "commit on a nested transaction level".into(),
            ));
        }
        if self.status != TransactionStatus::Running {
            return Err(HeronError::Internal(format!(
                "cannot commit transaction in status {:?}",
                self.status
            )));
        }

        self.end_cache_transaction();

        let mut options = WriteOptions::default();
        if self.hints.wait_for_sync && !self.hints.recovery {
            options.sync = true;
        }

        let store_txn = self
            .store_txn
            .take()
            .ok_or_else(|| HeronError::Internal("transaction lost its store handle".into()))?;
        let commit_sequence = match store_txn.commit(&options) {
            Ok(sequence) => sequence,
            Err(e) => {
                self.abort_internal();
                return Err(e);
            }
        };

        // counters anchor at the commit sequence: WAL replay applies only
        // batches newer than a counter's sequence, so anchoring any earlier
        // would re-count this transaction's own writes after a restart
        let counter_point = Snapshot(commit_sequence);
        for (cid, stats) in &self.collections {
            if stats.num_inserts == 0 && stats.num_removes == 0 && stats.revision.0 == 0 {
                continue;
            }
            if let Some(collection) = self.used.get(cid) {
                let adjustment = stats.num_inserts as i64 - stats.num_removes as i64;
                collection.adjust_number_documents(adjustment);
                if stats.revision.0 != 0 {
                    collection.set_revision(stats.revision);
                }
                self.services.counters.update(
                    collection.object_id(),
                    counter_point,
                    collection.number_documents(),
                    stats.revision,
                );
            }
        }

        self.status = TransactionStatus::Committed;
        self.services.transactions.unregister(self.id);
        tracing::trace!(txn = %self.id, "transaction committed");
        Ok(())
    }

    /// Abort: end the cache transaction and discard the store buffer.
    pub fn abort(mut self) -> HeronResult<()> {
        if self.status != TransactionStatus::Running {
            return Err(HeronError::Internal(format!(
                "cannot abort transaction in status {:?}",
                self.status
            )));
        }
        self.abort_internal();
        Ok(())
    }

    fn abort_internal(&mut self) {
        self.end_cache_transaction();
        if let Some(store_txn) = self.store_txn.take() {
            store_txn.rollback();
        }
        self.status = TransactionStatus::Aborted;
        self.services.transactions.unregister(self.id);
        tracing::trace!(txn = %self.id, "transaction aborted");
    }
}

impl Drop for TransactionState {
    fn drop(&mut self) {
        if self.status == TransactionStatus::Running {
            self.abort_internal();
        }
    }
}

/// Scoped save-point over the store transaction. Rolls the transaction back
/// to the point of construction unless `commit()` is called — the early
/// return path needs no cleanup code.
pub struct SavePoint<'a> {
    txn: &'a mut StoreTransaction,
    committed: bool,
}

impl<'a> SavePoint<'a> {
    pub fn new(txn: &'a mut StoreTransaction) -> Self {
        txn.set_savepoint();
        Self {
            txn,
            committed: false,
        }
    }

    pub fn txn(&mut self) -> &mut StoreTransaction {
        self.txn
    }

    /// Keep the writes recorded since construction.
    pub fn commit(mut self) -> HeronResult<()> {
        self.txn.release_savepoint()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for SavePoint<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.txn.rollback_to_savepoint();
        }
    }
}
