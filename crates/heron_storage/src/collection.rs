//! The physical collection: CRUD on one collection's documents and indexes.
//!
//! All writes route through a running transaction state and are wrapped in
//! a save-point, so a rejected index entry (unique constraint, malformed
//! edge) unwinds the document write without aborting the outer transaction.
//! The in-memory document count and revision move at commit, not here.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use heron_cache::CacheType;
use heron_common::error::{HeronError, HeronResult};
use heron_common::types::{
    attrs, CollectionId, CollectionType, DatabaseId, IndexId, ObjectId, RevisionId,
};

use crate::bounds::KeyBounds;
use crate::engine::StorageServices;
use crate::index::{Index, IndexDescriptor, IndexKind};
use crate::keys::Key;
use crate::txn::{OperationType, SavePoint, TransactionState};

/// Persisted collection metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: CollectionId,
    pub name: String,
    #[serde(rename = "type")]
    pub collection_type: CollectionType,
    pub object_id: ObjectId,
    pub database_id: DatabaseId,
}

/// Per-operation switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationOptions {
    /// Skip the revision precondition check.
    pub ignore_revs: bool,
    /// Restore semantics: the caller replays replicated data.
    pub is_restore: bool,
    /// Expected revision for update/replace/remove when not ignoring revs.
    pub expected_revision: Option<RevisionId>,
}

impl OperationOptions {
    pub fn restore() -> Self {
        Self {
            ignore_revs: true,
            is_restore: true,
            expected_revision: None,
        }
    }
}

/// Outcome of a successful document write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentResult {
    pub key: String,
    pub revision: RevisionId,
}

/// A document read. The payload stays valid independently of later reads.
#[derive(Debug, Clone)]
pub struct ManagedDocument {
    pub revision: RevisionId,
    pub data: Vec<u8>,
}

impl ManagedDocument {
    pub fn value(&self) -> HeronResult<Value> {
        serde_json::from_slice(&self.data)
            .map_err(|e| HeronError::Corrupted(format!("stored document unreadable: {e}")))
    }
}

pub struct Collection {
    info: CollectionInfo,
    indexes: RwLock<Vec<Index>>,
    number_documents: AtomicI64,
    revision: AtomicU64,
    services: Arc<StorageServices>,
    document_cache: Option<Arc<heron_cache::Cache>>,
}

impl Collection {
    pub fn new(
        info: CollectionInfo,
        indexes: Vec<IndexDescriptor>,
        services: Arc<StorageServices>,
    ) -> Arc<Self> {
        let (count, revision) = services.counters.load(info.object_id);
        let document_cache = services
            .cache
            .create_cache(CacheType::Transactional, false, u64::MAX);
        Arc::new(Self {
            info,
            indexes: RwLock::new(indexes.into_iter().map(Index::new).collect()),
            number_documents: AtomicI64::new(count as i64),
            revision: AtomicU64::new(revision.0),
            services,
            document_cache,
        })
    }

    pub fn info(&self) -> &CollectionInfo {
        &self.info
    }

    pub fn cid(&self) -> CollectionId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn object_id(&self) -> ObjectId {
        self.info.object_id
    }

    pub fn collection_type(&self) -> CollectionType {
        self.info.collection_type
    }

    /// System collections (names starting with `_`) refuse drops.
    pub fn is_system(&self) -> bool {
        self.info.name.starts_with('_')
    }

    pub fn number_documents(&self) -> u64 {
        self.number_documents.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn adjust_number_documents(&self, adjustment: i64) {
        self.number_documents.fetch_add(adjustment, Ordering::SeqCst);
    }

    pub fn revision(&self) -> RevisionId {
        RevisionId(self.revision.load(Ordering::SeqCst))
    }

    pub fn set_revision(&self, revision: RevisionId) {
        self.revision.store(revision.0, Ordering::SeqCst);
    }

    pub fn index_descriptors(&self) -> Vec<IndexDescriptor> {
        self.indexes
            .read()
            .iter()
            .map(|i| i.descriptor().clone())
            .collect()
    }

    fn primary_index_id(&self) -> HeronResult<IndexId> {
        self.indexes
            .read()
            .iter()
            .find(|i| i.kind() == IndexKind::Primary)
            .map(|i| i.id())
            .ok_or_else(|| HeronError::Internal("collection lost its primary index".into()))
    }

    /// Inventory entry: `{parameters, indexes}`.
    pub fn to_inventory(&self) -> Value {
        json!({
            "parameters": {
                "id": self.info.id.0.to_string(),
                "name": self.info.name,
                "type": self.info.collection_type,
                "objectId": self.info.object_id.0.to_string(),
                "count": self.number_documents(),
                "revision": self.revision().0.to_string(),
                "deleted": false,
            },
            "indexes": self.index_descriptors(),
        })
    }

    // ── reads ───────────────────────────────────────────────────────────

    /// Resolve a `_key` to the live revision under the transaction's view.
    pub fn lookup_revision(
        &self,
        state: &TransactionState,
        key: &str,
    ) -> HeronResult<Option<RevisionId>> {
        let index_id = self.primary_index_id()?;
        let entry = Key::primary_index_value(index_id, key);
        match state.store_txn()?.get(entry.as_slice()) {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    HeronError::Corrupted("primary index entry has a bad length".into())
                })?;
                Ok(Some(RevisionId(u64::from_be_bytes(raw))))
            }
            None => Ok(None),
        }
    }

    /// Read a document by `_key`. The primary index resolves the revision
    /// under the transaction's snapshot; the payload for that exact
    /// revision may then come from the document cache. Cache entries are
    /// keyed by `(key, revision)`, so a cached payload can never leak a
    /// version the snapshot must not see.
    pub fn read_document(
        &self,
        state: &TransactionState,
        key: &str,
    ) -> HeronResult<ManagedDocument> {
        let revision = self
            .lookup_revision(state, key)?
            .ok_or_else(|| HeronError::NotFound(format!("document '{key}'")))?;

        if let Some(cache) = &self.document_cache {
            if let Some(data) = cache.find(self.cache_key(key, revision).as_slice()) {
                return Ok(ManagedDocument { revision, data });
            }
        }

        let document = self.read_revision(state, revision)?;
        if let Some(cache) = &self.document_cache {
            cache.insert(self.cache_key(key, revision).as_slice(), &document.data);
        }
        Ok(document)
    }

    /// Read a document by revision token.
    pub fn read_revision(
        &self,
        state: &TransactionState,
        revision: RevisionId,
    ) -> HeronResult<ManagedDocument> {
        let doc_key = Key::document(self.info.object_id, revision);
        let data = state
            .store_txn()?
            .get(doc_key.as_slice())
            .ok_or_else(|| HeronError::NotFound(format!("document revision {revision}")))?;
        Ok(ManagedDocument { revision, data })
    }

    /// Walk every live document under the transaction's view, up to `limit`
    /// (0 = unlimited). The callback returns `false` to stop.
    pub fn for_each_document(
        &self,
        state: &TransactionState,
        limit: usize,
        mut f: impl FnMut(RevisionId, &[u8]) -> bool,
    ) -> HeronResult<u64> {
        let bounds = KeyBounds::collection_documents(self.info.object_id);
        let mut seen = 0u64;
        state.store_txn()?.iterate(bounds.start(), bounds.end(), |key, value| {
            if limit > 0 && seen as usize >= limit {
                return false;
            }
            let revision = crate::keys::revision_id(key).unwrap_or(RevisionId(0));
            seen += 1;
            f(revision, value)
        });
        Ok(seen)
    }

    fn cache_key(&self, key: &str, revision: RevisionId) -> Vec<u8> {
        let mut bytes = self.info.object_id.0.to_be_bytes().to_vec();
        bytes.extend_from_slice(&revision.0.to_be_bytes());
        bytes.extend_from_slice(key.as_bytes());
        bytes
    }

    fn banish(&self, key: &str, revision: RevisionId) {
        if let Some(cache) = &self.document_cache {
            cache.banish(self.cache_key(key, revision).as_slice());
        }
    }

    // ── writes ──────────────────────────────────────────────────────────

    /// Pick the revision for a write: normally a fresh tick, but restore
    /// keeps the dumped `_rev` so replaying a batch reproduces identical
    /// revisions.
    fn next_revision(
        &self,
        document: &Map<String, Value>,
        options: &OperationOptions,
    ) -> RevisionId {
        if options.is_restore {
            if let Some(revision) = document
                .get(attrs::REV)
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|&r| r > 0)
            {
                self.services.ticks.advance_to(revision);
                return RevisionId(revision);
            }
        }
        RevisionId(self.services.ticks.next_tick())
    }

    /// Insert a document. `_key` is generated when absent; `_rev` is
    /// stamped fresh (restore keeps the dumped one). A duplicate `_key`
    /// fails with a unique-constraint violation (restore retries those as
    /// replaces).
    pub fn insert(
        &self,
        state: &mut TransactionState,
        document: Value,
        options: &OperationOptions,
    ) -> HeronResult<DocumentResult> {
        let mut document = match document {
            Value::Object(map) => map,
            _ => return Err(HeronError::BadParameter("expecting a document object".into())),
        };

        let key = match document.get(attrs::KEY) {
            Some(Value::String(k)) if !k.is_empty() => k.clone(),
            Some(_) => {
                return Err(HeronError::BadParameter("_key must be a non-empty string".into()))
            }
            None => {
                let generated = self.services.ticks.next_tick().to_string();
                document.insert(attrs::KEY.into(), Value::String(generated.clone()));
                generated
            }
        };

        if self.lookup_revision(state, &key)?.is_some() {
            return Err(HeronError::UniqueConstraintViolated(format!(
                "document '{key}' already exists"
            )));
        }

        let revision = self.next_revision(&document, options);
        document.insert(attrs::REV.into(), Value::String(revision.0.to_string()));
        let document = Value::Object(document);
        let payload = serde_json::to_vec(&document)
            .map_err(|e| HeronError::Internal(format!("document encode: {e}")))?;
        let size = payload.len() as u64;

        {
            let indexes = self.indexes.read();
            let txn = state.store_txn_mut()?;
            let mut savepoint = SavePoint::new(txn);
            savepoint.txn().put(
                Key::document(self.info.object_id, revision).into_bytes(),
                payload,
            );
            for index in indexes.iter() {
                index.insert(savepoint.txn(), &document, revision)?;
            }
            savepoint.commit()?;
        }

        state.add_operation(self.info.id, revision, OperationType::Insert, size)?;
        Ok(DocumentResult { key, revision })
    }

    /// Replace a document wholesale (system attributes are re-stamped).
    pub fn replace(
        &self,
        state: &mut TransactionState,
        key: &str,
        document: Value,
        options: &OperationOptions,
    ) -> HeronResult<DocumentResult> {
        self.modify(state, key, document, options, OperationType::Replace)
    }

    /// Patch a document: top-level fields of `patch` overwrite the stored
    /// document, everything else is preserved.
    pub fn update(
        &self,
        state: &mut TransactionState,
        key: &str,
        patch: Value,
        options: &OperationOptions,
    ) -> HeronResult<DocumentResult> {
        self.modify(state, key, patch, options, OperationType::Update)
    }

    fn modify(
        &self,
        state: &mut TransactionState,
        key: &str,
        document: Value,
        options: &OperationOptions,
        operation: OperationType,
    ) -> HeronResult<DocumentResult> {
        let new_fields = match document {
            Value::Object(map) => map,
            _ => return Err(HeronError::BadParameter("expecting a document object".into())),
        };

        let old_revision = self
            .lookup_revision(state, key)?
            .ok_or_else(|| HeronError::NotFound(format!("document '{key}'")))?;
        let old_document = self.read_revision(state, old_revision)?.value()?;

        self.check_revision(&new_fields, old_revision, options, key)?;

        let revision = self.next_revision(&new_fields, options);
        let mut merged: Map<String, Value> = match operation {
            OperationType::Update => match &old_document {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            },
            _ => Map::new(),
        };
        for (name, value) in new_fields {
            merged.insert(name, value);
        }
        merged.insert(attrs::KEY.into(), Value::String(key.to_string()));
        merged.insert(attrs::REV.into(), Value::String(revision.0.to_string()));
        let merged = Value::Object(merged);

        let payload = serde_json::to_vec(&merged)
            .map_err(|e| HeronError::Internal(format!("document encode: {e}")))?;
        let size = payload.len() as u64;

        {
            let indexes = self.indexes.read();
            let txn = state.store_txn_mut()?;
            let mut savepoint = SavePoint::new(txn);
            savepoint
                .txn()
                .delete(Key::document(self.info.object_id, old_revision).into_bytes());
            for index in indexes.iter() {
                index.remove(savepoint.txn(), &old_document, old_revision)?;
            }
            savepoint.txn().put(
                Key::document(self.info.object_id, revision).into_bytes(),
                payload,
            );
            for index in indexes.iter() {
                index.insert(savepoint.txn(), &merged, revision)?;
            }
            savepoint.commit()?;
        }

        state.add_operation(self.info.id, revision, operation, size)?;
        self.banish(key, old_revision);
        Ok(DocumentResult {
            key: key.to_string(),
            revision,
        })
    }

    /// Remove a document by `_key`.
    pub fn remove(
        &self,
        state: &mut TransactionState,
        key: &str,
        options: &OperationOptions,
    ) -> HeronResult<DocumentResult> {
        let old_revision = self
            .lookup_revision(state, key)?
            .ok_or_else(|| HeronError::NotFound(format!("document '{key}'")))?;
        if !options.ignore_revs {
            if let Some(expected) = options.expected_revision {
                if expected != old_revision {
                    return Err(HeronError::Conflict(key.to_string()));
                }
            }
        }
        let old_document = self.read_revision(state, old_revision)?.value()?;

        {
            let indexes = self.indexes.read();
            let txn = state.store_txn_mut()?;
            let mut savepoint = SavePoint::new(txn);
            savepoint
                .txn()
                .delete(Key::document(self.info.object_id, old_revision).into_bytes());
            for index in indexes.iter() {
                index.remove(savepoint.txn(), &old_document, old_revision)?;
            }
            savepoint.commit()?;
        }

        state.add_operation(self.info.id, old_revision, OperationType::Remove, 0)?;
        self.banish(key, old_revision);
        Ok(DocumentResult {
            key: key.to_string(),
            revision: old_revision,
        })
    }

    /// Remove every document. Returns the number removed.
    pub fn truncate(&self, state: &mut TransactionState) -> HeronResult<u64> {
        let mut docs: Vec<(RevisionId, Value)> = Vec::new();
        self.for_each_document(state, 0, |revision, data| {
            if let Ok(value) = serde_json::from_slice(data) {
                docs.push((revision, value));
            }
            true
        })?;

        let count = docs.len() as u64;
        for (revision, document) in docs {
            {
                let indexes = self.indexes.read();
                let txn = state.store_txn_mut()?;
                let mut savepoint = SavePoint::new(txn);
                savepoint
                    .txn()
                    .delete(Key::document(self.info.object_id, revision).into_bytes());
                for index in indexes.iter() {
                    index.remove(savepoint.txn(), &document, revision)?;
                }
                savepoint.commit()?;
            }
            state.add_operation(self.info.id, revision, OperationType::Remove, 0)?;
            if let Some(Value::String(key)) = document.get(attrs::KEY) {
                self.banish(key, revision);
            }
        }
        Ok(count)
    }

    fn check_revision(
        &self,
        new_fields: &Map<String, Value>,
        old_revision: RevisionId,
        options: &OperationOptions,
        key: &str,
    ) -> HeronResult<()> {
        if options.ignore_revs {
            return Ok(());
        }
        let expected = match options.expected_revision {
            Some(rev) => Some(rev),
            None => new_fields
                .get(attrs::REV)
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<u64>().ok())
                .map(RevisionId),
        };
        match expected {
            Some(expected) if expected != old_revision => {
                Err(HeronError::Conflict(key.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Create an index and backfill it from the existing documents inside
    /// the given transaction. Returns `false` when an equivalent index
    /// already exists.
    pub fn create_index(
        &self,
        state: &mut TransactionState,
        descriptor: IndexDescriptor,
    ) -> HeronResult<bool> {
        {
            let indexes = self.indexes.read();
            if indexes.iter().any(|i| {
                i.kind() == descriptor.kind
                    && i.descriptor().fields == descriptor.fields
                    && i.descriptor().unique == descriptor.unique
            }) {
                return Ok(false);
            }
        }

        let index = Index::new(descriptor.clone());
        let record = Key::index(self.info.database_id, self.info.id, descriptor.id);
        let value = serde_json::to_vec(&descriptor)
            .map_err(|e| HeronError::Internal(format!("index encode: {e}")))?;

        let mut docs: Vec<(RevisionId, Value)> = Vec::new();
        self.for_each_document(state, 0, |revision, data| {
            if let Ok(value) = serde_json::from_slice(data) {
                docs.push((revision, value));
            }
            true
        })?;

        {
            let txn = state.store_txn_mut()?;
            let mut savepoint = SavePoint::new(txn);
            savepoint.txn().put(record.into_bytes(), value);
            for (revision, document) in &docs {
                index.insert(savepoint.txn(), document, *revision)?;
            }
            savepoint.commit()?;
        }

        self.indexes.write().push(index);
        Ok(true)
    }

    /// Delete all persisted data of this collection: documents, index
    /// entries, the counter, the index records and the collection record.
    /// Used by drop, outside any transaction.
    pub fn drop_data(&self) -> HeronResult<()> {
        let bounds = KeyBounds::collection_documents(self.info.object_id);
        self.services.store.delete_range(bounds.start(), bounds.end())?;

        for index in self.indexes.read().iter() {
            let bounds = index.bounds();
            self.services.store.delete_range(bounds.start(), bounds.end())?;
        }

        let bounds = KeyBounds::collection_indexes(self.info.database_id, self.info.id);
        self.services.store.delete_range(bounds.start(), bounds.end())?;

        self.services.counters.remove(self.info.object_id)?;
        self.services
            .store
            .delete(Key::collection(self.info.database_id, self.info.id).as_slice())?;
        Ok(())
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.info.name)
            .field("cid", &self.info.id)
            .field("object_id", &self.info.object_id)
            .field("count", &self.number_documents())
            .finish()
    }
}
