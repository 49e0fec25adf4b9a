//! A replication context: one snapshot, one dump session.
//!
//! A context is created by a batch request, bound to a database, and then
//! drives chunked dumps of that database's collections — every chunk reads
//! from the same store snapshot, so a multi-request dump is consistent even
//! while writers keep committing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::{json, Value};

use heron_common::error::{HeronError, HeronResult};
use heron_lsm::{ReadOptions, Snapshot};
use heron_storage::bounds::KeyBounds;
use heron_storage::catalog::Database;

use crate::MARKER_DOCUMENT;

/// One dump chunk.
#[derive(Debug, Clone)]
pub struct DumpResult {
    /// Newline-delimited `{"type": 2300, "data": {...}}` markers.
    pub payload: String,
    /// Whether another chunk is available for this collection.
    pub more: bool,
    /// The snapshot tick all chunks of this context read at.
    pub max_tick: u64,
}

struct Bound {
    database: Arc<Database>,
    snapshot: Snapshot,
    /// Resume position per collection name.
    progress: HashMap<String, Vec<u8>>,
}

pub struct ReplicationContext {
    id: u64,
    ttl: Duration,
    bound: Mutex<Option<Bound>>,
}

impl ReplicationContext {
    pub(crate) fn new(id: u64, ttl: Duration) -> Self {
        Self {
            id,
            ttl,
            bound: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Bind the context to a database, pinning the current store state.
    /// Rebinding to another database resets all dump progress.
    pub fn bind(&self, database: Arc<Database>) {
        let snapshot = database.services().store.snapshot();
        let mut bound = self.bound.lock();
        let rebind = bound
            .as_ref()
            .map(|b| b.database.id() != database.id())
            .unwrap_or(true);
        if rebind {
            *bound = Some(Bound {
                database,
                snapshot,
                progress: HashMap::new(),
            });
        }
    }

    /// The tick this context serves data at.
    pub fn last_tick(&self) -> HeronResult<u64> {
        let bound = self.bound.lock();
        bound
            .as_ref()
            .map(|b| b.snapshot.sequence())
            .ok_or_else(|| HeronError::Internal("replication context is not bound".into()))
    }

    /// Whether the most recent `dump` left more data behind.
    pub fn more(&self, collection: &str) -> bool {
        let bound = self.bound.lock();
        bound
            .as_ref()
            .map(|b| b.progress.contains_key(collection))
            .unwrap_or(false)
    }

    /// The inventory of the bound database:
    /// `{collections, state: {...}, tick}`.
    pub fn inventory(&self, include_system: bool) -> HeronResult<Value> {
        let bound = self.bound.lock();
        let bound = bound
            .as_ref()
            .ok_or_else(|| HeronError::Internal("replication context is not bound".into()))?;

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Ok(json!({
            "collections": bound.database.inventory(include_system),
            "state": {
                "running": true,
                "lastLogTick": bound.snapshot.sequence().to_string(),
                "lastUncommittedLogTick": "0",
                "totalEvents": 0,
                "time": now_ms.to_string(),
            },
            "tick": bound.database.services().ticks.current().to_string(),
        }))
    }

    /// Stream the next chunk of one collection's documents under the pinned
    /// snapshot. Chunks are bounded by `chunk_size` payload bytes.
    pub fn dump(&self, collection: &str, chunk_size: u64) -> HeronResult<DumpResult> {
        let mut bound_guard = self.bound.lock();
        let bound = bound_guard
            .as_mut()
            .ok_or_else(|| HeronError::Internal("replication context is not bound".into()))?;

        let coll = bound
            .database
            .collection(collection)
            .ok_or_else(|| HeronError::NotFound(format!("collection '{collection}'")))?;

        let bounds = KeyBounds::collection_documents(coll.object_id());
        let start = bound
            .progress
            .get(collection)
            .cloned()
            .unwrap_or_else(|| bounds.start().to_vec());

        let read = ReadOptions::at(bound.snapshot);
        let mut payload = String::new();
        let mut resume: Option<Vec<u8>> = None;

        bound
            .database
            .services()
            .store
            .iterate(&start, bounds.end(), &read, |key, value| {
                if payload.len() as u64 >= chunk_size {
                    resume = Some(key.to_vec());
                    return false;
                }
                if let Ok(document) = serde_json::from_slice::<Value>(value) {
                    let marker = json!({"type": MARKER_DOCUMENT, "data": document});
                    payload.push_str(&marker.to_string());
                    payload.push('\n');
                }
                true
            });

        let more = resume.is_some();
        match resume {
            Some(key) => {
                bound.progress.insert(collection.to_string(), key);
            }
            None => {
                bound.progress.remove(collection);
            }
        }

        Ok(DumpResult {
            payload,
            more,
            max_tick: bound.snapshot.sequence(),
        })
    }
}

impl std::fmt::Debug for ReplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationContext")
            .field("id", &self.id)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Expiry bookkeeping lives in the manager; contexts only know their TTL.
pub(crate) fn deadline(ttl: Duration) -> Instant {
    Instant::now() + ttl
}
