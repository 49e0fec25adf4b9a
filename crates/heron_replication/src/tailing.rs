//! WAL tailing: the logger-follow feed.
//!
//! Replays write batches newer than a follower's tick as logical markers.
//! A document put becomes a `2300` marker carrying the payload; a primary
//! index entry delete becomes a `2302` removal marker carrying the document
//! key. Each marker is tagged with the batch's tick and the owning
//! collection, and system collections can be filtered out.

use std::collections::HashMap;

use serde_json::{json, Value};

use heron_common::error::HeronResult;
use heron_common::types::SequenceNumber;
use heron_lsm::BatchHandler;
use heron_storage::index::IndexKind;
use heron_storage::keys::{self, EntryType};
use heron_storage::StorageEngine;

use crate::{MARKER_DOCUMENT, MARKER_REMOVE};

/// Outcome of one tailing request.
#[derive(Debug, Clone)]
pub struct TailingResult {
    /// One JSON object per logical operation, in tick order.
    pub markers: Vec<Value>,
    /// Tick of the last included operation (0 if none).
    pub max_tick: SequenceNumber,
    /// Whether the requested from-tick is still covered by the log.
    pub from_tick_included: bool,
    /// The newest tick in the store at request time.
    pub last_tick: SequenceNumber,
}

impl TailingResult {
    /// The reply headers the REST adapter forwards.
    pub fn headers(&self) -> DumpHeaders {
        DumpHeaders {
            check_more: self.max_tick > 0 && self.max_tick < self.last_tick,
            last_included: self.max_tick,
            last_tick: self.last_tick,
            active: true,
            from_present: self.from_tick_included,
        }
    }
}

/// The five replication reply headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpHeaders {
    pub check_more: bool,
    pub last_included: SequenceNumber,
    pub last_tick: SequenceNumber,
    pub active: bool,
    pub from_present: bool,
}

impl DumpHeaders {
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-arango-replication-checkmore", self.check_more.to_string()),
            (
                "x-arango-replication-lastincluded",
                self.last_included.to_string(),
            ),
            ("x-arango-replication-lasttick", self.last_tick.to_string()),
            ("x-arango-replication-active", self.active.to_string()),
            (
                "x-arango-replication-frompresent",
                self.from_present.to_string(),
            ),
        ]
    }
}

#[derive(Clone)]
struct CollectionRef {
    cid: u64,
    name: String,
    system: bool,
}

/// Pre-resolved lookup tables so the batch handler never touches locks.
struct Resolver {
    by_object: HashMap<u64, CollectionRef>,
    by_primary_index: HashMap<u64, CollectionRef>,
}

impl Resolver {
    fn build(engine: &StorageEngine) -> Self {
        let mut by_object = HashMap::new();
        let mut by_primary_index = HashMap::new();
        for name in engine.database_names() {
            let Some(database) = engine.database(&name) else {
                continue;
            };
            for collection in database.collections(true) {
                let entry = CollectionRef {
                    cid: collection.cid().0,
                    name: collection.name().to_string(),
                    system: collection.is_system(),
                };
                by_object.insert(collection.object_id().0, entry.clone());
                for descriptor in collection.index_descriptors() {
                    if descriptor.kind == IndexKind::Primary {
                        by_primary_index.insert(descriptor.id.0, entry.clone());
                    }
                }
            }
        }
        Self {
            by_object,
            by_primary_index,
        }
    }
}

struct MarkerCollector<'a> {
    resolver: &'a Resolver,
    include_system: bool,
    limit: usize,
    tick: SequenceNumber,
    markers: Vec<Value>,
    max_tick: SequenceNumber,
}

impl MarkerCollector<'_> {
    fn full(&self) -> bool {
        self.markers.len() >= self.limit
    }

    fn emit(&mut self, marker: Value) {
        if !self.full() {
            self.markers.push(marker);
            self.max_tick = self.tick;
        }
    }
}

impl BatchHandler for MarkerCollector<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        if self.full() || keys::entry_type(key) != Some(EntryType::Document) {
            return;
        }
        let Some(object_id) = keys::object_id(key) else {
            return;
        };
        let Some(collection) = self.resolver.by_object.get(&object_id.0) else {
            return;
        };
        if collection.system && !self.include_system {
            return;
        }
        let Ok(document) = serde_json::from_slice::<Value>(value) else {
            return;
        };
        self.emit(json!({
            "tick": self.tick.to_string(),
            "type": MARKER_DOCUMENT,
            "cid": collection.cid.to_string(),
            "cname": collection.name,
            "data": document,
        }));
    }

    fn delete(&mut self, key: &[u8]) {
        if self.full() || keys::entry_type(key) != Some(EntryType::PrimaryIndexValue) {
            return;
        }
        let Some(index_id) = keys::object_id(key) else {
            return;
        };
        let Some(collection) = self.resolver.by_primary_index.get(&index_id.0) else {
            return;
        };
        if collection.system && !self.include_system {
            return;
        }
        let Ok(document_key) = keys::primary_key(key) else {
            return;
        };
        self.emit(json!({
            "tick": self.tick.to_string(),
            "type": MARKER_REMOVE,
            "cid": collection.cid.to_string(),
            "cname": collection.name,
            "data": {"_key": document_key},
        }));
    }
}

/// Stream logical operations with tick greater than `from_tick`, up to
/// `limit` markers.
pub fn tail_wal(
    engine: &StorageEngine,
    from_tick: SequenceNumber,
    limit: usize,
    include_system: bool,
) -> HeronResult<TailingResult> {
    let last_tick = engine.latest_sequence();
    let updates = engine.services().store.updates_since(from_tick)?;
    let from_tick_included = from_tick <= last_tick;

    let resolver = Resolver::build(engine);
    let mut collector = MarkerCollector {
        resolver: &resolver,
        include_system,
        limit: limit.max(1),
        tick: 0,
        markers: Vec::new(),
        max_tick: 0,
    };

    for entry in updates {
        if collector.full() {
            break;
        }
        collector.tick = entry.sequence;
        entry.batch.iterate(&mut collector);
    }

    Ok(TailingResult {
        markers: collector.markers,
        max_tick: collector.max_tick,
        from_tick_included,
        last_tick,
    })
}
