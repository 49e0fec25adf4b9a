//! Restore: applying replicated collection definitions, indexes and data.
//!
//! Data batches arrive as newline-delimited markers `{type, key?, data?}`.
//! Only the latest marker per key counts. The batch is applied in three
//! phases inside one recovery transaction — bulk remove of final deletes
//! (missing documents ignored), bulk insert of final documents, then a
//! replace for every insert that hit a unique-constraint violation — which
//! makes replaying the same batch idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use heron_common::error::{HeronError, HeronResult};
use heron_common::types::{attrs, CollectionId, CollectionType};
use heron_storage::catalog::Database;
use heron_storage::collection::OperationOptions;
use heron_storage::index::IndexDescriptor;
use heron_storage::txn::TransactionHints;
use heron_storage::StorageEngine;

use crate::{MARKER_DOCUMENT, MARKER_DOCUMENT_EDGE, MARKER_REMOVE};

/// Switches for restore-collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Drop (or truncate) an existing collection of the same name.
    pub overwrite: bool,
    /// Keep the collection id from the dump.
    pub recycle_ids: bool,
    /// Continue past individual failures where safe.
    pub force: bool,
}

fn recovery_hints() -> TransactionHints {
    TransactionHints {
        recovery: true,
        ..Default::default()
    }
}

fn collection_type_of(parameters: &Value) -> CollectionType {
    // the wire format carries the numeric type: 2 = document, 3 = edge
    match parameters.get("type") {
        Some(Value::Number(n)) if n.as_u64() == Some(3) => CollectionType::Edge,
        Some(Value::String(s)) if s == "edge" => CollectionType::Edge,
        _ => CollectionType::Document,
    }
}

/// Re-create a collection from its dumped declaration.
pub fn restore_collection(
    database: &Arc<Database>,
    declaration: &Value,
    options: RestoreOptions,
) -> HeronResult<()> {
    if !declaration.is_object() {
        return Err(HeronError::BadParameter(
            "collection declaration is invalid".into(),
        ));
    }
    let parameters = declaration
        .get("parameters")
        .filter(|p| p.is_object())
        .ok_or_else(|| {
            HeronError::BadParameter("collection parameters declaration is invalid".into())
        })?;
    if !declaration
        .get("indexes")
        .map(Value::is_array)
        .unwrap_or(false)
    {
        return Err(HeronError::BadParameter(
            "collection indexes declaration is invalid".into(),
        ));
    }

    let name = parameters
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| HeronError::BadParameter("collection name is missing".into()))?;

    if parameters
        .get("deleted")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        // deleted collections in a dump carry nothing to restore
        return Ok(());
    }

    if let Some(existing) = database.collection(name) {
        if !options.overwrite {
            return Err(HeronError::DuplicateName(name.to_string()));
        }
        match database.drop_collection(name) {
            Ok(()) => {}
            Err(HeronError::Forbidden(_)) => {
                // system collections survive; empty them instead
                let engine_services = database.services();
                let mut state = heron_storage::txn::TransactionState::new(
                    Arc::clone(engine_services),
                    recovery_hints(),
                );
                state.begin()?;
                state.add_collection(&existing);
                existing.truncate(&mut state)?;
                state.commit()?;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }

    let id = if options.recycle_ids {
        parameters
            .get("id")
            .and_then(|v| {
                v.as_str()
                    .and_then(|s| s.parse::<u64>().ok())
                    .or_else(|| v.as_u64())
            })
            .map(CollectionId)
    } else {
        None
    };
    if options.recycle_ids && id.is_none() {
        return Err(HeronError::BadParameter("collection id is missing".into()));
    }

    database.create_collection_with_id(name, collection_type_of(parameters), id)?;
    Ok(())
}

/// Re-create the secondary indexes from a dumped declaration. Primary and
/// edge indexes always exist and are skipped.
pub fn restore_indexes(
    engine: &StorageEngine,
    database: &Arc<Database>,
    declaration: &Value,
    force: bool,
) -> HeronResult<()> {
    let parameters = declaration
        .get("parameters")
        .filter(|p| p.is_object())
        .ok_or_else(|| {
            HeronError::BadParameter("collection parameters declaration is invalid".into())
        })?;
    let name = parameters
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| HeronError::BadParameter("collection name is missing".into()))?;
    let indexes = declaration
        .get("indexes")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            HeronError::BadParameter("collection indexes declaration is invalid".into())
        })?;

    let collection = database
        .collection(name)
        .ok_or_else(|| HeronError::NotFound(format!("collection '{name}'")))?;

    for index in indexes {
        let kind = index.get("type").and_then(Value::as_str).unwrap_or("");
        if kind == "primary" || kind == "edge" {
            continue;
        }
        let fields: Vec<String> = index
            .get("fields")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if fields.is_empty() {
            if force {
                continue;
            }
            return Err(HeronError::BadParameter(
                "index fields declaration is invalid".into(),
            ));
        }
        let unique = index
            .get("unique")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let descriptor = IndexDescriptor::persistent(
            heron_common::types::IndexId(engine.services().ticks.next_tick()),
            fields,
            unique,
        );

        let mut state = engine.begin_transaction(recovery_hints())?;
        state.add_collection(&collection);
        match collection.create_index(&mut state, descriptor) {
            Ok(_) => state.commit()?,
            Err(e) => {
                state.abort()?;
                if !force {
                    return Err(e);
                }
            }
        }
    }
    Ok(())
}

struct ParsedMarker {
    marker_type: u64,
    key: String,
    data: Option<Value>,
}

fn parse_marker(line: &str, collection: &str) -> HeronResult<ParsedMarker> {
    let invalid = || {
        HeronError::CorruptedJson(format!(
            "received invalid JSON data for collection {collection}"
        ))
    };
    let value: Value = serde_json::from_str(line).map_err(|_| invalid())?;
    let object = value.as_object().ok_or_else(invalid)?;

    let marker_type = match object.get("type").and_then(Value::as_u64) {
        Some(MARKER_DOCUMENT_EDGE) => MARKER_DOCUMENT,
        Some(t) => t,
        None => 0,
    };

    let data = object.get("data").filter(|d| d.is_object()).cloned();
    let mut key = data
        .as_ref()
        .and_then(|d| d.get(attrs::KEY))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if key.is_empty() {
        key = object
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
    }

    if marker_type == MARKER_DOCUMENT && data.is_none() {
        return Err(HeronError::BadParameter(
            "got document marker without contents".into(),
        ));
    }
    if key.is_empty() {
        return Err(HeronError::BadParameter(format!(
            "received invalid JSON data for collection {collection}: no document key"
        )));
    }

    Ok(ParsedMarker {
        marker_type,
        key,
        data,
    })
}

/// Apply one newline-delimited restore-data batch to a collection.
pub fn restore_data(
    engine: &StorageEngine,
    database: &Arc<Database>,
    collection_name: &str,
    body: &str,
    _options: RestoreOptions,
) -> HeronResult<()> {
    let collection = database
        .collection(collection_name)
        .ok_or_else(|| HeronError::NotFound(format!("collection '{collection_name}'")))?;

    // parse all markers, keeping only the latest per key
    let mut markers: Vec<ParsedMarker> = Vec::new();
    let mut latest: HashMap<String, usize> = HashMap::new();
    for line in body.lines() {
        if line.len() <= 1 {
            continue;
        }
        let marker = parse_marker(line, collection_name)?;
        latest.insert(marker.key.clone(), markers.len());
        markers.push(marker);
    }

    let mut state = engine.begin_transaction(recovery_hints())?;
    state.add_collection(&collection);
    let restore = OperationOptions::restore();

    let result = (|| -> HeronResult<()> {
        // phase 1: remove every key whose final marker is a removal
        for &position in latest.values() {
            let marker = &markers[position];
            match marker.marker_type {
                MARKER_REMOVE => {
                    match collection.remove(&mut state, &marker.key, &restore) {
                        Ok(_) => {}
                        // removals of unknown documents are expected
                        Err(HeronError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                MARKER_DOCUMENT => {}
                other => {
                    return Err(HeronError::BadParameter(format!(
                        "unexpected marker type {other}"
                    )))
                }
            }
        }

        // phase 2: insert every key whose final marker is a document;
        // collect unique-constraint conflicts for phase 3
        let mut to_replace: Vec<usize> = Vec::new();
        for &position in latest.values() {
            let marker = &markers[position];
            if marker.marker_type != MARKER_DOCUMENT {
                continue;
            }
            let data = marker.data.clone().ok_or_else(|| {
                HeronError::BadParameter("got document marker without contents".into())
            })?;
            match collection.insert(&mut state, data, &restore) {
                Ok(_) => {}
                Err(HeronError::UniqueConstraintViolated(_)) => to_replace.push(position),
                Err(e) => return Err(e),
            }
        }

        // phase 3: conflicting inserts become replaces
        for position in to_replace {
            let marker = &markers[position];
            let data = marker.data.clone().ok_or_else(|| {
                HeronError::BadParameter("got document marker without contents".into())
            })?;
            collection.replace(&mut state, &marker.key, data, &restore)?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => state.commit(),
        Err(e) => {
            state.abort()?;
            Err(e)
        }
    }
}
