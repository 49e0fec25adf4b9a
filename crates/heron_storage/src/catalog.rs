//! Databases and their collections.
//!
//! A database is a named registry of collections. Collection and index
//! definitions are persisted as catalog records in the store, keyed by the
//! codec, and reloaded on startup. Dropping a collection deletes its whole
//! key ranges; system collections (leading underscore) refuse to be
//! dropped, which restore handles by truncating instead.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use heron_common::error::{HeronError, HeronResult};
use heron_common::types::{CollectionId, CollectionType, DatabaseId, IndexId, ObjectId};

use crate::collection::{Collection, CollectionInfo};
use crate::engine::StorageServices;
use crate::index::IndexDescriptor;
use crate::keys::Key;

/// Persisted database metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub id: DatabaseId,
    pub name: String,
}

pub struct Database {
    info: DatabaseInfo,
    services: Arc<StorageServices>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl Database {
    pub(crate) fn new(info: DatabaseInfo, services: Arc<StorageServices>) -> Arc<Self> {
        Arc::new(Self {
            info,
            services,
            collections: RwLock::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> DatabaseId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn services(&self) -> &Arc<StorageServices> {
        &self.services
    }

    /// Create a collection, persisting its catalog records. The object id
    /// may be pinned by the caller (replication restore reuses ids).
    pub fn create_collection(
        &self,
        name: &str,
        collection_type: CollectionType,
    ) -> HeronResult<Arc<Collection>> {
        self.create_collection_with_id(name, collection_type, None)
    }

    pub fn create_collection_with_id(
        &self,
        name: &str,
        collection_type: CollectionType,
        id: Option<CollectionId>,
    ) -> HeronResult<Arc<Collection>> {
        if name.is_empty() {
            return Err(HeronError::BadParameter("collection name is missing".into()));
        }
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(HeronError::DuplicateName(name.to_string()));
        }

        let cid = match id {
            Some(cid) => {
                // pinned ids (replication restore) must not collide with
                // ticks handed out later
                self.services.ticks.advance_to(cid.0);
                cid
            }
            None => CollectionId(self.services.ticks.next_tick()),
        };
        let object_id = ObjectId(self.services.ticks.next_tick());
        let info = CollectionInfo {
            id: cid,
            name: name.to_string(),
            collection_type,
            object_id,
            database_id: self.info.id,
        };

        let mut descriptors = vec![IndexDescriptor::primary(IndexId(
            self.services.ticks.next_tick(),
        ))];
        if collection_type == CollectionType::Edge {
            descriptors.push(IndexDescriptor::edge(IndexId(
                self.services.ticks.next_tick(),
            )));
        }

        // persist the collection record and its index records
        let record = serde_json::to_vec(&info)
            .map_err(|e| HeronError::Internal(format!("collection encode: {e}")))?;
        let mut batch = heron_lsm::WriteBatch::new();
        batch.put(Key::collection(self.info.id, cid).into_bytes(), record);
        for descriptor in &descriptors {
            let value = serde_json::to_vec(descriptor)
                .map_err(|e| HeronError::Internal(format!("index encode: {e}")))?;
            batch.put(
                Key::index(self.info.id, cid, descriptor.id).into_bytes(),
                value,
            );
        }
        self.services
            .store
            .write(batch, &heron_lsm::WriteOptions::default())?;

        let collection = Collection::new(info, descriptors, Arc::clone(&self.services));
        collections.insert(name.to_string(), Arc::clone(&collection));
        tracing::info!(database = %self.info.name, collection = name, cid = %cid, "collection created");
        Ok(collection)
    }

    /// Drop a collection and all of its data. System collections refuse.
    pub fn drop_collection(&self, name: &str) -> HeronResult<()> {
        let collection = {
            let collections = self.collections.read();
            collections
                .get(name)
                .cloned()
                .ok_or_else(|| HeronError::NotFound(format!("collection '{name}'")))?
        };
        if collection.is_system() {
            return Err(HeronError::Forbidden(format!(
                "system collection '{name}' cannot be dropped"
            )));
        }
        collection.drop_data()?;
        self.collections.write().remove(name);
        tracing::info!(database = %self.info.name, collection = name, "collection dropped");
        Ok(())
    }

    pub fn collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.read().get(name).cloned()
    }

    pub fn collection_by_id(&self, cid: CollectionId) -> Option<Arc<Collection>> {
        self.collections
            .read()
            .values()
            .find(|c| c.cid() == cid)
            .cloned()
    }

    pub fn collection_by_object_id(&self, object_id: ObjectId) -> Option<Arc<Collection>> {
        self.collections
            .read()
            .values()
            .find(|c| c.object_id() == object_id)
            .cloned()
    }

    /// All collections, sorted by name.
    pub fn collections(&self, include_system: bool) -> Vec<Arc<Collection>> {
        let mut list: Vec<Arc<Collection>> = self
            .collections
            .read()
            .values()
            .filter(|c| include_system || !c.is_system())
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    /// The inventory array: one `{parameters, indexes}` object per
    /// collection.
    pub fn inventory(&self, include_system: bool) -> Value {
        Value::Array(
            self.collections(include_system)
                .iter()
                .map(|c| c.to_inventory())
                .collect(),
        )
    }

    pub(crate) fn adopt(&self, collection: Arc<Collection>) {
        self.collections
            .write()
            .insert(collection.name().to_string(), collection);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .field("collections", &self.collections.read().len())
            .finish()
    }
}
