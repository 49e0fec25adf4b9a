//! The storage engine: the composition root wiring store, caches,
//! counters, transactions and the catalog together.
//!
//! Every component receives its collaborators through this services record;
//! nothing reaches for a global. A failed open leaves no engine behind —
//! startup recovery errors are fatal for the open, not papered over.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use heron_cache::{CacheManager, CacheManagerConfig};
use heron_common::config::HeronConfig;
use heron_common::error::{HeronError, HeronResult};
use heron_common::types::{ObjectId, SequenceNumber, TickSource};
use heron_lsm::{StoreConfig, TreeStore};

use crate::bounds::KeyBounds;
use crate::catalog::{Database, DatabaseInfo};
use crate::collection::{Collection, CollectionInfo};
use crate::counter::CounterManager;
use crate::index::IndexDescriptor;
use crate::keys::Key;
use crate::txn::{TransactionHints, TransactionManager, TransactionState};

/// The default database, always present.
pub const SYSTEM_DATABASE: &str = "_system";

/// Constructor-injected handles shared by every storage component.
pub struct StorageServices {
    pub store: Arc<TreeStore>,
    pub ticks: TickSource,
    pub counters: Arc<CounterManager>,
    pub cache: CacheManager,
    pub transactions: TransactionManager,
}

pub struct StorageEngine {
    services: Arc<StorageServices>,
    databases: RwLock<HashMap<String, Arc<Database>>>,
}

impl StorageEngine {
    /// Open the engine: open the store, run counter recovery, load the
    /// catalog and make sure the system database exists.
    pub fn open(config: &HeronConfig, path: &Path) -> HeronResult<Arc<Self>> {
        let store = TreeStore::open(
            path,
            StoreConfig {
                sync_writes: config.storage.sync_writes,
                retained_batches: config.storage.wal_retained_batches,
            },
        )?;

        let cache = CacheManager::new(CacheManagerConfig::from(&config.cache));
        let counters = CounterManager::new(Arc::clone(&store), &config.counter);
        counters.start();

        let services = Arc::new(StorageServices {
            store,
            ticks: TickSource::default(),
            counters,
            cache,
            transactions: TransactionManager::new(),
        });

        let engine = Arc::new(Self {
            services,
            databases: RwLock::new(HashMap::new()),
        });
        engine.load_catalog()?;
        if engine.database(SYSTEM_DATABASE).is_none() {
            engine.create_database(SYSTEM_DATABASE)?;
        }
        tracing::info!(
            databases = engine.databases.read().len(),
            sequence = engine.latest_sequence(),
            "storage engine opened"
        );
        Ok(engine)
    }

    pub fn services(&self) -> &Arc<StorageServices> {
        &self.services
    }

    /// The process-wide current tick.
    pub fn current_tick(&self) -> u64 {
        self.services.ticks.current()
    }

    /// The store's most recent write sequence.
    pub fn latest_sequence(&self) -> SequenceNumber {
        self.services.store.latest_sequence()
    }

    pub fn database(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.read().get(name).cloned()
    }

    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create_database(&self, name: &str) -> HeronResult<Arc<Database>> {
        if name.is_empty() {
            return Err(HeronError::BadParameter("database name is missing".into()));
        }
        let mut databases = self.databases.write();
        if databases.contains_key(name) {
            return Err(HeronError::DuplicateName(name.to_string()));
        }
        let info = DatabaseInfo {
            id: heron_common::types::DatabaseId(self.services.ticks.next_tick()),
            name: name.to_string(),
        };
        let record = serde_json::to_vec(&info)
            .map_err(|e| HeronError::Internal(format!("database encode: {e}")))?;
        self.services
            .store
            .put(Key::database(info.id).as_slice(), &record)?;

        let database = Database::new(info, Arc::clone(&self.services));
        databases.insert(name.to_string(), Arc::clone(&database));
        tracing::info!(database = name, "database created");
        Ok(database)
    }

    /// Drop a database and everything in it.
    pub fn drop_database(&self, name: &str) -> HeronResult<()> {
        if name == SYSTEM_DATABASE {
            return Err(HeronError::Forbidden("the system database cannot be dropped".into()));
        }
        let database = self
            .database(name)
            .ok_or_else(|| HeronError::NotFound(format!("database '{name}'")))?;
        for collection in database.inventory_collections() {
            collection.drop_data()?;
        }
        self.services
            .store
            .delete(Key::database(database.id()).as_slice())?;
        self.databases.write().remove(name);
        tracing::info!(database = name, "database dropped");
        Ok(())
    }

    /// Begin a transaction in the running state.
    pub fn begin_transaction(&self, hints: TransactionHints) -> HeronResult<TransactionState> {
        let mut state = TransactionState::new(Arc::clone(&self.services), hints);
        state.begin()?;
        Ok(state)
    }

    /// Resolve a store object id to its database and collection. Used by
    /// WAL tailing to attribute document operations.
    pub fn collection_by_object_id(
        &self,
        object_id: ObjectId,
    ) -> Option<(Arc<Database>, Arc<Collection>)> {
        let databases = self.databases.read();
        for database in databases.values() {
            if let Some(collection) = database.collection_by_object_id(object_id) {
                return Some((Arc::clone(database), collection));
            }
        }
        None
    }

    /// Signal background workers to wind down.
    pub fn begin_shutdown(&self) {
        self.services.counters.begin_shutdown();
        self.services.cache.begin_shutdown();
    }

    /// Stop workers, flush counters one last time and sync the store.
    pub fn shutdown(&self) -> HeronResult<()> {
        self.begin_shutdown();
        self.services.counters.shutdown()?;
        self.services.cache.shutdown();
        self.services.store.flush()?;
        tracing::info!("storage engine shut down");
        Ok(())
    }

    /// Rebuild the in-memory catalog from the persisted records.
    fn load_catalog(&self) -> HeronResult<()> {
        let store = &self.services.store;
        let read = Default::default();
        let mut max_tick = 0u64;

        // databases
        let mut infos: Vec<DatabaseInfo> = Vec::new();
        let bounds = KeyBounds::databases();
        store.iterate(bounds.start(), bounds.end(), &read, |_key, value| {
            if let Ok(info) = serde_json::from_slice::<DatabaseInfo>(value) {
                infos.push(info);
            }
            true
        });

        let mut databases = self.databases.write();
        for info in infos {
            max_tick = max_tick.max(info.id.0);
            let database = Database::new(info, Arc::clone(&self.services));

            // collections of this database
            let mut collections: Vec<CollectionInfo> = Vec::new();
            let bounds = KeyBounds::database_collections(database.id());
            store.iterate(bounds.start(), bounds.end(), &read, |_key, value| {
                if let Ok(info) = serde_json::from_slice::<CollectionInfo>(value) {
                    collections.push(info);
                }
                true
            });

            for info in collections {
                max_tick = max_tick.max(info.id.0).max(info.object_id.0);

                let mut descriptors: Vec<IndexDescriptor> = Vec::new();
                let bounds = KeyBounds::collection_indexes(database.id(), info.id);
                store.iterate(bounds.start(), bounds.end(), &read, |_key, value| {
                    if let Ok(descriptor) = serde_json::from_slice::<IndexDescriptor>(value) {
                        descriptors.push(descriptor);
                    }
                    true
                });
                for descriptor in &descriptors {
                    max_tick = max_tick.max(descriptor.id.0);
                }

                let collection =
                    Collection::new(info, descriptors, Arc::clone(&self.services));
                max_tick = max_tick.max(collection.revision().0);
                database.adopt(collection);
            }

            databases.insert(database.name().to_string(), database);
        }
        drop(databases);

        self.services.ticks.advance_to(max_tick);
        Ok(())
    }
}

impl Database {
    /// All collections including system ones; drop/database teardown path.
    pub(crate) fn inventory_collections(&self) -> Vec<Arc<Collection>> {
        self.collections(true)
    }
}
