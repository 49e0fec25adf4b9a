//! The storage-engine layer: logical entities encoded onto one shared tree
//! store.
//!
//! Every database, collection, document, index entry and counter lives in a
//! single embedded store, isolated by the tagged key codec in [`keys`] and
//! the range bounds in [`bounds`]. On top of that sit the durable document
//! counters ([`counter`]), the catalog of databases and collections
//! ([`catalog`]), per-collection CRUD with index maintenance
//! ([`collection`]), the transaction state machine ([`txn`]), collection
//! export ([`export`]) and the composition root ([`engine`]).

pub mod bounds;
pub mod catalog;
pub mod collection;
pub mod counter;
pub mod engine;
pub mod export;
pub mod index;
pub mod keys;
pub mod txn;

pub use engine::{StorageEngine, StorageServices};
