//! The embedded tree store the heron storage layer runs on.
//!
//! The surface mirrors what the storage core requires from any LSM-style
//! collaborator: point reads and writes, atomic write batches with assigned
//! sequence numbers, snapshots, pessimistic transactions with nested
//! save-points, iteration bounded to `[start, end)` key ranges, and a WAL
//! tailing API (`updates_since`) whose batches can be replayed through a
//! [`batch::BatchHandler`].
//!
//! Durability comes from an append-only batch log that is replayed on open;
//! the working set lives in a multiversion ordered map where a snapshot is a
//! pinned sequence number.

pub mod batch;
pub mod engine;
pub mod txn;
pub mod wal;

pub use batch::{BatchHandler, WriteBatch, WriteOp};
pub use engine::{ReadOptions, Snapshot, StoreConfig, TreeStore, WriteOptions};
pub use txn::StoreTransaction;
