//! Identifier newtypes and the process-wide tick source.
//!
//! Databases, collections, indexes, document revisions and transactions are
//! all identified by ticks: values drawn from one monotonic 64-bit counter.
//! Object ids additionally serve as key prefixes inside the tree store, which
//! is what isolates collections from one another.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(
    /// A database id (a tick).
    DatabaseId
);
id_type!(
    /// A collection id (a tick), visible to clients.
    CollectionId
);
id_type!(
    /// The id a collection or index is addressed by inside the tree store.
    ObjectId
);
id_type!(
    /// An index id (a tick).
    IndexId
);
id_type!(
    /// A document revision (a tick). Monotonic per process.
    RevisionId
);
id_type!(
    /// A transaction id (a tick).
    TransactionId
);

/// A tree-store sequence number. Assigned by the store at write time;
/// totally ordered with commit order.
pub type SequenceNumber = u64;

/// Collection flavor. Edge collections enforce `_from`/`_to` on every
/// document and feed the edge index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    Document,
    Edge,
}

impl CollectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionType::Document => "document",
            CollectionType::Edge => "edge",
        }
    }
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// System attribute names stamped into documents.
pub mod attrs {
    pub const KEY: &str = "_key";
    pub const REV: &str = "_rev";
    pub const ID: &str = "_id";
    pub const FROM: &str = "_from";
    pub const TO: &str = "_to";
}

/// Process-wide monotonic tick generator.
///
/// Every id handed out by the server comes from here, so ids of different
/// kinds are mutually unique and roughly ordered by creation time. The
/// counter can be bumped forward during recovery so freshly assigned ticks
/// never collide with persisted ones.
#[derive(Debug)]
pub struct TickSource {
    current: AtomicU64,
}

impl TickSource {
    pub fn new(start: u64) -> Self {
        Self {
            current: AtomicU64::new(start),
        }
    }

    /// Hand out the next tick.
    pub fn next_tick(&self) -> u64 {
        self.current.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The most recently assigned tick.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Ensure future ticks are strictly greater than `seen`. Used when
    /// loading persisted state on startup.
    pub fn advance_to(&self, seen: u64) {
        let mut cur = self.current.load(Ordering::Relaxed);
        while cur < seen {
            match self.current.compare_exchange_weak(
                cur,
                seen,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Default for TickSource {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_source_monotonic() {
        let ticks = TickSource::default();
        let a = ticks.next_tick();
        let b = ticks.next_tick();
        let c = ticks.next_tick();
        assert!(a < b && b < c);
        assert_eq!(ticks.current(), c);
    }

    #[test]
    fn test_tick_source_advance_to() {
        let ticks = TickSource::default();
        ticks.advance_to(100);
        assert_eq!(ticks.current(), 100);
        assert_eq!(ticks.next_tick(), 101);

        // Advancing backwards is a no-op.
        ticks.advance_to(50);
        assert!(ticks.next_tick() > 101);
    }

    #[test]
    fn test_id_display_and_order() {
        assert_eq!(ObjectId(42).to_string(), "42");
        assert!(RevisionId(1) < RevisionId(2));
        assert_eq!(CollectionId::from(7), CollectionId(7));
    }

    #[test]
    fn test_collection_type_str() {
        assert_eq!(CollectionType::Document.to_string(), "document");
        assert_eq!(CollectionType::Edge.to_string(), "edge");
    }
}
