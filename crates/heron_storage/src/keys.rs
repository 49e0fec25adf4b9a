//! The key codec.
//!
//! Every key in the tree store starts with a one-byte entry-type tag,
//! followed by a type-specific composition of big-endian 64-bit integers
//! and/or variable-length byte strings terminated by a `0x00` separator.
//! Big-endian integers make lexicographic byte order equal numeric order,
//! so range scans walk entities in id order. Index value suffixes carry the
//! canonical sort-key encoding from `heron_common::value`, appended
//! verbatim.

use heron_common::error::{HeronError, HeronResult};
use heron_common::types::{
    CollectionId, DatabaseId, IndexId, ObjectId, RevisionId,
};

/// Separator terminating variable-length key components.
pub const STRING_SEPARATOR: u8 = 0x00;

/// The closed set of entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryType {
    Database = 0x30,
    Collection = 0x31,
    Index = 0x32,
    Document = 0x33,
    PrimaryIndexValue = 0x34,
    EdgeIndexValue = 0x35,
    IndexValue = 0x36,
    UniqueIndexValue = 0x37,
    View = 0x38,
    CounterValue = 0x39,
}

impl EntryType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x30 => Some(EntryType::Database),
            0x31 => Some(EntryType::Collection),
            0x32 => Some(EntryType::Index),
            0x33 => Some(EntryType::Document),
            0x34 => Some(EntryType::PrimaryIndexValue),
            0x35 => Some(EntryType::EdgeIndexValue),
            0x36 => Some(EntryType::IndexValue),
            0x37 => Some(EntryType::UniqueIndexValue),
            0x38 => Some(EntryType::View),
            0x39 => Some(EntryType::CounterValue),
            _ => None,
        }
    }
}

pub(crate) fn append_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn read_u64(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(bytes.get(..8)?.try_into().ok()?))
}

/// An encoded key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    bytes: Vec<u8>,
}

impl Key {
    fn with_capacity(entry_type: EntryType, capacity: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + capacity);
        bytes.push(entry_type as u8);
        bytes
    }

    /// `tag ‖ databaseId`
    pub fn database(database_id: DatabaseId) -> Self {
        let mut bytes = Self::with_capacity(EntryType::Database, 8);
        append_u64(&mut bytes, database_id.0);
        Self { bytes }
    }

    /// `tag ‖ databaseId ‖ collectionId`
    pub fn collection(database_id: DatabaseId, collection_id: CollectionId) -> Self {
        let mut bytes = Self::with_capacity(EntryType::Collection, 16);
        append_u64(&mut bytes, database_id.0);
        append_u64(&mut bytes, collection_id.0);
        Self { bytes }
    }

    /// `tag ‖ databaseId ‖ collectionId ‖ indexId`
    pub fn index(
        database_id: DatabaseId,
        collection_id: CollectionId,
        index_id: IndexId,
    ) -> Self {
        let mut bytes = Self::with_capacity(EntryType::Index, 24);
        append_u64(&mut bytes, database_id.0);
        append_u64(&mut bytes, collection_id.0);
        append_u64(&mut bytes, index_id.0);
        Self { bytes }
    }

    /// `tag ‖ objectId ‖ revisionId`
    pub fn document(object_id: ObjectId, revision_id: RevisionId) -> Self {
        let mut bytes = Self::with_capacity(EntryType::Document, 16);
        append_u64(&mut bytes, object_id.0);
        append_u64(&mut bytes, revision_id.0);
        Self { bytes }
    }

    /// `tag ‖ indexId ‖ primaryKeyBytes`
    pub fn primary_index_value(index_id: IndexId, primary_key: &str) -> Self {
        let mut bytes =
            Self::with_capacity(EntryType::PrimaryIndexValue, 8 + primary_key.len());
        append_u64(&mut bytes, index_id.0);
        bytes.extend_from_slice(primary_key.as_bytes());
        Self { bytes }
    }

    /// `tag ‖ indexId ‖ vertexIdBytes ‖ 0x00 ‖ revisionId`
    pub fn edge_index_value(
        index_id: IndexId,
        vertex_id: &str,
        revision_id: RevisionId,
    ) -> Self {
        let mut bytes =
            Self::with_capacity(EntryType::EdgeIndexValue, 8 + vertex_id.len() + 9);
        append_u64(&mut bytes, index_id.0);
        bytes.extend_from_slice(vertex_id.as_bytes());
        bytes.push(STRING_SEPARATOR);
        append_u64(&mut bytes, revision_id.0);
        Self { bytes }
    }

    /// `tag ‖ indexId ‖ valueBytes ‖ 0x00 ‖ revisionId`
    pub fn index_value(index_id: IndexId, value: &[u8], revision_id: RevisionId) -> Self {
        let mut bytes = Self::with_capacity(EntryType::IndexValue, 8 + value.len() + 9);
        append_u64(&mut bytes, index_id.0);
        bytes.extend_from_slice(value);
        bytes.push(STRING_SEPARATOR);
        append_u64(&mut bytes, revision_id.0);
        Self { bytes }
    }

    /// `tag ‖ indexId ‖ valueBytes ‖ 0x00`
    pub fn unique_index_value(index_id: IndexId, value: &[u8]) -> Self {
        let mut bytes = Self::with_capacity(EntryType::UniqueIndexValue, 8 + value.len() + 1);
        append_u64(&mut bytes, index_id.0);
        bytes.extend_from_slice(value);
        bytes.push(STRING_SEPARATOR);
        Self { bytes }
    }

    /// `tag ‖ databaseId ‖ viewId`
    pub fn view(database_id: DatabaseId, view_id: u64) -> Self {
        let mut bytes = Self::with_capacity(EntryType::View, 16);
        append_u64(&mut bytes, database_id.0);
        append_u64(&mut bytes, view_id);
        Self { bytes }
    }

    /// `tag ‖ objectId`
    pub fn counter_value(object_id: ObjectId) -> Self {
        let mut bytes = Self::with_capacity(EntryType::CounterValue, 8);
        append_u64(&mut bytes, object_id.0);
        Self { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

// ── extractors ──────────────────────────────────────────────────────────────

/// The entry type of an encoded key.
pub fn entry_type(key: &[u8]) -> Option<EntryType> {
    key.first().copied().and_then(EntryType::from_byte)
}

/// Object id of Document, CounterValue, PrimaryIndexValue, EdgeIndexValue,
/// IndexValue and UniqueIndexValue keys (always the first integer).
pub fn object_id(key: &[u8]) -> Option<ObjectId> {
    match entry_type(key)? {
        EntryType::Document
        | EntryType::CounterValue
        | EntryType::PrimaryIndexValue
        | EntryType::EdgeIndexValue
        | EntryType::IndexValue
        | EntryType::UniqueIndexValue => Some(ObjectId(read_u64(key.get(1..)?)?)),
        _ => None,
    }
}

/// Revision id of a Document key.
pub fn revision_id(key: &[u8]) -> Option<RevisionId> {
    match entry_type(key)? {
        EntryType::Document => Some(RevisionId(read_u64(key.get(9..)?)?)),
        _ => None,
    }
}

/// Database id of Database, Collection, Index and View keys.
pub fn database_id(key: &[u8]) -> Option<DatabaseId> {
    match entry_type(key)? {
        EntryType::Database | EntryType::Collection | EntryType::Index | EntryType::View => {
            Some(DatabaseId(read_u64(key.get(1..)?)?))
        }
        _ => None,
    }
}

/// Collection id of Collection and Index keys.
pub fn collection_id(key: &[u8]) -> Option<CollectionId> {
    match entry_type(key)? {
        EntryType::Collection | EntryType::Index => {
            Some(CollectionId(read_u64(key.get(9..)?)?))
        }
        _ => None,
    }
}

/// Index id of an Index definition key.
pub fn index_id(key: &[u8]) -> Option<IndexId> {
    match entry_type(key)? {
        EntryType::Index => Some(IndexId(read_u64(key.get(17..)?)?)),
        _ => None,
    }
}

/// Primary key suffix of a PrimaryIndexValue key.
pub fn primary_key(key: &[u8]) -> HeronResult<&str> {
    if entry_type(key) != Some(EntryType::PrimaryIndexValue) || key.len() < 9 {
        return Err(HeronError::BadParameter(
            "not a primary index key".into(),
        ));
    }
    std::str::from_utf8(&key[9..])
        .map_err(|_| HeronError::Corrupted("primary key is not valid UTF-8".into()))
}

/// Vertex id of an EdgeIndexValue key.
pub fn vertex_id(key: &[u8]) -> HeronResult<&str> {
    if entry_type(key) != Some(EntryType::EdgeIndexValue) || key.len() < 9 {
        return Err(HeronError::BadParameter("not an edge index key".into()));
    }
    let suffix = &key[9..];
    let end = suffix
        .iter()
        .position(|&b| b == STRING_SEPARATOR)
        .unwrap_or(suffix.len());
    std::str::from_utf8(&suffix[..end])
        .map_err(|_| HeronError::Corrupted("vertex id is not valid UTF-8".into()))
}

// ── fixed-layout decoders ───────────────────────────────────────────────────

pub fn decode_database(key: &[u8]) -> HeronResult<DatabaseId> {
    if entry_type(key) != Some(EntryType::Database) || key.len() != 9 {
        return Err(HeronError::BadParameter("not a database key".into()));
    }
    Ok(DatabaseId(read_u64(&key[1..]).unwrap()))
}

pub fn decode_collection(key: &[u8]) -> HeronResult<(DatabaseId, CollectionId)> {
    if entry_type(key) != Some(EntryType::Collection) || key.len() != 17 {
        return Err(HeronError::BadParameter("not a collection key".into()));
    }
    Ok((
        DatabaseId(read_u64(&key[1..]).unwrap()),
        CollectionId(read_u64(&key[9..]).unwrap()),
    ))
}

pub fn decode_document(key: &[u8]) -> HeronResult<(ObjectId, RevisionId)> {
    if entry_type(key) != Some(EntryType::Document) || key.len() != 17 {
        return Err(HeronError::BadParameter("not a document key".into()));
    }
    Ok((
        ObjectId(read_u64(&key[1..]).unwrap()),
        RevisionId(read_u64(&key[9..]).unwrap()),
    ))
}

pub fn decode_counter(key: &[u8]) -> HeronResult<ObjectId> {
    if entry_type(key) != Some(EntryType::CounterValue) || key.len() != 9 {
        return Err(HeronError::BadParameter("not a counter key".into()));
    }
    Ok(ObjectId(read_u64(&key[1..]).unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_round_trip() {
        let key = Key::document(ObjectId(77), RevisionId(12345));
        assert_eq!(entry_type(key.as_slice()), Some(EntryType::Document));
        assert_eq!(
            decode_document(key.as_slice()).unwrap(),
            (ObjectId(77), RevisionId(12345))
        );
        assert_eq!(object_id(key.as_slice()), Some(ObjectId(77)));
        assert_eq!(revision_id(key.as_slice()), Some(RevisionId(12345)));
    }

    #[test]
    fn test_database_and_collection_round_trip() {
        let db = Key::database(DatabaseId(3));
        assert_eq!(decode_database(db.as_slice()).unwrap(), DatabaseId(3));

        let coll = Key::collection(DatabaseId(3), CollectionId(9));
        assert_eq!(
            decode_collection(coll.as_slice()).unwrap(),
            (DatabaseId(3), CollectionId(9))
        );
        assert_eq!(database_id(coll.as_slice()), Some(DatabaseId(3)));
        assert_eq!(collection_id(coll.as_slice()), Some(CollectionId(9)));
    }

    #[test]
    fn test_counter_round_trip() {
        let key = Key::counter_value(ObjectId(42));
        assert_eq!(decode_counter(key.as_slice()).unwrap(), ObjectId(42));
        assert_eq!(object_id(key.as_slice()), Some(ObjectId(42)));
    }

    #[test]
    fn test_primary_and_edge_extractors() {
        let pk = Key::primary_index_value(IndexId(5), "user/123");
        assert_eq!(primary_key(pk.as_slice()).unwrap(), "user/123");
        assert_eq!(object_id(pk.as_slice()), Some(ObjectId(5)));

        let edge = Key::edge_index_value(IndexId(6), "vertices/abc", RevisionId(10));
        assert_eq!(vertex_id(edge.as_slice()).unwrap(), "vertices/abc");
    }

    #[test]
    fn test_index_definition_key() {
        let key = Key::index(DatabaseId(1), CollectionId(2), IndexId(3));
        assert_eq!(entry_type(key.as_slice()), Some(EntryType::Index));
        assert_eq!(database_id(key.as_slice()), Some(DatabaseId(1)));
        assert_eq!(collection_id(key.as_slice()), Some(CollectionId(2)));
        assert_eq!(index_id(key.as_slice()), Some(IndexId(3)));
    }

    #[test]
    fn test_byte_order_matches_numeric_order() {
        let low = Key::document(ObjectId(1), RevisionId(2));
        let high_rev = Key::document(ObjectId(1), RevisionId(300));
        let high_obj = Key::document(ObjectId(2), RevisionId(1));
        assert!(low < high_rev);
        assert!(high_rev < high_obj);

        let c1 = Key::counter_value(ObjectId(255));
        let c2 = Key::counter_value(ObjectId(256));
        assert!(c1 < c2);
    }

    #[test]
    fn test_types_partition_the_keyspace() {
        // a document key never sorts into the counter range
        let doc = Key::document(ObjectId(u64::MAX), RevisionId(u64::MAX));
        let counter = Key::counter_value(ObjectId(0));
        assert!(doc < counter);
        assert_eq!(entry_type(&[0x2a]), None);
    }

    #[test]
    fn test_wrong_type_decoders_fail() {
        let doc = Key::document(ObjectId(1), RevisionId(1));
        assert!(decode_counter(doc.as_slice()).is_err());
        assert!(decode_collection(doc.as_slice()).is_err());
        assert!(primary_key(doc.as_slice()).is_err());
        assert!(revision_id(Key::counter_value(ObjectId(1)).as_slice()).is_none());
    }
}
