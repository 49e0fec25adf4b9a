//! Range bounds for every entry kind.
//!
//! Each constructor yields a half-open `[start, end)` range; an iterator
//! constrained to it never observes keys of another kind. Open-ended ranges
//! compute their end with the `next_prefix` rule: the smallest byte string
//! lexicographically greater than every key sharing the prefix.

use heron_common::error::{HeronError, HeronResult};
use heron_common::types::{CollectionId, DatabaseId, IndexId, ObjectId};
use heron_common::value::{VALUE_MAX, VALUE_MIN};

use crate::keys::{append_u64, EntryType};

/// A half-open key range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBounds {
    start: Vec<u8>,
    end: Vec<u8>,
}

/// Compute the smallest byte string greater than every string prefixed by
/// `s`, in place: scan from the last byte; skip `0xff` bytes; increment the
/// first non-`0xff` byte and zero the tail. An all-`0xff` string gets a
/// `0x00` appended instead.
pub fn next_prefix(s: &mut Vec<u8>) {
    debug_assert!(!s.is_empty());

    let mut i = s.len() - 1;
    while i > 0 && s[i] == 0xff {
        i -= 1;
    }

    if i == 0 && s[0] == 0xff {
        s.push(0x00);
        return;
    }

    s[i] = s[i].wrapping_add(1);
    for byte in &mut s[i + 1..] {
        *byte = 0x00;
    }
}

fn prefix(entry_type: EntryType, ids: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + ids.len() * 8);
    bytes.push(entry_type as u8);
    for &id in ids {
        append_u64(&mut bytes, id);
    }
    bytes
}

fn prefixed(entry_type: EntryType, ids: &[u64]) -> KeyBounds {
    let start = prefix(entry_type, ids);
    let mut end = start.clone();
    next_prefix(&mut end);
    KeyBounds { start, end }
}

impl KeyBounds {
    /// All database records.
    pub fn databases() -> Self {
        prefixed(EntryType::Database, &[])
    }

    /// All collection records of one database.
    pub fn database_collections(database_id: DatabaseId) -> Self {
        prefixed(EntryType::Collection, &[database_id.0])
    }

    /// All index definition records of one collection.
    pub fn collection_indexes(database_id: DatabaseId, collection_id: CollectionId) -> Self {
        prefixed(EntryType::Index, &[database_id.0, collection_id.0])
    }

    /// All documents of one collection object.
    pub fn collection_documents(object_id: ObjectId) -> Self {
        prefixed(EntryType::Document, &[object_id.0])
    }

    /// All entries of one primary index.
    pub fn primary_index(index_id: IndexId) -> Self {
        prefixed(EntryType::PrimaryIndexValue, &[index_id.0])
    }

    /// All entries of one edge index.
    pub fn edge_index(index_id: IndexId) -> Self {
        prefixed(EntryType::EdgeIndexValue, &[index_id.0])
    }

    /// All edges of one vertex in one edge index.
    pub fn edge_index_vertex(index_id: IndexId, vertex_id: &str) -> Self {
        let mut start = prefix(EntryType::EdgeIndexValue, &[index_id.0]);
        start.extend_from_slice(vertex_id.as_bytes());
        start.push(crate::keys::STRING_SEPARATOR);
        let mut end = start.clone();
        next_prefix(&mut end);
        KeyBounds { start, end }
    }

    /// All entries of one non-unique value index. The value encoding sorts
    /// strictly between the two sentinels.
    pub fn index_entries(index_id: IndexId) -> Self {
        let common = prefix(EntryType::IndexValue, &[index_id.0]);
        let mut start = common.clone();
        start.push(VALUE_MIN);
        let mut end = common;
        end.push(VALUE_MAX);
        KeyBounds { start, end }
    }

    /// All entries of one unique value index.
    pub fn unique_index(index_id: IndexId) -> Self {
        let common = prefix(EntryType::UniqueIndexValue, &[index_id.0]);
        let mut start = common.clone();
        start.push(VALUE_MIN);
        let mut end = common;
        end.push(VALUE_MAX);
        KeyBounds { start, end }
    }

    /// Entries of one non-unique value index between two encoded values,
    /// `[left, right]` inclusive on the value level.
    pub fn index_range(index_id: IndexId, left: &[u8], right: &[u8]) -> Self {
        let common = prefix(EntryType::IndexValue, &[index_id.0]);
        let mut start = common.clone();
        start.extend_from_slice(left);
        let mut end = common;
        end.extend_from_slice(right);
        end.push(crate::keys::STRING_SEPARATOR);
        next_prefix(&mut end);
        KeyBounds { start, end }
    }

    /// Same, for a unique value index.
    pub fn unique_index_range(index_id: IndexId, left: &[u8], right: &[u8]) -> Self {
        let common = prefix(EntryType::UniqueIndexValue, &[index_id.0]);
        let mut start = common.clone();
        start.extend_from_slice(left);
        let mut end = common;
        end.extend_from_slice(right);
        end.push(crate::keys::STRING_SEPARATOR);
        next_prefix(&mut end);
        KeyBounds { start, end }
    }

    /// All view records of one database.
    pub fn database_views(database_id: DatabaseId) -> Self {
        prefixed(EntryType::View, &[database_id.0])
    }

    /// All persisted counter records.
    pub fn counter_values() -> Self {
        prefixed(EntryType::CounterValue, &[])
    }

    /// Dynamic dispatch over `(entry type, id arity)`, for callers that
    /// carry the type as data. Unsupported combinations are refused.
    pub fn for_entry_type(
        entry_type: EntryType,
        first: Option<u64>,
        second: Option<u64>,
    ) -> HeronResult<Self> {
        match (entry_type, first, second) {
            (EntryType::Database, None, None) => Ok(Self::databases()),
            (EntryType::CounterValue, None, None) => Ok(Self::counter_values()),
            (EntryType::Collection, Some(db), None) => {
                Ok(Self::database_collections(DatabaseId(db)))
            }
            (EntryType::Document, Some(obj), None) => {
                Ok(Self::collection_documents(ObjectId(obj)))
            }
            (EntryType::PrimaryIndexValue, Some(idx), None) => {
                Ok(Self::primary_index(IndexId(idx)))
            }
            (EntryType::EdgeIndexValue, Some(idx), None) => Ok(Self::edge_index(IndexId(idx))),
            (EntryType::IndexValue, Some(idx), None) => Ok(Self::index_entries(IndexId(idx))),
            (EntryType::UniqueIndexValue, Some(idx), None) => {
                Ok(Self::unique_index(IndexId(idx)))
            }
            (EntryType::View, Some(db), None) => Ok(Self::database_views(DatabaseId(db))),
            (EntryType::Index, Some(db), Some(cid)) => Ok(Self::collection_indexes(
                DatabaseId(db),
                CollectionId(cid),
            )),
            _ => Err(HeronError::BadParameter(format!(
                "unsupported bounds combination: {entry_type:?}"
            ))),
        }
    }

    pub fn start(&self) -> &[u8] {
        &self.start
    }

    pub fn end(&self) -> &[u8] {
        &self.end
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key < self.end.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Key;
    use heron_common::types::RevisionId;
    use heron_common::value::sort_key_bytes;
    use serde_json::json;

    #[test]
    fn test_next_prefix_increments_last_byte() {
        let mut s = vec![0x33, 0x00, 0x01];
        next_prefix(&mut s);
        assert_eq!(s, vec![0x33, 0x00, 0x02]);
    }

    #[test]
    fn test_next_prefix_skips_trailing_ff() {
        let mut s = vec![0x33, 0x01, 0xff, 0xff];
        next_prefix(&mut s);
        assert_eq!(s, vec![0x33, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_next_prefix_all_ff_appends_zero() {
        let mut s = vec![0xff, 0xff];
        next_prefix(&mut s);
        assert_eq!(s, vec![0xff, 0xff, 0x00]);
    }

    #[test]
    fn test_document_bounds_contain_only_own_collection() {
        let bounds = KeyBounds::collection_documents(ObjectId(7));
        assert!(bounds.contains(Key::document(ObjectId(7), RevisionId(0)).as_slice()));
        assert!(bounds.contains(Key::document(ObjectId(7), RevisionId(u64::MAX)).as_slice()));
        assert!(!bounds.contains(Key::document(ObjectId(8), RevisionId(0)).as_slice()));
        assert!(!bounds.contains(Key::document(ObjectId(6), RevisionId(u64::MAX)).as_slice()));
        assert!(!bounds.contains(Key::counter_value(ObjectId(7)).as_slice()));
    }

    #[test]
    fn test_counter_bounds_span_all_objects() {
        let bounds = KeyBounds::counter_values();
        assert!(bounds.contains(Key::counter_value(ObjectId(0)).as_slice()));
        assert!(bounds.contains(Key::counter_value(ObjectId(u64::MAX)).as_slice()));
        assert!(!bounds.contains(Key::document(ObjectId(0), RevisionId(0)).as_slice()));
    }

    #[test]
    fn test_collection_bounds_scoped_to_database() {
        let bounds = KeyBounds::database_collections(DatabaseId(1));
        assert!(bounds.contains(Key::collection(DatabaseId(1), CollectionId(99)).as_slice()));
        assert!(!bounds.contains(Key::collection(DatabaseId(2), CollectionId(0)).as_slice()));
    }

    #[test]
    fn test_every_generated_key_within_its_bounds() {
        let cases: Vec<(Vec<u8>, KeyBounds)> = vec![
            (
                Key::database(DatabaseId(5)).into_bytes(),
                KeyBounds::databases(),
            ),
            (
                Key::collection(DatabaseId(5), CollectionId(6)).into_bytes(),
                KeyBounds::database_collections(DatabaseId(5)),
            ),
            (
                Key::index(DatabaseId(5), CollectionId(6), IndexId(7)).into_bytes(),
                KeyBounds::collection_indexes(DatabaseId(5), CollectionId(6)),
            ),
            (
                Key::document(ObjectId(5), RevisionId(17)).into_bytes(),
                KeyBounds::collection_documents(ObjectId(5)),
            ),
            (
                Key::primary_index_value(IndexId(5), "some-key").into_bytes(),
                KeyBounds::primary_index(IndexId(5)),
            ),
            (
                Key::edge_index_value(IndexId(5), "v/1", RevisionId(3)).into_bytes(),
                KeyBounds::edge_index(IndexId(5)),
            ),
            (
                Key::edge_index_value(IndexId(5), "v/1", RevisionId(3)).into_bytes(),
                KeyBounds::edge_index_vertex(IndexId(5), "v/1"),
            ),
            (
                Key::counter_value(ObjectId(5)).into_bytes(),
                KeyBounds::counter_values(),
            ),
            (
                Key::view(DatabaseId(5), 8).into_bytes(),
                KeyBounds::database_views(DatabaseId(5)),
            ),
        ];
        for (key, bounds) in cases {
            assert!(
                bounds.contains(&key),
                "key {key:?} outside bounds {bounds:?}"
            );
        }
    }

    #[test]
    fn test_value_index_bounds_contain_encoded_values() {
        let idx = IndexId(11);
        let value = sort_key_bytes(&json!({"age": 42}));
        let entry = Key::index_value(idx, &value, RevisionId(1));
        let bounds = KeyBounds::index_entries(idx);
        assert!(bounds.contains(entry.as_slice()));

        let unique_entry = Key::unique_index_value(idx, &value);
        let unique_bounds = KeyBounds::unique_index(idx);
        assert!(unique_bounds.contains(unique_entry.as_slice()));

        // other index ids stay outside
        let other = Key::index_value(IndexId(12), &value, RevisionId(1));
        assert!(!bounds.contains(other.as_slice()));
    }

    #[test]
    fn test_index_range_bounds() {
        let idx = IndexId(3);
        let low = sort_key_bytes(&json!(10));
        let mid = sort_key_bytes(&json!(20));
        let high = sort_key_bytes(&json!(30));

        let bounds = KeyBounds::index_range(idx, &low, &mid);
        assert!(bounds.contains(Key::index_value(idx, &low, RevisionId(1)).as_slice()));
        assert!(bounds.contains(Key::index_value(idx, &mid, RevisionId(1)).as_slice()));
        assert!(!bounds.contains(Key::index_value(idx, &high, RevisionId(1)).as_slice()));
    }

    #[test]
    fn test_edge_vertex_bounds_exclude_other_vertices() {
        let idx = IndexId(4);
        let bounds = KeyBounds::edge_index_vertex(idx, "v/1");
        assert!(bounds.contains(Key::edge_index_value(idx, "v/1", RevisionId(9)).as_slice()));
        assert!(!bounds.contains(Key::edge_index_value(idx, "v/10", RevisionId(9)).as_slice()));
        assert!(!bounds.contains(Key::edge_index_value(idx, "v/2", RevisionId(9)).as_slice()));
    }

    #[test]
    fn test_for_entry_type_dispatch() {
        assert_eq!(
            KeyBounds::for_entry_type(EntryType::Database, None, None).unwrap(),
            KeyBounds::databases()
        );
        assert_eq!(
            KeyBounds::for_entry_type(EntryType::Document, Some(7), None).unwrap(),
            KeyBounds::collection_documents(ObjectId(7))
        );
        assert_eq!(
            KeyBounds::for_entry_type(EntryType::Index, Some(1), Some(2)).unwrap(),
            KeyBounds::collection_indexes(DatabaseId(1), CollectionId(2))
        );

        // unsupported combinations fail with BadParameter
        let err = KeyBounds::for_entry_type(EntryType::Document, None, None).unwrap_err();
        assert_eq!(err.code(), 400);
        let err = KeyBounds::for_entry_type(EntryType::Database, Some(1), Some(2)).unwrap_err();
        assert_eq!(err.code(), 400);
    }
}
