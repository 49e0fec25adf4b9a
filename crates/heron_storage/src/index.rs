//! Index maintenance.
//!
//! Every collection carries a primary index (`_key` → revision). Edge
//! collections additionally maintain the edge index over `_from` and `_to`.
//! Persistent value indexes extract the configured fields, encode them with
//! the canonical sort-key encoding and store one entry per document; unique
//! indexes probe for a live conflicting entry first and refuse the write.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use heron_common::error::{HeronError, HeronResult};
use heron_common::types::{attrs, IndexId, RevisionId};
use heron_common::value::sort_key_bytes;
use heron_lsm::StoreTransaction;

use crate::bounds::KeyBounds;
use crate::keys::Key;

/// Index flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Primary,
    Edge,
    Persistent,
}

/// Persisted index definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub id: IndexId,
    #[serde(rename = "type")]
    pub kind: IndexKind,
    pub fields: Vec<String>,
    pub unique: bool,
}

impl IndexDescriptor {
    pub fn primary(id: IndexId) -> Self {
        Self {
            id,
            kind: IndexKind::Primary,
            fields: vec![attrs::KEY.to_string()],
            unique: true,
        }
    }

    pub fn edge(id: IndexId) -> Self {
        Self {
            id,
            kind: IndexKind::Edge,
            fields: vec![attrs::FROM.to_string(), attrs::TO.to_string()],
            unique: false,
        }
    }

    pub fn persistent(id: IndexId, fields: Vec<String>, unique: bool) -> Self {
        Self {
            id,
            kind: IndexKind::Persistent,
            fields,
            unique,
        }
    }
}

/// A live index over one collection.
#[derive(Debug, Clone)]
pub struct Index {
    descriptor: IndexDescriptor,
}

fn string_attr<'a>(doc: &'a Value, name: &str) -> HeronResult<&'a str> {
    doc.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| HeronError::BadParameter(format!("missing attribute '{name}'")))
}

/// Encode the indexed fields of `doc` as one concatenated sort key. Missing
/// fields index as null.
fn extract_fields(doc: &Value, fields: &[String]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for field in fields {
        let value = doc.get(field).unwrap_or(&Value::Null);
        bytes.extend_from_slice(&sort_key_bytes(value));
    }
    bytes
}

impl Index {
    pub fn new(descriptor: IndexDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> IndexId {
        self.descriptor.id
    }

    pub fn kind(&self) -> IndexKind {
        self.descriptor.kind
    }

    /// Add this document's entries. The caller wraps the whole operation in
    /// a save-point, so a failure here unwinds cleanly.
    pub fn insert(
        &self,
        txn: &mut StoreTransaction,
        doc: &Value,
        revision: RevisionId,
    ) -> HeronResult<()> {
        match self.descriptor.kind {
            IndexKind::Primary => {
                let key = string_attr(doc, attrs::KEY)?;
                txn.put(
                    Key::primary_index_value(self.descriptor.id, key).into_bytes(),
                    revision.0.to_be_bytes().to_vec(),
                );
            }
            IndexKind::Edge => {
                let from = string_attr(doc, attrs::FROM)?;
                let to = string_attr(doc, attrs::TO)?;
                txn.put(
                    Key::edge_index_value(self.descriptor.id, from, revision).into_bytes(),
                    Vec::new(),
                );
                txn.put(
                    Key::edge_index_value(self.descriptor.id, to, revision).into_bytes(),
                    Vec::new(),
                );
            }
            IndexKind::Persistent => {
                let value = extract_fields(doc, &self.descriptor.fields);
                if self.descriptor.unique {
                    let key = Key::unique_index_value(self.descriptor.id, &value);
                    if txn.get(key.as_slice()).is_some() {
                        return Err(HeronError::UniqueConstraintViolated(format!(
                            "index {} on [{}]",
                            self.descriptor.id,
                            self.descriptor.fields.join(", ")
                        )));
                    }
                    txn.put(key.into_bytes(), revision.0.to_be_bytes().to_vec());
                } else {
                    txn.put(
                        Key::index_value(self.descriptor.id, &value, revision).into_bytes(),
                        Vec::new(),
                    );
                }
            }
        }
        Ok(())
    }

    /// Remove this document's entries. Mirrors `insert` exactly.
    pub fn remove(
        &self,
        txn: &mut StoreTransaction,
        doc: &Value,
        revision: RevisionId,
    ) -> HeronResult<()> {
        match self.descriptor.kind {
            IndexKind::Primary => {
                let key = string_attr(doc, attrs::KEY)?;
                txn.delete(Key::primary_index_value(self.descriptor.id, key).into_bytes());
            }
            IndexKind::Edge => {
                let from = string_attr(doc, attrs::FROM)?;
                let to = string_attr(doc, attrs::TO)?;
                txn.delete(
                    Key::edge_index_value(self.descriptor.id, from, revision).into_bytes(),
                );
                txn.delete(Key::edge_index_value(self.descriptor.id, to, revision).into_bytes());
            }
            IndexKind::Persistent => {
                let value = extract_fields(doc, &self.descriptor.fields);
                if self.descriptor.unique {
                    txn.delete(Key::unique_index_value(self.descriptor.id, &value).into_bytes());
                } else {
                    txn.single_delete(
                        Key::index_value(self.descriptor.id, &value, revision).into_bytes(),
                    );
                }
            }
        }
        Ok(())
    }

    /// Bounds spanning all entries of this index.
    pub fn bounds(&self) -> KeyBounds {
        match self.descriptor.kind {
            IndexKind::Primary => KeyBounds::primary_index(self.descriptor.id),
            IndexKind::Edge => KeyBounds::edge_index(self.descriptor.id),
            IndexKind::Persistent => {
                if self.descriptor.unique {
                    KeyBounds::unique_index(self.descriptor.id)
                } else {
                    KeyBounds::index_entries(self.descriptor.id)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_lsm::{StoreConfig, TreeStore, WriteOptions};
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, Arc<TreeStore>) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = TreeStore::open(dir.path(), StoreConfig::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_primary_index_entry() {
        let (_dir, store) = store();
        let index = Index::new(IndexDescriptor::primary(IndexId(1)));
        let mut txn = store.begin_transaction();
        index
            .insert(&mut txn, &json!({"_key": "alpha"}), RevisionId(7))
            .unwrap();
        txn.commit(&WriteOptions::default()).unwrap();

        let key = Key::primary_index_value(IndexId(1), "alpha");
        let stored = store.get(key.as_slice(), &Default::default()).unwrap();
        assert_eq!(stored, 7u64.to_be_bytes().to_vec());
    }

    #[test]
    fn test_edge_index_entries_for_both_endpoints() {
        let (_dir, store) = store();
        let index = Index::new(IndexDescriptor::edge(IndexId(2)));
        let doc = json!({"_key": "e1", "_from": "v/1", "_to": "v/2"});
        let mut txn = store.begin_transaction();
        index.insert(&mut txn, &doc, RevisionId(5)).unwrap();
        txn.commit(&WriteOptions::default()).unwrap();

        let bounds = KeyBounds::edge_index_vertex(IndexId(2), "v/1");
        assert_eq!(
            store.count_range(bounds.start(), bounds.end(), &Default::default()),
            1
        );
        let bounds = KeyBounds::edge_index_vertex(IndexId(2), "v/2");
        assert_eq!(
            store.count_range(bounds.start(), bounds.end(), &Default::default()),
            1
        );

        // removal clears both entries
        let mut txn = store.begin_transaction();
        index.remove(&mut txn, &doc, RevisionId(5)).unwrap();
        txn.commit(&WriteOptions::default()).unwrap();
        let bounds = KeyBounds::edge_index(IndexId(2));
        assert_eq!(
            store.count_range(bounds.start(), bounds.end(), &Default::default()),
            0
        );
    }

    #[test]
    fn test_edge_index_requires_endpoints() {
        let (_dir, store) = store();
        let index = Index::new(IndexDescriptor::edge(IndexId(2)));
        let mut txn = store.begin_transaction();
        let err = index
            .insert(&mut txn, &json!({"_key": "e1"}), RevisionId(5))
            .unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_unique_index_rejects_duplicate_value() {
        let (_dir, store) = store();
        let index = Index::new(IndexDescriptor::persistent(
            IndexId(3),
            vec!["email".into()],
            true,
        ));
        let mut txn = store.begin_transaction();
        index
            .insert(&mut txn, &json!({"email": "a@b.c"}), RevisionId(1))
            .unwrap();
        // same value, different document: refused within the same txn view
        let err = index
            .insert(&mut txn, &json!({"email": "a@b.c"}), RevisionId(2))
            .unwrap_err();
        assert_eq!(err.code(), 1210);

        // a different value is fine
        index
            .insert(&mut txn, &json!({"email": "x@y.z"}), RevisionId(3))
            .unwrap();
    }

    #[test]
    fn test_non_unique_index_allows_duplicates() {
        let (_dir, store) = store();
        let index = Index::new(IndexDescriptor::persistent(
            IndexId(4),
            vec!["age".into()],
            false,
        ));
        let mut txn = store.begin_transaction();
        index
            .insert(&mut txn, &json!({"age": 42}), RevisionId(1))
            .unwrap();
        index
            .insert(&mut txn, &json!({"age": 42}), RevisionId(2))
            .unwrap();
        txn.commit(&WriteOptions::default()).unwrap();

        let bounds = index.bounds();
        assert_eq!(
            store.count_range(bounds.start(), bounds.end(), &Default::default()),
            2
        );
    }

    #[test]
    fn test_missing_persistent_field_indexes_as_null() {
        let (_dir, store) = store();
        let index = Index::new(IndexDescriptor::persistent(
            IndexId(5),
            vec!["nickname".into()],
            false,
        ));
        let mut txn = store.begin_transaction();
        index.insert(&mut txn, &json!({}), RevisionId(1)).unwrap();
        txn.commit(&WriteOptions::default()).unwrap();

        let bounds = index.bounds();
        assert_eq!(
            store.count_range(bounds.start(), bounds.end(), &Default::default()),
            1
        );
    }
}
