//! Collection export: a stable copy of a collection's documents plus a
//! paginating cursor with field restrictions.
//!
//! The export holds the collection handle for its whole lifetime (nothing
//! can drop it away underneath) and copies the payloads inside one read
//! transaction, so the result is a consistent snapshot. The cursor then
//! serves pages shaped `{result, hasMore, id, count, extra}`.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use heron_common::error::HeronResult;

use crate::catalog::Database;
use crate::collection::Collection;
use crate::txn::TransactionHints;

/// Field-level restriction applied when dumping documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restrictions {
    None,
    /// Only the named fields are emitted.
    Include(HashSet<String>),
    /// The named fields are dropped.
    Exclude(HashSet<String>),
}

impl Restrictions {
    fn allows(&self, field: &str) -> bool {
        match self {
            Restrictions::None => true,
            Restrictions::Include(fields) => fields.contains(field),
            Restrictions::Exclude(fields) => !fields.contains(field),
        }
    }

    /// Apply the restriction to one document.
    pub fn apply(&self, document: &Value) -> Value {
        match document {
            Value::Object(map) => {
                let filtered: Map<String, Value> = map
                    .iter()
                    .filter(|(field, _)| self.allows(field))
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect();
                Value::Object(filtered)
            }
            other => other.clone(),
        }
    }
}

/// A consistent copy of a collection's documents.
pub struct CollectionExport {
    collection: Arc<Collection>,
    restrictions: Restrictions,
    documents: Vec<Value>,
}

impl CollectionExport {
    /// Collect up to `limit` documents (0 = all) inside one read
    /// transaction.
    pub fn run(
        database: &Database,
        collection: Arc<Collection>,
        restrictions: Restrictions,
        limit: usize,
    ) -> HeronResult<Self> {
        let mut state = crate::txn::TransactionState::new(
            Arc::clone(database.services()),
            TransactionHints {
                read_only: true,
                ..Default::default()
            },
        );
        state.begin()?;
        state.add_collection(&collection);

        let mut documents = Vec::new();
        collection.for_each_document(&state, limit, |_revision, data| {
            if let Ok(value) = serde_json::from_slice::<Value>(data) {
                documents.push(value);
            }
            true
        })?;
        state.abort()?;

        Ok(Self {
            collection,
            restrictions,
            documents,
        })
    }

    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Pages an export into `{result, hasMore, id, count, extra}` envelopes.
pub struct ExportCursor {
    id: u64,
    export: CollectionExport,
    batch_size: usize,
    position: usize,
}

impl ExportCursor {
    pub fn new(id: u64, export: CollectionExport, batch_size: usize) -> Self {
        Self {
            id,
            export,
            batch_size: batch_size.max(1),
            position: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn has_next(&self) -> bool {
        self.position < self.export.documents.len()
    }

    pub fn count(&self) -> usize {
        self.export.documents.len()
    }

    /// Produce the next page.
    pub fn next_batch(&mut self) -> Value {
        let mut result = Vec::with_capacity(self.batch_size);
        while self.position < self.export.documents.len() && result.len() < self.batch_size {
            let document = &self.export.documents[self.position];
            result.push(self.export.restrictions.apply(document));
            self.position += 1;
        }

        let mut envelope = json!({
            "result": result,
            "hasMore": self.has_next(),
            "count": self.count(),
            "extra": {},
        });
        if self.has_next() {
            envelope["id"] = Value::String(self.id.to_string());
        }
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn restriction_set(fields: &[&str]) -> HashSet<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_restrictions_none_keeps_everything() {
        let doc = json!({"_key": "a", "name": "x", "secret": 1});
        assert_eq!(Restrictions::None.apply(&doc), doc);
    }

    #[test]
    fn test_restrictions_include() {
        let doc = json!({"_key": "a", "name": "x", "secret": 1});
        let filtered = Restrictions::Include(restriction_set(&["_key", "name"])).apply(&doc);
        assert_eq!(filtered, json!({"_key": "a", "name": "x"}));
    }

    #[test]
    fn test_restrictions_exclude() {
        let doc = json!({"_key": "a", "name": "x", "secret": 1});
        let filtered = Restrictions::Exclude(restriction_set(&["secret"])).apply(&doc);
        assert_eq!(filtered, json!({"_key": "a", "name": "x"}));
    }
}
