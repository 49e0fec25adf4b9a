//! Atomic write batches and the handler used to replay them.

use serde::{Deserialize, Serialize};

/// A single operation inside a write batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// Delete for keys that are written at most once between deletions.
    /// The store treats it like `Delete`; the distinction is preserved so
    /// batch replay observes the original operation kind.
    SingleDelete { key: Vec<u8> },
}

impl WriteOp {
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } | WriteOp::SingleDelete { key } => {
                key
            }
        }
    }
}

/// An ordered list of operations applied atomically: after a successful
/// write, either all operations are visible or none are.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete { key: key.into() });
    }

    pub fn single_delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::SingleDelete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub(crate) fn from_ops(ops: Vec<WriteOp>) -> Self {
        Self { ops }
    }

    /// Replay the batch through a handler, in original operation order.
    pub fn iterate(&self, handler: &mut dyn BatchHandler) {
        for op in &self.ops {
            match op {
                WriteOp::Put { key, value } => handler.put(key, value),
                WriteOp::Delete { key } => handler.delete(key),
                WriteOp::SingleDelete { key } => handler.single_delete(key),
            }
        }
    }
}

/// Callbacks invoked when replaying a write batch, e.g. during counter
/// recovery or WAL tailing.
pub trait BatchHandler {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
    fn single_delete(&mut self, key: &[u8]) {
        self.delete(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        puts: Vec<Vec<u8>>,
        deletes: Vec<Vec<u8>>,
        single_deletes: Vec<Vec<u8>>,
    }

    impl BatchHandler for Recorder {
        fn put(&mut self, key: &[u8], _value: &[u8]) {
            self.puts.push(key.to_vec());
        }
        fn delete(&mut self, key: &[u8]) {
            self.deletes.push(key.to_vec());
        }
        fn single_delete(&mut self, key: &[u8]) {
            self.single_deletes.push(key.to_vec());
        }
    }

    #[test]
    fn test_iterate_preserves_order_and_kind() {
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.delete(b"b".to_vec());
        batch.single_delete(b"c".to_vec());
        batch.put(b"d".to_vec(), b"2".to_vec());

        let mut rec = Recorder::default();
        batch.iterate(&mut rec);
        assert_eq!(rec.puts, vec![b"a".to_vec(), b"d".to_vec()]);
        assert_eq!(rec.deletes, vec![b"b".to_vec()]);
        assert_eq!(rec.single_deletes, vec![b"c".to_vec()]);
    }

    #[test]
    fn test_single_delete_defaults_to_delete() {
        struct DeleteOnly(Vec<Vec<u8>>);
        impl BatchHandler for DeleteOnly {
            fn put(&mut self, _key: &[u8], _value: &[u8]) {}
            fn delete(&mut self, key: &[u8]) {
                self.0.push(key.to_vec());
            }
        }

        let mut batch = WriteBatch::new();
        batch.single_delete(b"x".to_vec());
        let mut h = DeleteOnly(Vec::new());
        batch.iterate(&mut h);
        assert_eq!(h.0, vec![b"x".to_vec()]);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        batch.delete(b"gone".to_vec());
        let bytes = bincode::serialize(&batch).unwrap();
        let back: WriteBatch = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.ops(), batch.ops());
    }
}
