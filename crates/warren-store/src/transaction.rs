//! Batched all-or-nothing writes.
//!
//! A [`Transaction`] groups puts and deletes with optional guards. Guards
//! are checked against the store's current state before any op applies;
//! a failed guard aborts the whole batch with `Conflict`.

use crate::Collection;

/// A single operation inside a transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put {
        collection: Collection,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        collection: Collection,
        key: String,
    },
}

/// A precondition checked before a transaction applies.
#[derive(Debug, Clone)]
pub enum Guard {
    /// The key must not exist (uniqueness insert).
    Absent { collection: Collection, key: String },
    /// The key must exist.
    Exists { collection: Collection, key: String },
    /// The stored bytes must equal `expected` (compare-and-swap).
    Matches {
        collection: Collection,
        key: String,
        expected: Vec<u8>,
    },
}

/// An ordered batch of guarded writes.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub(crate) guards: Vec<Guard>,
    pub(crate) ops: Vec<TxnOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of operations in the batch.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn put(mut self, collection: Collection, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.ops.push(TxnOp::Put {
            collection,
            key: key.into(),
            value,
        });
        self
    }

    /// Encodes `record` with postcard and adds a put.
    pub fn put_record<T: serde::Serialize>(
        self,
        collection: Collection,
        key: impl Into<String>,
        record: &T,
    ) -> Self {
        let bytes = postcard::to_allocvec(record)
            .expect("record serialization is infallible for in-memory types");
        self.put(collection, key, bytes)
    }

    pub fn delete(mut self, collection: Collection, key: impl Into<String>) -> Self {
        self.ops.push(TxnOp::Delete {
            collection,
            key: key.into(),
        });
        self
    }

    pub fn guard_absent(mut self, collection: Collection, key: impl Into<String>) -> Self {
        self.guards.push(Guard::Absent {
            collection,
            key: key.into(),
        });
        self
    }

    pub fn guard_exists(mut self, collection: Collection, key: impl Into<String>) -> Self {
        self.guards.push(Guard::Exists {
            collection,
            key: key.into(),
        });
        self
    }

    pub fn guard_matches(
        mut self,
        collection: Collection,
        key: impl Into<String>,
        expected: Vec<u8>,
    ) -> Self {
        self.guards.push(Guard::Matches {
            collection,
            key: key.into(),
            expected,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_ops_in_order() {
        let txn = Transaction::new()
            .put(Collection::Services, "a", vec![1])
            .delete(Collection::Services, "b")
            .guard_exists(Collection::Services, "b");

        assert_eq!(txn.len(), 2);
        assert_eq!(txn.guards.len(), 1);
        assert!(matches!(txn.ops[0], TxnOp::Put { .. }));
        assert!(matches!(txn.ops[1], TxnOp::Delete { .. }));
    }
}
