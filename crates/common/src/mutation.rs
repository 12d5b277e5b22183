//! Buffered writes and the partitions they belong to

use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw encoded key.
pub type Key = Vec<u8>;

/// Raw encoded value.
pub type Value = Vec<u8>;

/// Kind of write a mutation performs when it is pre-written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    /// Write a value
    Put,
    /// Delete the key
    Delete,
    /// Write a value, failing with a duplicate entry if the key already exists
    CheckNotExists,
    /// Lock the key without changing its value (`SELECT ... FOR UPDATE`)
    Lock,
}

impl Op {
    /// Whether the mutation changes the stored value on commit.
    pub fn is_write(&self) -> bool {
        matches!(self, Op::Put | Op::Delete | Op::CheckNotExists)
    }
}

/// A single buffered `(key, value, operation)` write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub key: Key,
    pub value: Value,
    pub op: Op,
}

impl Mutation {
    pub fn put(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            op: Op::Put,
        }
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            op: Op::Delete,
        }
    }

    pub fn insert(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            op: Op::CheckNotExists,
        }
    }

    pub fn lock(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            op: Op::Lock,
        }
    }

    /// Bytes this mutation contributes to a request payload.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// One `(table, partition)` pair touched by a transaction.
///
/// Partitions are the unit of routing: every partition is served by exactly
/// one storage region at a time, so a partition id is also a region id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnPartData {
    pub table_id: u64,
    pub partition_id: u64,
}

impl TxnPartData {
    pub const fn new(table_id: u64, partition_id: u64) -> Self {
        Self {
            table_id,
            partition_id,
        }
    }
}

impl fmt::Display for TxnPartData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table_id, self.partition_id)
    }
}

/// Isolation level a transaction reads with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Every read observes the snapshot at the start timestamp
    #[default]
    SnapshotIsolation,
    /// Every read observes the latest committed data
    ReadCommitted,
}

/// Locking discipline of a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Conflicts are detected at pre-write time
    #[default]
    Optimistic,
    /// Keys are locked while the statement executes
    Pessimistic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_constructors() {
        let m = Mutation::insert(b"k1".to_vec(), b"v".to_vec());
        assert_eq!(m.op, Op::CheckNotExists);
        assert_eq!(m.size(), 3);

        assert!(!Mutation::lock(b"k".to_vec()).op.is_write());
        assert!(Mutation::delete(b"k".to_vec()).op.is_write());
    }

    #[test]
    fn test_part_ordering() {
        let a = TxnPartData::new(1, 10);
        let b = TxnPartData::new(1, 11);
        let c = TxnPartData::new(2, 0);
        assert!(a < b && b < c);
        assert_eq!(a.to_string(), "1:10");
    }

    #[test]
    fn test_mutation_serde() {
        let m = Mutation::put(b"k".to_vec(), b"v".to_vec());
        let json = serde_json::to_string(&m).unwrap();
        let back: Mutation = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }
}
