//! Lock column of the in-memory store
//!
//! One lock per key, owned by the transaction whose start timestamp it
//! carries. Pre-written locks carry the value to install on commit; pessimistic
//! locks only reserve the key.

use meridian_common::{Key, Mutation, Op, Timestamp, Value};
use std::collections::BTreeMap;

/// What a lock will turn into when its transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockKind {
    /// Reserved by `SELECT ... FOR UPDATE`, not pre-written yet
    Pessimistic,
    Put(Value),
    Delete,
    /// Pre-written lock-only mutation
    Lock,
}

impl LockKind {
    pub fn from_mutation(mutation: &Mutation) -> Self {
        match mutation.op {
            Op::Put | Op::CheckNotExists => LockKind::Put(mutation.value.clone()),
            Op::Delete => LockKind::Delete,
            Op::Lock => LockKind::Lock,
        }
    }

    pub fn is_pessimistic(&self) -> bool {
        matches!(self, LockKind::Pessimistic)
    }
}

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub primary: Key,
    pub start_ts: Timestamp,
    /// Zero for optimistic locks
    pub for_update_ts: Timestamp,
    pub ttl_ms: u64,
    pub kind: LockKind,
    pub min_commit_ts: Timestamp,
    pub use_async_commit: bool,
    /// Populated on the primary lock of an async-commit transaction
    pub secondaries: Vec<Key>,
}

/// Result of checking whether a transaction may lock a key
#[derive(Debug, Clone, PartialEq)]
pub enum LockAttemptResult {
    /// Key is free
    Free,
    /// Key is already locked by the same transaction
    Owned(LockKind),
    /// Key is locked by another transaction
    Conflict { holder: Timestamp },
}

/// Lock table keyed by user key
#[derive(Debug, Default)]
pub struct LockTable {
    locks: BTreeMap<Key, Lock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            locks: BTreeMap::new(),
        }
    }

    /// Check if `start_ts` may lock `key` without modifying state
    pub fn check(&self, start_ts: Timestamp, key: &[u8]) -> LockAttemptResult {
        match self.locks.get(key) {
            None => LockAttemptResult::Free,
            Some(lock) if lock.start_ts == start_ts => LockAttemptResult::Owned(lock.kind.clone()),
            Some(lock) => LockAttemptResult::Conflict {
                holder: lock.start_ts,
            },
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Lock> {
        self.locks.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut Lock> {
        self.locks.get_mut(key)
    }

    /// Install or replace the lock on `key`
    pub fn grant(&mut self, key: Key, lock: Lock) {
        self.locks.insert(key, lock);
    }

    /// Release the lock on `key` if `start_ts` holds it
    pub fn release(&mut self, start_ts: Timestamp, key: &[u8]) -> Option<Lock> {
        match self.locks.get(key) {
            Some(lock) if lock.start_ts == start_ts => self.locks.remove(key),
            _ => None,
        }
    }

    /// Keys locked by a transaction, in key order
    pub fn locks_held_by(&self, start_ts: Timestamp) -> Vec<Key> {
        self.locks
            .iter()
            .filter(|(_, lock)| lock.start_ts == start_ts)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
