//! Per-transaction buffer of uncommitted writes
//!
//! Writes are grouped by the partition they route to and kept in insertion
//! order; writing a key twice keeps its original slot. The first key ever
//! buffered (or pessimistically locked) becomes the primary.

use meridian_common::{Key, Mutation, Op, TxnPartData};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Buffered mutations of every partition, in partition order.
pub type WriteSet = BTreeMap<TxnPartData, Vec<Mutation>>;

#[derive(Debug, Default)]
struct PartitionBuffer {
    mutations: Vec<Mutation>,
    index: HashMap<Key, usize>,
    /// Holds only plain row data; index data disables async commit
    scalar_only: bool,
}

#[derive(Debug, Default)]
pub struct TxnCache {
    partitions: BTreeMap<TxnPartData, PartitionBuffer>,
    key_parts: HashMap<Key, TxnPartData>,
    primary: Option<(TxnPartData, Key)>,
    /// Keys holding a pessimistic lock of this transaction
    locked: BTreeMap<TxnPartData, BTreeSet<Key>>,
}

impl TxnCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a row write
    pub fn put(&mut self, part: TxnPartData, mutation: Mutation) {
        self.stage(part, mutation, true);
    }

    /// Buffer a write to index data that cannot use async commit
    pub fn put_non_scalar(&mut self, part: TxnPartData, mutation: Mutation) {
        self.stage(part, mutation, false);
    }

    fn stage(&mut self, part: TxnPartData, mutation: Mutation, scalar: bool) {
        if self.primary.is_none() {
            self.primary = Some((part, mutation.key.clone()));
        }
        self.key_parts.insert(mutation.key.clone(), part);

        let buffer = self.partitions.entry(part).or_insert_with(|| PartitionBuffer {
            scalar_only: true,
            ..Default::default()
        });
        buffer.scalar_only &= scalar;

        match buffer.index.get(&mutation.key) {
            Some(&slot) => {
                let existing = &mut buffer.mutations[slot];
                *existing = merge(existing, mutation);
            }
            None => {
                buffer.index.insert(mutation.key.clone(), buffer.mutations.len());
                buffer.mutations.push(mutation);
            }
        }
    }

    /// Remember a pessimistically locked key
    pub fn record_lock(&mut self, part: TxnPartData, key: Key) {
        if self.primary.is_none() {
            self.primary = Some((part, key.clone()));
        }
        self.locked.entry(part).or_default().insert(key);
    }

    /// Buffered mutation of a key, if any
    pub fn get(&self, key: &[u8]) -> Option<&Mutation> {
        let part = self.key_parts.get(key)?;
        let buffer = self.partitions.get(part)?;
        buffer.index.get(key).map(|&slot| &buffer.mutations[slot])
    }

    pub fn primary(&self) -> Option<(TxnPartData, &[u8])> {
        self.primary.as_ref().map(|(part, key)| (*part, key.as_slice()))
    }

    pub fn has_data_to_commit(&self) -> bool {
        self.partitions.values().any(|b| !b.mutations.is_empty())
    }

    /// Whether some pessimistic lock will not be consumed by the commit
    pub fn has_residual_locks_to_clean(&self) -> bool {
        !self.residual_locks().is_empty()
    }

    /// Locked keys with no buffered mutation, other than the primary
    pub fn residual_locks(&self) -> Vec<(TxnPartData, Vec<Key>)> {
        let primary = self.primary.as_ref().map(|(_, key)| key);
        self.locked
            .iter()
            .filter_map(|(part, keys)| {
                let residual: Vec<Key> = keys
                    .iter()
                    .filter(|key| self.get(key).is_none() && Some(*key) != primary)
                    .cloned()
                    .collect();
                (!residual.is_empty()).then_some((*part, residual))
            })
            .collect()
    }

    /// Every pessimistically locked key
    pub fn locked_keys(&self) -> Vec<(TxnPartData, Vec<Key>)> {
        self.locked
            .iter()
            .map(|(part, keys)| (*part, keys.iter().cloned().collect()))
            .collect()
    }

    pub fn is_locked(&self, key: &[u8]) -> bool {
        self.locked.values().any(|keys| keys.contains(key))
    }

    pub fn forget_residual_locks(&mut self) {
        let primary = self.primary.as_ref().map(|(_, key)| key.clone());
        let buffered: BTreeSet<Key> = self.key_parts.keys().cloned().collect();
        for keys in self.locked.values_mut() {
            keys.retain(|key| buffered.contains(key) || Some(key) == primary.as_ref());
        }
        self.locked.retain(|_, keys| !keys.is_empty());
    }

    /// Whether every buffered partition holds only row data
    pub fn is_scalar_only(&self) -> bool {
        self.partitions.values().all(|b| b.scalar_only)
    }

    /// Buffered mutations of a partition in insertion order
    pub fn mutations(&self, part: TxnPartData) -> &[Mutation] {
        self.partitions
            .get(&part)
            .map(|b| b.mutations.as_slice())
            .unwrap_or_default()
    }

    /// Partitions holding buffered mutations
    pub fn partitions(&self) -> Vec<TxnPartData> {
        self.partitions
            .iter()
            .filter(|(_, b)| !b.mutations.is_empty())
            .map(|(part, _)| *part)
            .collect()
    }

    /// Take everything the commit has to write; buffered data is consumed
    /// once.
    ///
    /// A primary that was only locked is written as a lock record so the
    /// commit has something to anchor on.
    pub fn take_write_set(&mut self) -> WriteSet {
        let lock_only_primary = self
            .primary
            .clone()
            .filter(|(_, key)| self.has_data_to_commit() && self.get(key).is_none());

        let mut set = WriteSet::new();
        for part in self.partitions() {
            set.insert(part, self.take_partition(part));
        }
        if let Some((part, key)) = lock_only_primary {
            set.entry(part).or_default().insert(0, Mutation::lock(key));
        }
        set
    }

    /// Take a partition's mutations, leaving it empty
    pub fn take_partition(&mut self, part: TxnPartData) -> Vec<Mutation> {
        let Some(buffer) = self.partitions.remove(&part) else {
            return Vec::new();
        };
        for mutation in &buffer.mutations {
            self.key_parts.remove(&mutation.key);
        }
        buffer.mutations
    }

    pub fn mutation_count(&self) -> usize {
        self.partitions.values().map(|b| b.mutations.len()).sum()
    }

    /// Drop all buffered data and lock bookkeeping
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Combine a new write with the one already buffered for the same key
fn merge(existing: &Mutation, new: Mutation) -> Mutation {
    match (existing.op, new.op) {
        // Locking a key never downgrades a write to it
        (op, Op::Lock) if op != Op::Lock => existing.clone(),
        // Re-writing an inserted key keeps the existence check
        (Op::CheckNotExists, Op::Put) => Mutation::insert(new.key, new.value),
        _ => new,
    }
}
