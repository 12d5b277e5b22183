//! Multi-version write column of the in-memory store
//!
//! Every committed (or rolled back) transaction leaves one write record per
//! key, indexed by commit timestamp. Rollback records use the start timestamp
//! as their index so a late pre-write of the same transaction can be refused.

use meridian_common::{Key, Timestamp, Value};
use std::collections::{BTreeMap, HashMap};

/// Kind of a write record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteKind {
    Put(Value),
    Delete,
    /// Lock-only mutation committed, value unchanged
    Lock,
    /// Transaction was rolled back on this key
    Rollback,
}

/// A committed write record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub start_ts: Timestamp,
    pub kind: WriteKind,
}

/// Versioned write records for all keys
#[derive(Debug, Default)]
pub struct WriteColumn {
    /// key -> commit_ts -> write
    versions: HashMap<Key, BTreeMap<Timestamp, Write>>,
}

impl WriteColumn {
    pub fn new() -> Self {
        Self {
            versions: HashMap::new(),
        }
    }

    /// Record a write at `commit_ts`
    pub fn put(&mut self, key: Key, commit_ts: Timestamp, write: Write) {
        self.versions.entry(key).or_default().insert(commit_ts, write);
    }

    /// Newest record of a key that is not a rollback, with its commit timestamp
    pub fn latest_data_write(&self, key: &[u8]) -> Option<(Timestamp, &Write)> {
        self.versions.get(key).and_then(|versions| {
            versions
                .iter()
                .rev()
                .find(|(_, w)| w.kind != WriteKind::Rollback)
                .map(|(ts, w)| (*ts, w))
        })
    }

    /// Value visible to a reader at `read_ts`
    pub fn get(&self, key: &[u8], read_ts: Timestamp) -> Option<&Value> {
        let versions = self.versions.get(key)?;
        for (_, write) in versions.range(..=read_ts).rev() {
            match &write.kind {
                WriteKind::Put(value) => return Some(value),
                WriteKind::Delete => return None,
                // Lock and rollback records never change the value
                WriteKind::Lock | WriteKind::Rollback => continue,
            }
        }
        None
    }

    /// Latest visible value regardless of timestamp
    pub fn get_latest(&self, key: &[u8]) -> Option<&Value> {
        self.get(key, Timestamp::from_u64(u64::MAX))
    }

    /// Find the record a transaction left on a key, with its commit timestamp
    pub fn find_by_start_ts(&self, key: &[u8], start_ts: Timestamp) -> Option<(Timestamp, &Write)> {
        self.versions.get(key).and_then(|versions| {
            versions
                .iter()
                .rev()
                .find(|(_, w)| w.start_ts == start_ts)
                .map(|(ts, w)| (*ts, w))
        })
    }
}
