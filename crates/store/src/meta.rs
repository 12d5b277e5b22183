//! Range-partition metadata used to route keys to partitions.
//!
//! Every table is split into contiguous key ranges. Each range is one
//! partition, served by one storage region whose leader lives on a node. A
//! split shrinks the left range, bumps its epoch and creates a brand new
//! partition for the right half; requests routed with the old epoch are
//! rejected with a region-split error and must be re-resolved.

use crate::error::{Result, StoreError};
use meridian_common::{Key, NodeId, TxnPartData};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

/// Descriptor of one partition at routing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub part: TxnPartData,
    /// Inclusive start key (empty means unbounded)
    pub start_key: Key,
    /// Exclusive end key (empty means unbounded)
    pub end_key: Key,
    /// Bumped every time the range changes
    pub epoch: u64,
    /// Node hosting the region leader
    pub leader: NodeId,
}

impl PartitionDescriptor {
    pub fn contains(&self, key: &[u8]) -> bool {
        key_in_range(key, &self.start_key, &self.end_key)
    }

    /// Routing context to attach to storage requests.
    pub fn region_ctx(&self) -> RegionCtx {
        RegionCtx {
            part: self.part,
            epoch: self.epoch,
        }
    }
}

/// Routing context carried by every storage request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionCtx {
    pub part: TxnPartData,
    pub epoch: u64,
}

/// Ordered mapping from range start key to partition descriptor.
pub type RangeDistribution = BTreeMap<Key, PartitionDescriptor>;

/// Metadata lookups consumed by the coordinator.
pub trait MetaService: Send + Sync {
    /// Fresh range distribution of a table.
    fn range_distribution(&self, table_id: u64) -> Result<RangeDistribution>;

    /// Fresh descriptor of one partition.
    fn partition(&self, part: TxnPartData) -> Result<PartitionDescriptor>;

    /// Resolve the partition currently owning `key`.
    fn locate(&self, table_id: u64, key: &[u8]) -> Result<PartitionDescriptor> {
        let distribution = self.range_distribution(table_id)?;
        locate(&distribution, key)
            .cloned()
            .ok_or(StoreError::TableNotFound(table_id))
    }
}

/// Find the partition whose range contains `key`.
pub fn locate<'a>(distribution: &'a RangeDistribution, key: &[u8]) -> Option<&'a PartitionDescriptor> {
    distribution
        .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
        .next_back()
        .map(|(_, desc)| desc)
        .filter(|desc| desc.contains(key))
}

/// Checks whether `key` is within `[start, end)` where empty bounds are open.
pub fn key_in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    let in_start = start.is_empty() || key >= start;
    let in_end = end.is_empty() || key < end;
    in_start && in_end
}

/// In-memory metadata service with split support.
pub struct MemoryMeta {
    tables: RwLock<HashMap<u64, RangeDistribution>>,
    partitions: RwLock<HashMap<TxnPartData, PartitionDescriptor>>,
    next_partition_id: AtomicU64,
}

impl MemoryMeta {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            partitions: RwLock::new(HashMap::new()),
            next_partition_id: AtomicU64::new(1),
        }
    }

    /// Create a table split at `split_keys`, assigning leaders round-robin.
    pub fn create_table(
        &self,
        table_id: u64,
        split_keys: &[&[u8]],
        leaders: &[NodeId],
    ) -> Vec<PartitionDescriptor> {
        let mut bounds: Vec<Key> = split_keys.iter().map(|k| k.to_vec()).collect();
        bounds.sort();
        bounds.dedup();

        let mut starts = vec![Vec::new()];
        starts.extend(bounds.iter().cloned());

        let mut descriptors = Vec::with_capacity(starts.len());
        for (i, start_key) in starts.into_iter().enumerate() {
            let end_key = bounds.get(i).cloned().unwrap_or_default();
            let leader = if leaders.is_empty() {
                NodeId::new(0)
            } else {
                leaders[i % leaders.len()]
            };
            descriptors.push(PartitionDescriptor {
                part: TxnPartData::new(table_id, self.allocate_partition_id()),
                start_key,
                end_key,
                epoch: 1,
                leader,
            });
        }

        let distribution: RangeDistribution = descriptors
            .iter()
            .map(|desc| (desc.start_key.clone(), desc.clone()))
            .collect();

        {
            let mut partitions = self.partitions.write();
            for desc in &descriptors {
                partitions.insert(desc.part, desc.clone());
            }
        }
        self.tables.write().insert(table_id, distribution);

        descriptors
    }

    /// Split the partition containing `at` so that `at` starts a new partition.
    ///
    /// Returns the descriptor of the new right-hand partition.
    pub fn split(&self, table_id: u64, at: &[u8]) -> Result<PartitionDescriptor> {
        let mut tables = self.tables.write();
        let distribution = tables
            .get_mut(&table_id)
            .ok_or(StoreError::TableNotFound(table_id))?;

        let mut left = locate(distribution, at)
            .cloned()
            .ok_or(StoreError::TableNotFound(table_id))?;
        if left.start_key.as_slice() == at {
            return Err(StoreError::Internal(format!(
                "partition {} already starts at split key",
                left.part
            )));
        }

        let right = PartitionDescriptor {
            part: TxnPartData::new(table_id, self.allocate_partition_id()),
            start_key: at.to_vec(),
            end_key: left.end_key.clone(),
            epoch: 1,
            leader: left.leader,
        };
        left.end_key = at.to_vec();
        left.epoch += 1;

        distribution.insert(left.start_key.clone(), left.clone());
        distribution.insert(right.start_key.clone(), right.clone());

        let mut partitions = self.partitions.write();
        partitions.insert(left.part, left.clone());
        partitions.insert(right.part, right.clone());

        tracing::debug!(
            table_id,
            left = %left.part,
            right = %right.part,
            left_epoch = left.epoch,
            "partition split"
        );

        Ok(right)
    }

    /// Validate that a request routed with `ctx` may touch `keys`.
    pub fn check_region<'a>(
        &self,
        ctx: &RegionCtx,
        keys: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<()> {
        let partitions = self.partitions.read();
        let desc = partitions
            .get(&ctx.part)
            .ok_or(StoreError::RegionSplit { part: ctx.part })?;
        if desc.epoch != ctx.epoch {
            return Err(StoreError::RegionSplit { part: ctx.part });
        }
        for key in keys {
            if !desc.contains(key) {
                return Err(StoreError::RegionSplit { part: ctx.part });
            }
        }
        Ok(())
    }

    fn allocate_partition_id(&self) -> u64 {
        self.next_partition_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for MemoryMeta {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaService for MemoryMeta {
    fn range_distribution(&self, table_id: u64) -> Result<RangeDistribution> {
        self.tables
            .read()
            .get(&table_id)
            .cloned()
            .ok_or(StoreError::TableNotFound(table_id))
    }

    fn partition(&self, part: TxnPartData) -> Result<PartitionDescriptor> {
        self.partitions
            .read()
            .get(&part)
            .cloned()
            .ok_or(StoreError::PartitionNotFound(part))
    }
}
