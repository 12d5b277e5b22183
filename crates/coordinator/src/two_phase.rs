//! Two-phase commit executor
//!
//! Every protocol phase is a batch of per-partition storage calls. A call
//! routed with stale metadata fails with a region split; only that call's
//! keys are re-resolved and resubmitted, grouped by their new partitions.
//! Fan-out runs one call per partition concurrently and waits for all of
//! them, so a failing partition never abandons calls already in flight.

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use meridian_common::{IsolationLevel, Key, Mutation, Timestamp, TransactionKind, TxnPartData, Value};
use meridian_store::{
    AsyncCommitParams, BatchRollbackRequest, CommitRequest, HeartBeatRequest, MetaService,
    OnePcOutcome, PartitionDescriptor, PessimisticLockRequest, PessimisticRollbackRequest,
    PrewriteRequest, PrewriteResponse, RegionCtx, StoreError, StoreService, locate,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, info_span, warn};

/// Everything the protocol phases need to know about one commit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoPhaseCommitData {
    pub start_ts: Timestamp,
    pub kind: TransactionKind,
    pub isolation: IsolationLevel,
    pub primary_part: TxnPartData,
    pub primary: Key,
    /// Every other key of the write set, in partition order
    pub secondaries: Vec<Key>,
    pub lock_ttl_ms: u64,
    /// Set for pessimistic transactions
    pub for_update_ts: Option<Timestamp>,
    /// Candidate minimum commit timestamp; present iff async commit is used
    pub min_commit_ts: Option<Timestamp>,
}

impl TwoPhaseCommitData {
    pub fn new(
        start_ts: Timestamp,
        kind: TransactionKind,
        isolation: IsolationLevel,
        primary_part: TxnPartData,
        primary: Key,
        secondaries: Vec<Key>,
    ) -> Self {
        Self {
            start_ts,
            kind,
            isolation,
            primary_part,
            primary,
            secondaries,
            lock_ttl_ms: 0,
            for_update_ts: None,
            min_commit_ts: None,
        }
    }

    pub fn with_lock_ttl(mut self, lock_ttl_ms: u64) -> Self {
        self.lock_ttl_ms = lock_ttl_ms;
        self
    }

    pub fn with_for_update_ts(mut self, for_update_ts: Option<Timestamp>) -> Self {
        self.for_update_ts = for_update_ts;
        self
    }

    pub fn with_async_commit(mut self, min_commit_ts: Timestamp) -> Self {
        self.min_commit_ts = Some(min_commit_ts);
        self
    }

    pub fn is_async_commit(&self) -> bool {
        self.min_commit_ts.is_some()
    }

    /// Bytes of the primary key plus every secondary key
    pub fn key_bytes(&self) -> usize {
        self.primary.len() + self.secondaries.iter().map(Vec::len).sum::<usize>()
    }

    /// Async commit is allowed for at most `async_commit_max_keys` secondary
    /// keys and `async_commit_max_bytes` of key bytes, both inclusive.
    pub fn async_commit_eligible(
        secondary_count: usize,
        key_bytes: usize,
        config: &CoordinatorConfig,
    ) -> bool {
        config.enable_async_commit
            && secondary_count <= config.async_commit_max_keys
            && key_bytes <= config.async_commit_max_bytes
    }

    /// Pre-write parameters; only the primary's request carries the
    /// secondary key list.
    pub(crate) fn prewrite_call(&self, for_primary: bool) -> PrewriteCall {
        let async_commit = self.min_commit_ts.map(|min_commit_ts| AsyncCommitParams {
            min_commit_ts,
            secondaries: if for_primary {
                self.secondaries.clone()
            } else {
                Vec::new()
            },
        });
        PrewriteCall {
            start_ts: self.start_ts,
            primary: self.primary.clone(),
            lock_ttl_ms: self.lock_ttl_ms,
            for_update_ts: self.for_update_ts,
            async_commit,
        }
    }
}

/// One kind of per-partition storage call.
#[async_trait]
pub(crate) trait PartitionCall: Send + Sync {
    type Item: Clone + Send + Sync;
    type Output: Send;

    fn name(&self) -> &'static str;

    fn key_of(item: &Self::Item) -> &[u8];

    async fn call(
        &self,
        store: &dyn StoreService,
        ctx: &RegionCtx,
        items: Vec<Self::Item>,
    ) -> meridian_store::Result<Self::Output>;
}

pub(crate) struct PrewriteCall {
    start_ts: Timestamp,
    primary: Key,
    lock_ttl_ms: u64,
    for_update_ts: Option<Timestamp>,
    async_commit: Option<AsyncCommitParams>,
}

impl PrewriteCall {
    fn request(&self, mutations: Vec<Mutation>) -> PrewriteRequest {
        PrewriteRequest {
            start_ts: self.start_ts,
            primary: self.primary.clone(),
            mutations,
            lock_ttl_ms: self.lock_ttl_ms,
            for_update_ts: self.for_update_ts,
            async_commit: self.async_commit.clone(),
        }
    }
}

#[async_trait]
impl PartitionCall for PrewriteCall {
    type Item = Mutation;
    type Output = PrewriteResponse;

    fn name(&self) -> &'static str {
        "prewrite"
    }

    fn key_of(item: &Mutation) -> &[u8] {
        &item.key
    }

    async fn call(
        &self,
        store: &dyn StoreService,
        ctx: &RegionCtx,
        items: Vec<Mutation>,
    ) -> meridian_store::Result<PrewriteResponse> {
        store.prewrite(ctx, self.request(items)).await
    }
}

pub(crate) struct CommitCall {
    pub start_ts: Timestamp,
    pub commit_ts: Timestamp,
}

#[async_trait]
impl PartitionCall for CommitCall {
    type Item = Key;
    type Output = ();

    fn name(&self) -> &'static str {
        "commit"
    }

    fn key_of(item: &Key) -> &[u8] {
        item
    }

    async fn call(&self, store: &dyn StoreService, ctx: &RegionCtx, keys: Vec<Key>) -> meridian_store::Result<()> {
        let request = CommitRequest {
            start_ts: self.start_ts,
            commit_ts: self.commit_ts,
            keys,
        };
        store.commit(ctx, request).await
    }
}

pub(crate) struct RollbackCall {
    pub start_ts: Timestamp,
}

#[async_trait]
impl PartitionCall for RollbackCall {
    type Item = Key;
    type Output = ();

    fn name(&self) -> &'static str {
        "rollback"
    }

    fn key_of(item: &Key) -> &[u8] {
        item
    }

    async fn call(&self, store: &dyn StoreService, ctx: &RegionCtx, keys: Vec<Key>) -> meridian_store::Result<()> {
        let request = BatchRollbackRequest {
            start_ts: self.start_ts,
            keys,
        };
        store.batch_rollback(ctx, request).await
    }
}

pub(crate) struct PessimisticLockCall {
    pub start_ts: Timestamp,
    pub for_update_ts: Timestamp,
    pub primary: Key,
    pub lock_ttl_ms: u64,
    pub wait_timeout: Duration,
}

#[async_trait]
impl PartitionCall for PessimisticLockCall {
    type Item = Key;
    /// Each key with its latest committed value
    type Output = Vec<(Key, Option<Value>)>;

    fn name(&self) -> &'static str {
        "pessimistic_lock"
    }

    fn key_of(item: &Key) -> &[u8] {
        item
    }

    async fn call(
        &self,
        store: &dyn StoreService,
        ctx: &RegionCtx,
        keys: Vec<Key>,
    ) -> meridian_store::Result<Self::Output> {
        let request = PessimisticLockRequest {
            start_ts: self.start_ts,
            for_update_ts: self.for_update_ts,
            primary: self.primary.clone(),
            keys: keys.clone(),
            lock_ttl_ms: self.lock_ttl_ms,
            wait_timeout: self.wait_timeout,
        };
        let response = store.pessimistic_lock(ctx, request).await?;
        Ok(keys.into_iter().zip(response.prior_values).collect())
    }
}

pub(crate) struct PessimisticRollbackCall {
    pub start_ts: Timestamp,
    pub for_update_ts: Timestamp,
}

#[async_trait]
impl PartitionCall for PessimisticRollbackCall {
    type Item = Key;
    type Output = ();

    fn name(&self) -> &'static str {
        "pessimistic_rollback"
    }

    fn key_of(item: &Key) -> &[u8] {
        item
    }

    async fn call(&self, store: &dyn StoreService, ctx: &RegionCtx, keys: Vec<Key>) -> meridian_store::Result<()> {
        let request = PessimisticRollbackRequest {
            start_ts: self.start_ts,
            for_update_ts: self.for_update_ts,
            keys,
        };
        store.pessimistic_rollback(ctx, request).await
    }
}

pub(crate) struct HeartBeatCall {
    pub start_ts: Timestamp,
    pub advise_ttl_ms: u64,
}

#[async_trait]
impl PartitionCall for HeartBeatCall {
    type Item = Key;
    type Output = u64;

    fn name(&self) -> &'static str {
        "heart_beat"
    }

    fn key_of(item: &Key) -> &[u8] {
        item
    }

    async fn call(&self, store: &dyn StoreService, ctx: &RegionCtx, keys: Vec<Key>) -> meridian_store::Result<u64> {
        let mut ttl = 0;
        for primary in keys {
            let request = HeartBeatRequest {
                primary,
                start_ts: self.start_ts,
                advise_ttl_ms: self.advise_ttl_ms,
            };
            ttl = ttl.max(store.txn_heart_beat(ctx, request).await?);
        }
        Ok(ttl)
    }
}

pub(crate) struct GetCall {
    pub read_ts: Timestamp,
}

#[async_trait]
impl PartitionCall for GetCall {
    type Item = Key;
    type Output = Vec<(Key, Option<Value>)>;

    fn name(&self) -> &'static str {
        "get"
    }

    fn key_of(item: &Key) -> &[u8] {
        item
    }

    async fn call(
        &self,
        store: &dyn StoreService,
        ctx: &RegionCtx,
        keys: Vec<Key>,
    ) -> meridian_store::Result<Self::Output> {
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let value = store.get(ctx, &key, self.read_ts).await?;
            rows.push((key, value));
        }
        Ok(rows)
    }
}

/// Drives protocol phases against the partitions that own the keys.
pub struct TwoPhaseCommitExecutor {
    store: Arc<dyn StoreService>,
    meta: Arc<dyn MetaService>,
    region_retry_limit: usize,
}

impl TwoPhaseCommitExecutor {
    pub fn new(store: Arc<dyn StoreService>, meta: Arc<dyn MetaService>, region_retry_limit: usize) -> Self {
        Self {
            store,
            meta,
            region_retry_limit,
        }
    }

    pub fn meta(&self) -> &Arc<dyn MetaService> {
        &self.meta
    }

    /// Pre-write mutations of one partition; returns the largest minimum
    /// commit timestamp the locks ended up with.
    pub async fn prewrite(
        &self,
        data: &TwoPhaseCommitData,
        part: TxnPartData,
        mutations: Vec<Mutation>,
    ) -> Result<Option<Timestamp>> {
        let for_primary = part == data.primary_part && mutations.iter().any(|m| m.key == data.primary);
        let call = data.prewrite_call(for_primary);
        let responses = self.call_partition(&call, part, mutations).await?;
        Ok(responses.into_iter().filter_map(|r| r.min_commit_ts).max())
    }

    /// Lock and commit a single partition in one round trip.
    ///
    /// A split partition can no longer commit in one call, so a region split
    /// is answered like a refusal.
    pub async fn one_pc(
        &self,
        data: &TwoPhaseCommitData,
        part: TxnPartData,
        mutations: Vec<Mutation>,
    ) -> Result<OnePcOutcome> {
        let desc = self.meta.partition(part)?;
        let request = data.prewrite_call(true).request(mutations);
        match self.store.one_pc(&desc.region_ctx(), request).await {
            Ok(outcome) => Ok(outcome),
            Err(StoreError::RegionSplit { part }) => {
                debug!(part = %part, "region split during one-phase commit");
                Ok(OnePcOutcome::NeedsTwoPc)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn commit(
        &self,
        start_ts: Timestamp,
        commit_ts: Timestamp,
        part: TxnPartData,
        keys: Vec<Key>,
    ) -> Result<()> {
        let call = CommitCall { start_ts, commit_ts };
        self.call_partition(&call, part, keys).await?;
        Ok(())
    }

    /// Commit keys of several partitions in parallel
    pub async fn commit_partitions(
        &self,
        start_ts: Timestamp,
        commit_ts: Timestamp,
        batches: Vec<(TxnPartData, Vec<Key>)>,
    ) -> Result<()> {
        let call = CommitCall { start_ts, commit_ts };
        self.fan_out(&call, batches).await?;
        Ok(())
    }

    pub async fn rollback(&self, start_ts: Timestamp, part: TxnPartData, keys: Vec<Key>) -> Result<()> {
        self.call_partition(&RollbackCall { start_ts }, part, keys).await?;
        Ok(())
    }

    /// Acquire pessimistic locks across partitions; returns every key with
    /// its latest committed value.
    pub(crate) async fn pessimistic_lock(
        &self,
        call: &PessimisticLockCall,
        batches: Vec<(TxnPartData, Vec<Key>)>,
    ) -> Result<Vec<(Key, Option<Value>)>> {
        let rows = self.fan_out(call, batches).await?;
        Ok(rows.into_iter().flatten().collect())
    }

    pub async fn pessimistic_rollback(
        &self,
        start_ts: Timestamp,
        for_update_ts: Timestamp,
        part: TxnPartData,
        keys: Vec<Key>,
    ) -> Result<()> {
        let call = PessimisticRollbackCall {
            start_ts,
            for_update_ts,
        };
        self.call_partition(&call, part, keys).await?;
        Ok(())
    }

    /// Release pessimistic locks across partitions in parallel
    pub async fn pessimistic_rollback_partitions(
        &self,
        start_ts: Timestamp,
        for_update_ts: Timestamp,
        batches: Vec<(TxnPartData, Vec<Key>)>,
    ) -> Result<()> {
        let call = PessimisticRollbackCall {
            start_ts,
            for_update_ts,
        };
        self.fan_out(&call, batches).await?;
        Ok(())
    }

    /// Extend the primary lock's TTL; returns the TTL now in effect.
    pub async fn heart_beat(
        &self,
        part: TxnPartData,
        primary: Key,
        start_ts: Timestamp,
        advise_ttl_ms: u64,
    ) -> Result<u64> {
        let call = HeartBeatCall {
            start_ts,
            advise_ttl_ms,
        };
        let ttls = self.call_partition(&call, part, vec![primary]).await?;
        Ok(ttls.into_iter().max().unwrap_or_default())
    }

    /// Snapshot read of one key at `read_ts`
    pub async fn get(&self, table_id: u64, key: Key, read_ts: Timestamp) -> Result<Option<Value>> {
        let part = self.meta.locate(table_id, &key)?.part;
        let rows = self.call_partition(&GetCall { read_ts }, part, vec![key]).await?;
        Ok(rows.into_iter().flatten().next().and_then(|(_, value)| value))
    }

    /// Run `call` for `items` of one partition, re-resolving and resubmitting
    /// only the failed call's items after a region split.
    pub(crate) async fn call_partition<C: PartitionCall>(
        &self,
        call: &C,
        part: TxnPartData,
        items: Vec<C::Item>,
    ) -> Result<Vec<C::Output>> {
        let mut outputs = Vec::new();
        let mut pending = vec![(self.meta.partition(part)?, items)];
        let mut splits = 0;

        while let Some((desc, items)) = pending.pop() {
            let ctx = desc.region_ctx();
            match call.call(self.store.as_ref(), &ctx, items.clone()).await {
                Ok(output) => outputs.push(output),
                Err(StoreError::RegionSplit { part: stale }) => {
                    splits += 1;
                    if splits > self.region_retry_limit {
                        return Err(CoordinatorError::RegionRetryExhausted {
                            part: stale,
                            attempts: self.region_retry_limit,
                        });
                    }
                    debug!(
                        rpc = call.name(),
                        part = %stale,
                        keys = items.len(),
                        attempt = splits,
                        "region split, re-resolving keys"
                    );
                    pending.extend(self.regroup::<C>(part.table_id, items)?);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(outputs)
    }

    /// Run `call` on every partition concurrently.
    ///
    /// Either every partition succeeds, or the first conflict-class error is
    /// returned once all calls have finished; other failures are logged.
    pub(crate) async fn fan_out<C: PartitionCall>(
        &self,
        call: &C,
        batches: Vec<(TxnPartData, Vec<C::Item>)>,
    ) -> Result<Vec<C::Output>> {
        let span = info_span!("fan_out", rpc = call.name(), partitions = batches.len());
        async move {
            let mut in_flight: FuturesUnordered<_> = batches
                .into_iter()
                .map(|(part, items)| async move { (part, self.call_partition(call, part, items).await) })
                .collect();

            let mut outputs = Vec::new();
            let mut failure: Option<CoordinatorError> = None;
            while let Some((part, result)) = in_flight.next().await {
                match result {
                    Ok(output) => outputs.extend(output),
                    Err(err) => match failure.take() {
                        None => failure = Some(err),
                        Some(first) if !first.is_conflict_class() && err.is_conflict_class() => {
                            warn!(error = %first, "partition call failed");
                            failure = Some(err);
                        }
                        Some(first) => {
                            warn!(part = %part, error = %err, "partition call failed");
                            failure = Some(first);
                        }
                    },
                }
            }

            match failure {
                Some(err) => Err(err),
                None => Ok(outputs),
            }
        }
        .instrument(span)
        .await
    }

    /// Group items by the partition that owns them now
    fn regroup<C: PartitionCall>(
        &self,
        table_id: u64,
        items: Vec<C::Item>,
    ) -> Result<Vec<(PartitionDescriptor, Vec<C::Item>)>> {
        let distribution = self.meta.range_distribution(table_id)?;
        let mut groups: BTreeMap<TxnPartData, (PartitionDescriptor, Vec<C::Item>)> = BTreeMap::new();
        for item in items {
            let key = C::key_of(&item);
            let desc = locate(&distribution, key).ok_or_else(|| {
                CoordinatorError::Internal(format!(
                    "no partition of table {table_id} owns key {}",
                    String::from_utf8_lossy(key)
                ))
            })?;
            groups
                .entry(desc.part)
                .or_insert_with(|| (desc.clone(), Vec::new()))
                .1
                .push(item);
        }
        Ok(groups.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::NodeId;
    use meridian_store::{MemoryMeta, MemoryStore, RpcKind};

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::default()
    }

    #[test]
    fn test_async_commit_key_count_boundary() {
        let config = config();
        assert!(TwoPhaseCommitData::async_commit_eligible(256, 100, &config));
        assert!(!TwoPhaseCommitData::async_commit_eligible(257, 100, &config));
    }

    #[test]
    fn test_async_commit_key_bytes_boundary() {
        let config = config();
        assert!(TwoPhaseCommitData::async_commit_eligible(10, 5120, &config));
        assert!(!TwoPhaseCommitData::async_commit_eligible(10, 5121, &config));
        assert!(!TwoPhaseCommitData::async_commit_eligible(
            1,
            1,
            &config.with_async_commit(false)
        ));
    }

    #[test]
    fn test_key_bytes_counts_primary_and_secondaries() {
        let data = TwoPhaseCommitData::new(
            Timestamp::from_u64(1),
            TransactionKind::Optimistic,
            IsolationLevel::SnapshotIsolation,
            TxnPartData::new(1, 1),
            vec![0; 120],
            vec![vec![0; 5000]],
        );
        assert_eq!(data.key_bytes(), 5120);

        let primary = data.prewrite_call(true);
        assert!(primary.async_commit.is_none());
        let data = data.with_async_commit(Timestamp::from_u64(2));
        assert_eq!(data.prewrite_call(true).async_commit.unwrap().secondaries.len(), 1);
        assert!(data.prewrite_call(false).async_commit.unwrap().secondaries.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_reports_conflict_after_all_partitions_finish() {
        let meta = Arc::new(MemoryMeta::new());
        let parts = meta.create_table(1, &[b"m".as_slice()], &[NodeId::new(1)]);
        let store = Arc::new(MemoryStore::new(meta.clone()));
        let executor = TwoPhaseCommitExecutor::new(store.clone(), meta, 8);

        // Another transaction holds "a"
        let other = TwoPhaseCommitData::new(
            Timestamp::from_u64(5),
            TransactionKind::Optimistic,
            IsolationLevel::SnapshotIsolation,
            parts[0].part,
            b"a".to_vec(),
            Vec::new(),
        );
        executor
            .prewrite(&other, parts[0].part, vec![Mutation::put(b"a".to_vec(), b"x".to_vec())])
            .await
            .unwrap();

        let data = TwoPhaseCommitData::new(
            Timestamp::from_u64(10),
            TransactionKind::Optimistic,
            IsolationLevel::SnapshotIsolation,
            parts[1].part,
            b"z".to_vec(),
            vec![b"a".to_vec()],
        );
        let call = data.prewrite_call(false);
        let batches = vec![
            (parts[0].part, vec![Mutation::put(b"a".to_vec(), b"1".to_vec())]),
            (parts[1].part, vec![Mutation::put(b"z".to_vec(), b"1".to_vec())]),
        ];
        let err = executor.fan_out(&call, batches).await.unwrap_err();
        assert!(err.is_write_conflict());

        // The healthy partition's call still ran to completion
        assert_eq!(store.lock_of(b"z").unwrap().start_ts, Timestamp::from_u64(10));
        assert_eq!(store.journal_of(RpcKind::Prewrite).len(), 3);
    }

    #[tokio::test]
    async fn test_region_retry_limit() {
        let meta = Arc::new(MemoryMeta::new());
        let parts = meta.create_table(1, &[], &[NodeId::new(1)]);
        let store = Arc::new(MemoryStore::new(meta.clone()));
        for _ in 0..3 {
            store.fail_once(
                RpcKind::Commit,
                None,
                StoreError::RegionSplit { part: parts[0].part },
            );
        }
        let executor = TwoPhaseCommitExecutor::new(store.clone(), meta, 2);
        let err = executor
            .commit(Timestamp::from_u64(1), Timestamp::from_u64(2), parts[0].part, vec![b"k".to_vec()])
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::RegionRetryExhausted { attempts: 2, .. }));
    }
}
