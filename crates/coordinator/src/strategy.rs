//! Locking-discipline specific steps of the commit protocol

use crate::cache::WriteSet;
use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::two_phase::{PessimisticLockCall, TwoPhaseCommitData, TwoPhaseCommitExecutor};
use async_trait::async_trait;
use meridian_common::{Key, Mutation, Timestamp, TransactionKind, TxnPartData};
use tracing::debug;

/// What a strategy may consult while driving its steps
pub(crate) struct StrategyCtx<'a> {
    pub executor: &'a TwoPhaseCommitExecutor,
    pub config: &'a CoordinatorConfig,
    pub start_ts: Timestamp,
    pub for_update_ts: Timestamp,
    /// The primary key already holds this transaction's pessimistic lock
    pub primary_locked: bool,
}

#[async_trait]
pub(crate) trait ProtocolStrategy: Send + Sync {
    /// Synchronously pre-write the primary mutation; returns its minimum
    /// commit timestamp.
    async fn pre_write_primary(
        &self,
        ctx: &StrategyCtx<'_>,
        data: &TwoPhaseCommitData,
        primary: Mutation,
    ) -> Result<Option<Timestamp>>;

    /// Whether the write set may commit in a single round trip
    fn one_pc(&self, config: &CoordinatorConfig, write_set: &WriteSet, has_residual_locks: bool) -> bool;

    /// Release locks taken by statements whose writes never reached the
    /// write set.
    async fn residual_lock_cleanup(
        &self,
        ctx: &StrategyCtx<'_>,
        residual: Vec<(TxnPartData, Vec<Key>)>,
    ) -> Result<()>;
}

pub(crate) fn strategy_for(kind: TransactionKind) -> Box<dyn ProtocolStrategy> {
    match kind {
        TransactionKind::Optimistic => Box::new(Optimistic),
        TransactionKind::Pessimistic => Box::new(Pessimistic),
    }
}

/// One partition within the configured key and byte limits
fn one_pc_eligible(config: &CoordinatorConfig, write_set: &WriteSet) -> bool {
    if !config.enable_one_pc || write_set.len() != 1 {
        return false;
    }
    let mutations = write_set.values().flatten();
    let (count, bytes) = mutations.fold((0, 0), |(count, bytes), m| (count + 1, bytes + m.size()));
    count <= config.one_pc_max_keys && bytes <= config.one_pc_max_bytes
}

pub(crate) struct Optimistic;

#[async_trait]
impl ProtocolStrategy for Optimistic {
    async fn pre_write_primary(
        &self,
        ctx: &StrategyCtx<'_>,
        data: &TwoPhaseCommitData,
        primary: Mutation,
    ) -> Result<Option<Timestamp>> {
        ctx.executor.prewrite(data, data.primary_part, vec![primary]).await
    }

    fn one_pc(&self, config: &CoordinatorConfig, write_set: &WriteSet, _has_residual_locks: bool) -> bool {
        one_pc_eligible(config, write_set)
    }

    async fn residual_lock_cleanup(
        &self,
        _ctx: &StrategyCtx<'_>,
        _residual: Vec<(TxnPartData, Vec<Key>)>,
    ) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct Pessimistic;

#[async_trait]
impl ProtocolStrategy for Pessimistic {
    /// A primary written without `lock_for_update` is locked first, so the
    /// pre-write never races a concurrent pessimistic locker.
    async fn pre_write_primary(
        &self,
        ctx: &StrategyCtx<'_>,
        data: &TwoPhaseCommitData,
        primary: Mutation,
    ) -> Result<Option<Timestamp>> {
        if !ctx.primary_locked && primary.op.is_write() {
            debug!(start_ts = %ctx.start_ts, "locking primary before pre-write");
            let call = PessimisticLockCall {
                start_ts: ctx.start_ts,
                for_update_ts: ctx.for_update_ts,
                primary: data.primary.clone(),
                lock_ttl_ms: ctx.config.lock_ttl_ms,
                wait_timeout: ctx.config.lock_wait_timeout(),
            };
            ctx.executor
                .pessimistic_lock(&call, vec![(data.primary_part, vec![primary.key.clone()])])
                .await?;
        }
        ctx.executor.prewrite(data, data.primary_part, vec![primary]).await
    }

    fn one_pc(&self, config: &CoordinatorConfig, write_set: &WriteSet, has_residual_locks: bool) -> bool {
        !has_residual_locks && one_pc_eligible(config, write_set)
    }

    async fn residual_lock_cleanup(
        &self,
        ctx: &StrategyCtx<'_>,
        residual: Vec<(TxnPartData, Vec<Key>)>,
    ) -> Result<()> {
        if residual.is_empty() {
            return Ok(());
        }
        debug!(partitions = residual.len(), "releasing residual pessimistic locks");
        ctx.executor
            .pessimistic_rollback_partitions(ctx.start_ts, ctx.for_update_ts, residual)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_set(parts: u64, keys_per_part: usize) -> WriteSet {
        (0..parts)
            .map(|p| {
                let mutations = (0..keys_per_part)
                    .map(|k| Mutation::put(format!("k{p}-{k}").into_bytes(), b"v".to_vec()))
                    .collect();
                (TxnPartData::new(1, p), mutations)
            })
            .collect()
    }

    #[test]
    fn test_one_pc_needs_single_partition() {
        let config = CoordinatorConfig::default();
        assert!(Optimistic.one_pc(&config, &write_set(1, 3), false));
        assert!(!Optimistic.one_pc(&config, &write_set(2, 1), false));
        assert!(!Optimistic.one_pc(&config.clone().with_one_pc(false), &write_set(1, 1), false));
    }

    #[test]
    fn test_one_pc_limits() {
        let config = CoordinatorConfig {
            one_pc_max_keys: 4,
            ..Default::default()
        };
        assert!(Optimistic.one_pc(&config, &write_set(1, 4), false));
        assert!(!Optimistic.one_pc(&config, &write_set(1, 5), false));

        let config = CoordinatorConfig {
            one_pc_max_bytes: 10,
            ..Default::default()
        };
        assert!(!Optimistic.one_pc(&config, &write_set(1, 3), false));
    }

    #[test]
    fn test_pessimistic_residual_locks_disable_one_pc() {
        let config = CoordinatorConfig::default();
        assert!(Pessimistic.one_pc(&config, &write_set(1, 1), false));
        assert!(!Pessimistic.one_pc(&config, &write_set(1, 1), true));
    }
}
