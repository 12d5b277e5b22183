//! Protocol phase operators run inside job tasks
//!
//! Each operator receives the rows of the partitions its task serves, issues
//! the phase's storage call per partition through the executor and pushes
//! the number of rows it handled downstream.

use crate::cancel::CancelToken;
use crate::error::CoordinatorError;
use crate::two_phase::{TwoPhaseCommitData, TwoPhaseCommitExecutor};
use async_trait::async_trait;
use meridian_common::{Key, Mutation, Timestamp, TxnPartData};
use meridian_dag::{Batch, Operator, OperatorResult, TaskContext, Tuple};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

fn mutations_by_part(batch: Batch) -> Result<BTreeMap<TxnPartData, Vec<Mutation>>, CoordinatorError> {
    let mut grouped: BTreeMap<TxnPartData, Vec<Mutation>> = BTreeMap::new();
    for tuple in batch {
        match tuple {
            Tuple::Mutation { part, mutation } => grouped.entry(part).or_default().push(mutation),
            other => {
                return Err(CoordinatorError::Internal(format!(
                    "pre-write expects mutation rows, got {other:?}"
                )));
            }
        }
    }
    Ok(grouped)
}

fn keys_by_part(batch: Batch) -> BTreeMap<TxnPartData, Vec<Key>> {
    let mut grouped: BTreeMap<TxnPartData, Vec<Key>> = BTreeMap::new();
    for tuple in batch {
        match tuple {
            Tuple::Key { part, key } => grouped.entry(part).or_default().push(key),
            Tuple::Mutation { part, mutation } => grouped.entry(part).or_default().push(mutation.key),
            Tuple::Count(_) => {}
        }
    }
    grouped
}

/// Largest minimum commit timestamp reported by any pre-write
#[derive(Debug, Default)]
pub(crate) struct MinCommitTs(AtomicU64);

impl MinCommitTs {
    pub fn observe(&self, ts: Timestamp) {
        self.0.fetch_max(ts.as_u64(), Ordering::SeqCst);
    }

    pub fn get(&self) -> Option<Timestamp> {
        let raw = self.0.load(Ordering::SeqCst);
        (raw != 0).then(|| Timestamp::from_u64(raw))
    }
}

/// Pre-writes secondary mutations
pub(crate) struct PrewriteOperator {
    pub executor: Arc<TwoPhaseCommitExecutor>,
    pub data: Arc<TwoPhaseCommitData>,
    pub cancel: CancelToken,
    pub min_commit_ts: Arc<MinCommitTs>,
}

#[async_trait]
impl Operator for PrewriteOperator {
    fn name(&self) -> &'static str {
        "prewrite"
    }

    async fn push(&self, ctx: &TaskContext, batch: Batch) -> OperatorResult<Batch> {
        let mut rows = 0;
        for (part, mutations) in mutations_by_part(batch)? {
            self.cancel.check("partition pre-write")?;
            rows += mutations.len() as u64;
            debug!(task = %ctx.task_id(), part = %part, keys = mutations.len(), "pre-writing");
            if let Some(ts) = self.executor.prewrite(&self.data, part, mutations).await? {
                self.min_commit_ts.observe(ts);
            }
        }
        Ok(vec![Tuple::Count(rows)])
    }
}

/// Rolls back pre-written secondary keys.
///
/// Runs after cancellation too, so it never checks the token.
pub(crate) struct RollbackOperator {
    pub executor: Arc<TwoPhaseCommitExecutor>,
    pub start_ts: Timestamp,
}

#[async_trait]
impl Operator for RollbackOperator {
    fn name(&self) -> &'static str {
        "rollback"
    }

    async fn push(&self, _ctx: &TaskContext, batch: Batch) -> OperatorResult<Batch> {
        let mut rows = 0;
        for (part, keys) in keys_by_part(batch) {
            rows += keys.len() as u64;
            self.executor.rollback(self.start_ts, part, keys).await?;
        }
        Ok(vec![Tuple::Count(rows)])
    }
}

/// Releases pessimistic locks that were never pre-written
pub(crate) struct CleanOperator {
    pub executor: Arc<TwoPhaseCommitExecutor>,
    pub start_ts: Timestamp,
    pub for_update_ts: Timestamp,
}

#[async_trait]
impl Operator for CleanOperator {
    fn name(&self) -> &'static str {
        "clean"
    }

    async fn push(&self, _ctx: &TaskContext, batch: Batch) -> OperatorResult<Batch> {
        let mut rows = 0;
        for (part, keys) in keys_by_part(batch) {
            rows += keys.len() as u64;
            self.executor
                .pessimistic_rollback(self.start_ts, self.for_update_ts, part, keys)
                .await?;
        }
        Ok(vec![Tuple::Count(rows)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_commit_ts_tracks_max() {
        let tracker = MinCommitTs::default();
        assert_eq!(tracker.get(), None);
        tracker.observe(Timestamp::from_u64(7));
        tracker.observe(Timestamp::from_u64(3));
        assert_eq!(tracker.get(), Some(Timestamp::from_u64(7)));
    }

    #[test]
    fn test_rows_grouped_by_partition() {
        let p1 = TxnPartData::new(1, 1);
        let p2 = TxnPartData::new(1, 2);
        let batch = vec![
            Tuple::Key { part: p2, key: b"b".to_vec() },
            Tuple::Key { part: p1, key: b"a".to_vec() },
            Tuple::Key { part: p2, key: b"c".to_vec() },
        ];
        let grouped = keys_by_part(batch);
        assert_eq!(grouped[&p2], vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(grouped.len(), 2);

        let err = mutations_by_part(vec![Tuple::Count(1)]).unwrap_err();
        assert!(matches!(err, CoordinatorError::Internal(_)));
    }
}
