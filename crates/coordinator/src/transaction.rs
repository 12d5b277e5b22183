//! Transaction state machine
//!
//! A transaction buffers writes locally and commits them with the
//! percolator protocol:
//!
//! - the primary mutation is pre-written alone, then every secondary
//!   mutation through a pre-write job spanning the partitions' leader nodes;
//! - the primary commit is the linearization point, after which secondaries
//!   commit synchronously or, under async commit, in the background;
//! - a single small partition may instead commit in one phase.
//!
//! Every failure after the primary pre-write rolls back what was written,
//! primary first, before the error reaches the caller.

use crate::cache::{TxnCache, WriteSet};
use crate::cancel::CancelToken;
use crate::config::ConflictPolicy;
use crate::coordinator::Shared;
use crate::error::{CoordinatorError, Result};
use crate::heartbeat::{Heartbeat, HeartbeatTarget};
use crate::operators::{CleanOperator, MinCommitTs, PrewriteOperator, RollbackOperator};
use crate::render::RenderContext;
use crate::strategy::{ProtocolStrategy, StrategyCtx, strategy_for};
use crate::two_phase::{PessimisticLockCall, TwoPhaseCommitData};
use meridian_common::{
    IsolationLevel, JobId, Key, Mutation, Op, Timestamp, TransactionKind, TxnId, TxnPartData, Value,
};
use meridian_dag::{IteratorParams, Job, Operator, Tuple};
use meridian_store::OnePcOutcome;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

/// Lifecycle of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Accepting reads and writes
    Start,
    OnePcStart,
    PreWriteStart,
    PreWritePrimaryKey,
    PreWrite,
    PreWriteFail,
    CommitPrimaryKey,
    Commit,
    CommitFail,
    Rollback,
    RollbackFail,
    Cancel,
    Close,
}

impl TransactionStatus {
    /// A commit is running; no other operation is accepted
    pub fn is_committing(&self) -> bool {
        matches!(
            self,
            TransactionStatus::OnePcStart
                | TransactionStatus::PreWriteStart
                | TransactionStatus::PreWritePrimaryKey
                | TransactionStatus::PreWrite
                | TransactionStatus::CommitPrimaryKey
        )
    }
}

struct TxnState {
    status: TransactionStatus,
    start_ts: Timestamp,
    /// Largest timestamp pessimistic locks were taken at
    for_update_ts: Timestamp,
    commit_ts: Option<Timestamp>,
    attempt: Option<Attempt>,
}

/// Latest commit attempt; what a rollback has to undo
#[derive(Clone)]
struct Attempt {
    data: Arc<TwoPhaseCommitData>,
    write_set: Arc<WriteSet>,
}

/// Rows of every key in `write_set` except `skip`
fn rows_except(
    write_set: &WriteSet,
    skip: &[u8],
    to_row: impl Fn(TxnPartData, &Mutation) -> Tuple,
) -> BTreeMap<TxnPartData, Vec<Tuple>> {
    write_set
        .iter()
        .filter_map(|(part, mutations)| {
            let rows: Vec<Tuple> = mutations
                .iter()
                .filter(|m| m.key.as_slice() != skip)
                .map(|m| to_row(*part, m))
                .collect();
            (!rows.is_empty()).then_some((*part, rows))
        })
        .collect()
}

pub struct Transaction {
    id: TxnId,
    kind: TransactionKind,
    isolation: IsolationLevel,
    shared: Arc<Shared>,
    strategy: Box<dyn ProtocolStrategy>,
    state: Mutex<TxnState>,
    cache: Mutex<TxnCache>,
    cancel: CancelToken,
    /// Job currently running on behalf of the commit
    current_job: Mutex<Option<JobId>>,
    heartbeat: Mutex<Option<Heartbeat>>,
    background: Mutex<Option<JoinHandle<()>>>,
    /// Failure of the secondary commit, which runs after the primary committed
    background_error: Arc<Mutex<Option<CoordinatorError>>>,
    /// Held for the whole of a commit; close waits on it
    committing: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    next_job_seq: AtomicU64,
}

impl Transaction {
    pub(crate) fn new(
        id: TxnId,
        kind: TransactionKind,
        isolation: IsolationLevel,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            kind,
            isolation,
            shared,
            strategy: strategy_for(kind),
            state: Mutex::new(TxnState {
                status: TransactionStatus::Start,
                start_ts: id.start_ts,
                for_update_ts: id.start_ts,
                commit_ts: None,
                attempt: None,
            }),
            cache: Mutex::new(TxnCache::new()),
            cancel: CancelToken::new(),
            current_job: Mutex::new(None),
            heartbeat: Mutex::new(None),
            background: Mutex::new(None),
            background_error: Arc::new(Mutex::new(None)),
            committing: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            next_job_seq: AtomicU64::new(0),
        }
    }

    /// Identifier assigned at begin; its embedded start timestamp is the
    /// first attempt's, see [`Transaction::start_ts`] for the current one.
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    /// Current start timestamp; a conflict retry replaces it
    pub fn start_ts(&self) -> Timestamp {
        self.state.lock().start_ts
    }

    pub fn commit_ts(&self) -> Option<Timestamp> {
        self.state.lock().commit_ts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn put(&self, table_id: u64, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.buffer(table_id, Mutation::put(key, value), true)
    }

    /// Write a row that must not exist yet
    pub fn insert(&self, table_id: u64, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.buffer(table_id, Mutation::insert(key, value), true)
    }

    pub fn delete(&self, table_id: u64, key: impl Into<Key>) -> Result<()> {
        self.buffer(table_id, Mutation::delete(key), true)
    }

    /// Write vector or document index data; partitions holding it commit
    /// without async commit.
    pub fn put_non_scalar(&self, table_id: u64, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.buffer(table_id, Mutation::put(key, value), false)
    }

    fn buffer(&self, table_id: u64, mutation: Mutation, scalar: bool) -> Result<()> {
        self.ensure_active("write")?;
        let part = self.shared.meta.locate(table_id, &mutation.key)?.part;
        let mut cache = self.cache.lock();
        if scalar {
            cache.put(part, mutation);
        } else {
            cache.put_non_scalar(part, mutation);
        }
        Ok(())
    }

    /// Read a key: buffered writes first, then the store at the start
    /// timestamp (snapshot isolation) or a fresh one (read committed).
    pub async fn get(&self, table_id: u64, key: &[u8]) -> Result<Option<Value>> {
        self.ensure_active("read")?;
        let buffered = self.cache.lock().get(key).cloned();
        if let Some(mutation) = buffered {
            match mutation.op {
                Op::Put | Op::CheckNotExists => return Ok(Some(mutation.value)),
                Op::Delete => return Ok(None),
                Op::Lock => {}
            }
        }

        let read_ts = match self.isolation {
            IsolationLevel::SnapshotIsolation => self.start_ts(),
            IsolationLevel::ReadCommitted => self.shared.tso.now(),
        };
        self.shared.executor.get(table_id, key.to_vec(), read_ts).await
    }

    /// Lock keys for a later write and return their latest committed values.
    ///
    /// Pessimistic transactions lock in storage right away, waiting up to
    /// the configured timeout on conflicting locks. Optimistic transactions
    /// buffer lock records that their pre-write takes.
    pub async fn lock_for_update(&self, table_id: u64, keys: &[Key]) -> Result<Vec<Option<Value>>> {
        self.ensure_active("lock")?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut grouped: BTreeMap<TxnPartData, Vec<Key>> = BTreeMap::new();
        let mut key_parts: HashMap<Key, TxnPartData> = HashMap::new();
        for key in keys {
            let part = self.shared.meta.locate(table_id, key)?.part;
            grouped.entry(part).or_default().push(key.clone());
            key_parts.insert(key.clone(), part);
        }

        if self.kind == TransactionKind::Optimistic {
            for key in keys {
                self.cache.lock().put(key_parts[key], Mutation::lock(key.clone()));
            }
            let mut values = Vec::with_capacity(keys.len());
            for key in keys {
                values.push(self.get(table_id, key).await?);
            }
            return Ok(values);
        }

        self.cancel.check("pessimistic lock")?;
        let config = &self.shared.config;
        let start_ts = self.start_ts();
        let for_update_ts = self.shared.tso.now();
        let (primary, fresh) = {
            let cache = self.cache.lock();
            let primary = cache
                .primary()
                .map(|(_, key)| key.to_vec())
                .unwrap_or_else(|| keys[0].clone());
            let fresh: Vec<(TxnPartData, Vec<Key>)> = grouped
                .iter()
                .map(|(part, keys)| {
                    let unlocked: Vec<Key> = keys.iter().filter(|k| !cache.is_locked(k)).cloned().collect();
                    (*part, unlocked)
                })
                .filter(|(_, keys): &(TxnPartData, Vec<Key>)| !keys.is_empty())
                .collect();
            (primary, fresh)
        };

        let call = PessimisticLockCall {
            start_ts,
            for_update_ts,
            primary,
            lock_ttl_ms: config.lock_ttl_ms,
            wait_timeout: config.lock_wait_timeout(),
        };
        let batches = grouped.into_iter().collect();
        let rows = match self.shared.executor.pessimistic_lock(&call, batches).await {
            Ok(rows) => rows,
            Err(err) => {
                // Keys this statement did lock must not outlive it
                if !fresh.is_empty()
                    && let Err(cleanup) = self
                        .shared
                        .executor
                        .pessimistic_rollback_partitions(start_ts, for_update_ts, fresh)
                        .await
                {
                    warn!(txn_id = %self.id, error = %cleanup, "failed to release statement locks");
                }
                return Err(err);
            }
        };

        {
            let mut cache = self.cache.lock();
            for key in keys {
                cache.record_lock(key_parts[key], key.clone());
            }
        }
        {
            let mut state = self.state.lock();
            state.for_update_ts = state.for_update_ts.max(for_update_ts);
        }
        debug!(txn_id = %self.id, keys = keys.len(), for_update_ts = %for_update_ts, "keys locked");

        let values: HashMap<Key, Option<Value>> = rows.into_iter().collect();
        Ok(keys
            .iter()
            .map(|key| values.get(key).cloned().flatten())
            .collect())
    }

    /// Commit the buffered writes.
    ///
    /// A transaction without writes commits as a no-op. Write conflicts are
    /// retried with a fresh start timestamp when the conflict policy allows.
    pub async fn commit(&self) -> Result<()> {
        let _running = self.committing.lock().await;
        self.ensure_active("commit")?;
        let span = info_span!("commit", txn_id = %self.id, kind = ?self.kind);
        self.commit_inner().instrument(span).await
    }

    async fn commit_inner(&self) -> Result<()> {
        if let Err(err) = self.cancel.check("commit") {
            self.set_status(TransactionStatus::Cancel);
            return Err(err);
        }

        let residual = self.cache.lock().residual_locks();
        let has_residual = !residual.is_empty();
        if has_residual {
            let ctx = self.strategy_ctx(false);
            if let Err(err) = self.strategy.residual_lock_cleanup(&ctx, residual).await {
                warn!(error = %err, "failed to release residual pessimistic locks");
            }
            self.cache.lock().forget_residual_locks();
        }

        let (write_set, scalar_only) = {
            let mut cache = self.cache.lock();
            let scalar_only = cache.is_scalar_only();
            (cache.take_write_set(), scalar_only)
        };
        if write_set.is_empty() {
            debug!("nothing to commit");
            self.set_status(TransactionStatus::Commit);
            return Ok(());
        }
        let write_set = Arc::new(write_set);

        let max_retries = match self.shared.config.conflict_policy {
            ConflictPolicy::Abort => 0,
            ConflictPolicy::Retry { max_attempts } => max_attempts,
        };
        let mut retries = 0;
        loop {
            match self.commit_attempt(&write_set, scalar_only, has_residual).await {
                Err(err)
                    if err.is_write_conflict()
                        && self.kind == TransactionKind::Optimistic
                        && retries < max_retries
                        && !self.cancel.is_cancelled() =>
                {
                    retries += 1;
                    let start_ts = self.shared.tso.now();
                    warn!(
                        error = %err,
                        retry = retries,
                        txn_id = %self.id,
                        start_ts = %start_ts,
                        "write conflict, retrying with a fresh start timestamp"
                    );
                    let mut state = self.state.lock();
                    state.start_ts = start_ts;
                    state.for_update_ts = start_ts;
                    state.status = TransactionStatus::Start;
                }
                outcome => return outcome,
            }
        }
    }

    async fn commit_attempt(
        &self,
        write_set: &Arc<WriteSet>,
        scalar_only: bool,
        has_residual: bool,
    ) -> Result<()> {
        let config = &self.shared.config;
        let (start_ts, for_update_ts) = {
            let state = self.state.lock();
            (state.start_ts, state.for_update_ts)
        };
        let (primary_part, primary) = self
            .cache
            .lock()
            .primary()
            .map(|(part, key)| (part, key.to_vec()))
            .ok_or_else(|| CoordinatorError::Internal("write set without a primary key".to_string()))?;
        let secondaries = write_set
            .values()
            .flatten()
            .filter(|m| m.key != primary)
            .map(|m| m.key.clone())
            .collect();
        let mut data = TwoPhaseCommitData::new(
            start_ts,
            self.kind,
            self.isolation,
            primary_part,
            primary,
            secondaries,
        )
        .with_lock_ttl(config.lock_ttl_ms)
        .with_for_update_ts((self.kind == TransactionKind::Pessimistic).then_some(for_update_ts));

        if self.strategy.one_pc(config, write_set, has_residual)
            && let Some((part, mutations)) = write_set.iter().next()
        {
            self.set_status(TransactionStatus::OnePcStart);
            let one_pc = Arc::new(data.clone());
            self.record_attempt(&one_pc, write_set);
            match self.shared.executor.one_pc(&one_pc, *part, mutations.clone()).await {
                Ok(OnePcOutcome::Committed { commit_ts }) => {
                    self.finish_commit(commit_ts);
                    info!(commit_ts = %commit_ts, "committed in one phase");
                    return Ok(());
                }
                Ok(OnePcOutcome::NeedsTwoPc) => {
                    debug!("one-phase commit declined, falling back to two phases");
                }
                Err(err) => {
                    return Err(self
                        .abort(&one_pc, write_set, err, TransactionStatus::PreWriteFail)
                        .await);
                }
            }
        }

        self.set_status(TransactionStatus::PreWriteStart);
        if scalar_only
            && TwoPhaseCommitData::async_commit_eligible(data.secondaries.len(), data.key_bytes(), config)
        {
            // Candidate minimum taken before any secondary is pre-written
            data = data.with_async_commit(self.shared.tso.now());
        }
        let data = Arc::new(data);
        self.record_attempt(&data, write_set);

        let max_min_commit_ts = match self.prewrite(&data, write_set).await {
            Ok(ts) => ts,
            Err(err) => {
                return Err(self
                    .abort(&data, write_set, err, TransactionStatus::PreWriteFail)
                    .await);
            }
        };
        if let Err(err) = self.cancel.check("primary commit") {
            return Err(self
                .abort(&data, write_set, err, TransactionStatus::PreWriteFail)
                .await);
        }

        self.set_status(TransactionStatus::CommitPrimaryKey);
        let commit_ts = match self.commit_primary(&data, max_min_commit_ts).await {
            Ok(ts) => ts,
            Err(err) => {
                return Err(self
                    .abort(&data, write_set, err, TransactionStatus::CommitFail)
                    .await);
            }
        };
        self.finish_commit(commit_ts);
        info!(commit_ts = %commit_ts, async_commit = data.is_async_commit(), "primary committed");

        self.commit_secondaries(&data, write_set, commit_ts).await;
        Ok(())
    }

    /// Pre-write the primary, then every secondary through a job. Returns
    /// the largest minimum commit timestamp any lock reported.
    async fn prewrite(&self, data: &Arc<TwoPhaseCommitData>, write_set: &WriteSet) -> Result<Option<Timestamp>> {
        self.set_status(TransactionStatus::PreWritePrimaryKey);
        self.cancel.check("primary pre-write")?;
        let primary = write_set
            .get(&data.primary_part)
            .and_then(|mutations| mutations.iter().find(|m| m.key == data.primary))
            .cloned()
            .ok_or_else(|| CoordinatorError::Internal("primary key missing from write set".to_string()))?;
        let primary_locked = self.cache.lock().is_locked(&data.primary);
        let ctx = self.strategy_ctx(primary_locked);
        let primary_min = self.strategy.pre_write_primary(&ctx, data, primary).await?;
        self.start_heartbeat(data);

        self.set_status(TransactionStatus::PreWrite);
        self.cancel.check("secondary pre-write")?;
        let rows = rows_except(write_set, &data.primary, |part, m| Tuple::Mutation {
            part,
            mutation: m.clone(),
        });
        if rows.is_empty() {
            return Ok(primary_min);
        }

        let tracker = Arc::new(MinCommitTs::default());
        let job = self.render(rows, true, || PrewriteOperator {
            executor: self.shared.executor.clone(),
            data: data.clone(),
            cancel: self.cancel.clone(),
            min_commit_ts: tracker.clone(),
        })?;
        let written = self.run_with_root(job).await?;
        debug!(keys = written, "secondaries pre-written");
        Ok(primary_min.max(tracker.get()))
    }

    /// Commit the primary key, refreshing the commit timestamp when a reader
    /// pushed the lock's minimum past it.
    async fn commit_primary(
        &self,
        data: &TwoPhaseCommitData,
        max_min_commit_ts: Option<Timestamp>,
    ) -> Result<Timestamp> {
        let tso = &self.shared.tso;
        let mut commit_ts = match max_min_commit_ts {
            Some(min) if data.is_async_commit() => tso.next_after(min),
            _ => tso.now(),
        };

        let limit = self.shared.config.commit_ts_retry_limit;
        let mut refreshes = 0;
        loop {
            let result = self
                .shared
                .executor
                .commit(data.start_ts, commit_ts, data.primary_part, vec![data.primary.clone()])
                .await;
            match result {
                Ok(()) => return Ok(commit_ts),
                Err(CoordinatorError::CommitTsExpired { min_commit_ts, .. }) if refreshes < limit => {
                    refreshes += 1;
                    let refreshed = tso.next_after(min_commit_ts);
                    info!(
                        expired = %commit_ts,
                        min_commit_ts = %min_commit_ts,
                        refreshed = %refreshed,
                        "commit timestamp expired, retrying primary commit"
                    );
                    commit_ts = refreshed;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn commit_secondaries(&self, data: &TwoPhaseCommitData, write_set: &WriteSet, commit_ts: Timestamp) {
        let batches: Vec<(TxnPartData, Vec<Key>)> = write_set
            .iter()
            .map(|(part, mutations)| {
                let keys = mutations
                    .iter()
                    .filter(|m| m.key != data.primary)
                    .map(|m| m.key.clone())
                    .collect();
                (*part, keys)
            })
            .filter(|(_, keys): &(TxnPartData, Vec<Key>)| !keys.is_empty())
            .collect();
        if batches.is_empty() {
            return;
        }

        let executor = self.shared.executor.clone();
        let errors = self.background_error.clone();
        let start_ts = data.start_ts;
        let commit = async move {
            if let Err(err) = executor.commit_partitions(start_ts, commit_ts, batches).await {
                // The primary is committed; leftover locks resolve through it
                warn!(error = %err, "secondary commit failed");
                *errors.lock() = Some(err);
            }
        };

        if data.is_async_commit() {
            let span = info_span!("async_commit", txn_id = %self.id);
            *self.background.lock() = Some(tokio::spawn(commit.instrument(span)));
        } else {
            commit.await;
        }
    }

    /// Mark the attempt failed and roll back what it wrote. Returns the error
    /// to surface, a cancellation when the transaction was cancelled.
    async fn abort(
        &self,
        data: &TwoPhaseCommitData,
        write_set: &WriteSet,
        err: CoordinatorError,
        failed: TransactionStatus,
    ) -> CoordinatorError {
        self.set_status(failed);
        self.stop_heartbeat();
        let cancelled = err.is_cancelled() || self.cancel.is_cancelled();
        warn!(error = %err, status = ?failed, "commit failed, rolling back");

        let rolled_back = self.rollback_written(data, write_set).await;
        if let Err(rollback_err) = &rolled_back {
            warn!(error = %rollback_err, "rollback failed");
        }
        let status = if cancelled {
            TransactionStatus::Cancel
        } else if rolled_back.is_ok() {
            TransactionStatus::Rollback
        } else {
            TransactionStatus::RollbackFail
        };
        self.set_status(status);

        if cancelled && !err.is_cancelled() {
            return CoordinatorError::Cancelled(format!("transaction {} cancelled during commit", self.id));
        }
        err
    }

    /// Roll back the primary, then every secondary through a job
    async fn rollback_written(&self, data: &TwoPhaseCommitData, write_set: &WriteSet) -> Result<()> {
        let executor = &self.shared.executor;
        executor
            .rollback(data.start_ts, data.primary_part, vec![data.primary.clone()])
            .await?;

        let rows = rows_except(write_set, &data.primary, |part, m| Tuple::Key {
            part,
            key: m.key.clone(),
        });
        if !rows.is_empty() {
            let start_ts = data.start_ts;
            let job = self.render(rows, false, || RollbackOperator {
                executor: executor.clone(),
                start_ts,
            })?;
            self.run_to_completion(job).await?;
        }
        info!(txn_id = %self.id, start_ts = %data.start_ts, "rolled back");
        Ok(())
    }

    /// Release every pessimistic lock still recorded
    async fn release_pessimistic_locks(&self) -> Result<()> {
        let locked = self.cache.lock().locked_keys();
        if locked.is_empty() {
            return Ok(());
        }
        let (start_ts, for_update_ts) = {
            let state = self.state.lock();
            (state.start_ts, state.for_update_ts)
        };
        let rows = locked
            .into_iter()
            .map(|(part, keys)| {
                let rows = keys.into_iter().map(|key| Tuple::Key { part, key }).collect();
                (part, rows)
            })
            .collect();
        let executor = &self.shared.executor;
        let job = self.render(rows, false, || CleanOperator {
            executor: executor.clone(),
            start_ts,
            for_update_ts,
        })?;
        self.run_to_completion(job).await
    }

    /// Roll back whatever the last commit attempt wrote and release held
    /// locks. Rolling back twice is the same as rolling back once.
    pub async fn rollback(&self) -> Result<()> {
        let (status, attempt) = {
            let state = self.state.lock();
            (state.status, state.attempt.clone())
        };
        if status == TransactionStatus::Commit
            || status == TransactionStatus::Close
            || status.is_committing()
        {
            return Err(CoordinatorError::InvalidState(format!(
                "cannot roll back transaction {} in status {status:?}",
                self.id
            )));
        }

        let span = info_span!("rollback", txn_id = %self.id);
        async {
            let mut result = Ok(());
            if let Some(attempt) = attempt {
                result = self.rollback_written(&attempt.data, &attempt.write_set).await;
            }
            if result.is_ok() {
                result = self.release_pessimistic_locks().await;
            }

            match &result {
                Ok(()) => {
                    self.cache.lock().clear();
                    if status != TransactionStatus::Cancel {
                        self.set_status(TransactionStatus::Rollback);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "rollback failed");
                    self.set_status(TransactionStatus::RollbackFail);
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Request cancellation; a running commit observes it at its next
    /// checkpoint and rolls back.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let job = *self.current_job.lock();
        if let Some(job) = job
            && let Err(err) = self.shared.jobs.cancel(job)
        {
            debug!(txn_id = %self.id, error = %err, "job already finished");
        }
        info!(txn_id = %self.id, "cancellation requested");
    }

    /// Wait for the background secondary commit, if one is running
    pub async fn join_background(&self) -> Result<()> {
        let handle = self.background.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            *self.background_error.lock() =
                Some(CoordinatorError::Internal(format!("secondary commit task failed: {err}")));
        }
        match self.background_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop the background secondary commit. Returns whether one was still
    /// running.
    ///
    /// The primary is already committed, so the transaction stays committed;
    /// secondary locks left behind resolve through the primary. `cancel`
    /// leaves the background commit alone.
    pub fn abort_background(&self) -> bool {
        let Some(handle) = self.background.lock().take() else {
            return false;
        };
        let running = !handle.is_finished();
        handle.abort();
        if running {
            info!(txn_id = %self.id, "background secondary commit aborted");
        }
        running
    }

    /// Failure of the secondary commit, recorded after the primary committed
    pub fn background_error(&self) -> Option<CoordinatorError> {
        self.background_error.lock().clone()
    }

    /// Finish the transaction: wait for a running commit and background
    /// work, clean up what an uncommitted transaction left in storage, drop
    /// buffered data and unregister. Closing again does nothing.
    ///
    /// Returns the background commit failure, if there was one.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let span = info_span!("close", txn_id = %self.id);
        async {
            // Held to the end so no commit starts after cleanup
            let _running = self.committing.lock().await;
            let background = self.join_background().await;

            let (status, attempt) = {
                let state = self.state.lock();
                (state.status, state.attempt.clone())
            };
            if status != TransactionStatus::Commit {
                let failed = matches!(
                    status,
                    TransactionStatus::PreWriteFail
                        | TransactionStatus::CommitFail
                        | TransactionStatus::RollbackFail
                );
                if failed
                    && let Some(attempt) = attempt
                    && let Err(err) = self.rollback_written(&attempt.data, &attempt.write_set).await
                {
                    warn!(error = %err, "rollback during close failed");
                }
                if let Err(err) = self.release_pessimistic_locks().await {
                    warn!(error = %err, "failed to release pessimistic locks");
                }
            }

            self.stop_heartbeat();
            self.cache.lock().clear();
            self.shared.registry.remove(&self.id);
            self.set_status(TransactionStatus::Close);
            info!("transaction closed");
            background
        }
        .instrument(span)
        .await
    }

    fn ensure_active(&self, operation: &str) -> Result<()> {
        let status = self.status();
        if status != TransactionStatus::Start {
            return Err(CoordinatorError::InvalidState(format!(
                "cannot {operation} transaction {} in status {status:?}",
                self.id
            )));
        }
        Ok(())
    }

    /// Move to `status`; a closed transaction stays closed
    fn set_status(&self, status: TransactionStatus) {
        let mut state = self.state.lock();
        if state.status == TransactionStatus::Close {
            return;
        }
        if state.status != status {
            debug!(txn_id = %self.id, from = ?state.status, to = ?status, "status change");
            state.status = status;
        }
    }

    fn record_attempt(&self, data: &Arc<TwoPhaseCommitData>, write_set: &Arc<WriteSet>) {
        self.state.lock().attempt = Some(Attempt {
            data: data.clone(),
            write_set: write_set.clone(),
        });
    }

    fn finish_commit(&self, commit_ts: Timestamp) {
        self.stop_heartbeat();
        self.shared.tso.update(commit_ts);
        self.state.lock().commit_ts = Some(commit_ts);
        self.set_status(TransactionStatus::Commit);
    }

    fn strategy_ctx(&self, primary_locked: bool) -> StrategyCtx<'_> {
        let state = self.state.lock();
        StrategyCtx {
            executor: self.shared.executor.as_ref(),
            config: &self.shared.config,
            start_ts: state.start_ts,
            for_update_ts: state.for_update_ts,
            primary_locked,
        }
    }

    fn start_heartbeat(&self, data: &TwoPhaseCommitData) {
        let target = HeartbeatTarget {
            txn_id: self.id,
            part: data.primary_part,
            primary: data.primary.clone(),
            start_ts: data.start_ts,
            lock_ttl_ms: data.lock_ttl_ms,
        };
        let heartbeat = Heartbeat::start(
            self.shared.executor.clone(),
            target,
            self.shared.config.heartbeat_interval(),
            self.cancel.clone(),
        );
        *self.heartbeat.lock() = Some(heartbeat);
    }

    fn stop_heartbeat(&self) {
        self.heartbeat.lock().take();
    }

    fn render<O, F>(&self, rows: BTreeMap<TxnPartData, Vec<Tuple>>, with_root: bool, make_op: F) -> Result<Job>
    where
        O: Operator + 'static,
        F: Fn() -> O,
    {
        let ctx = RenderContext {
            jobs: &self.shared.jobs,
            meta: self.shared.meta.as_ref(),
            home: self.shared.node,
            start_ts: self.start_ts(),
            seq_id: self.next_job_seq.fetch_add(1, Ordering::SeqCst),
            txn_id: self.id,
            batch_size: self.shared.config.scan_batch_size,
        };
        ctx.render(rows, with_root, make_op)
    }

    /// Run a job with a root and return the number of rows it handled
    async fn run_with_root(&self, job: Job) -> Result<u64> {
        let jobs = &self.shared.jobs;
        let job = jobs.submit(job);
        *self.current_job.lock() = Some(job.id());

        let params = IteratorParams {
            remove_on_finish: true,
        };
        let result = match jobs.create_iterator(&job, params).await {
            Ok(iter) => iter.collect_rows().await.map_err(CoordinatorError::from),
            Err(err) => {
                jobs.remove_job(job.id());
                Err(err.into())
            }
        };
        *self.current_job.lock() = None;

        Ok(result?
            .iter()
            .map(|row| match row {
                Tuple::Count(n) => *n,
                _ => 0,
            })
            .sum())
    }

    /// Run a job without a root and wait for every task
    async fn run_to_completion(&self, job: Job) -> Result<()> {
        let jobs = &self.shared.jobs;
        let job = jobs.submit(job);
        let result = match jobs.execute(&job).await {
            Ok(run) => run.join().await.map_err(CoordinatorError::from),
            Err(err) => Err(err.into()),
        };
        jobs.remove_job(job.id());
        result
    }
}
