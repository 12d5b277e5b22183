//! In-memory storage service
//!
//! Serves every partition registered in a [`MemoryMeta`] from one lock table
//! and one write column. Every call is journaled so tests can assert on the
//! order and content of the requests a coordinator issued, and fail points
//! let a test inject region splits or errors on a chosen key.

use crate::error::{Result, StoreError};
use crate::lock::{Lock, LockAttemptResult, LockKind, LockTable};
use crate::meta::{MemoryMeta, RegionCtx};
use crate::mvcc::{Write, WriteColumn, WriteKind};
use crate::service::{
    BatchRollbackRequest, CommitRequest, HeartBeatRequest, OnePcOutcome, PessimisticLockRequest,
    PessimisticLockResponse, PessimisticRollbackRequest, PrewriteRequest, PrewriteResponse,
    StoreService,
};
use async_trait::async_trait;
use meridian_common::{Key, Mutation, Op, Timestamp, TxnPartData, Value};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Storage primitive a journal record or fail point refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcKind {
    PessimisticLock,
    Prewrite,
    OnePc,
    Commit,
    BatchRollback,
    PessimisticRollback,
    HeartBeat,
    Get,
}

/// One journaled storage call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRecord {
    /// Arrival order across all partitions
    pub seq: u64,
    pub kind: RpcKind,
    pub part: TxnPartData,
    pub start_ts: Timestamp,
    pub keys: Vec<Key>,
    /// Commit timestamp for commit and successful 1PC calls
    pub commit_ts: Option<Timestamp>,
    pub error: Option<StoreError>,
}

impl RpcRecord {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn touches(&self, key: &[u8]) -> bool {
        self.keys.iter().any(|k| k.as_slice() == key)
    }
}

/// Injected failure, consumed the first time it matches
#[derive(Debug, Clone)]
pub enum FailPoint {
    /// Split the partition at `key` right before serving the call
    SplitBefore { kind: RpcKind, key: Key },
    /// Fail the call with `error`
    Error {
        kind: RpcKind,
        key: Option<Key>,
        error: StoreError,
    },
}

type Observer = Arc<dyn Fn(&RpcRecord) + Send + Sync>;

#[derive(Default)]
struct State {
    locks: LockTable,
    writes: WriteColumn,
    /// Highest timestamp any reader used, bounds async-commit timestamps
    max_read_ts: Timestamp,
}

enum LockAttempt {
    Acquired(PessimisticLockResponse),
    Blocked { key: Key, holder: Timestamp },
}

/// In-memory implementation of [`StoreService`]
pub struct MemoryStore {
    meta: Arc<MemoryMeta>,
    state: Mutex<State>,
    journal: Mutex<Vec<RpcRecord>>,
    next_seq: AtomicU64,
    fail_points: Mutex<Vec<FailPoint>>,
    observer: RwLock<Option<Observer>>,
    one_pc_enabled: AtomicBool,
    lock_released: Notify,
}

impl MemoryStore {
    pub fn new(meta: Arc<MemoryMeta>) -> Self {
        Self {
            meta,
            state: Mutex::new(State::default()),
            journal: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            fail_points: Mutex::new(Vec::new()),
            observer: RwLock::new(None),
            one_pc_enabled: AtomicBool::new(true),
            lock_released: Notify::new(),
        }
    }

    pub fn meta(&self) -> &Arc<MemoryMeta> {
        &self.meta
    }

    /// Snapshot of all journaled calls in arrival order
    pub fn journal(&self) -> Vec<RpcRecord> {
        self.journal.lock().clone()
    }

    /// Journaled calls of one kind in arrival order
    pub fn journal_of(&self, kind: RpcKind) -> Vec<RpcRecord> {
        self.journal
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    /// Install a callback invoked after every journaled call
    pub fn set_observer(&self, observer: impl Fn(&RpcRecord) + Send + Sync + 'static) {
        *self.observer.write() = Some(Arc::new(observer));
    }

    /// Split the partition at `key` the next time a `kind` call touches it
    pub fn fail_split_before(&self, kind: RpcKind, key: impl Into<Key>) {
        self.fail_points.lock().push(FailPoint::SplitBefore {
            kind,
            key: key.into(),
        });
    }

    /// Fail the next `kind` call (touching `key`, if given) with `error`
    pub fn fail_once(&self, kind: RpcKind, key: Option<Key>, error: StoreError) {
        self.fail_points
            .lock()
            .push(FailPoint::Error { kind, key, error });
    }

    /// When disabled every 1PC attempt answers [`OnePcOutcome::NeedsTwoPc`]
    pub fn set_one_pc_enabled(&self, enabled: bool) {
        self.one_pc_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Latest committed value of a key
    pub fn latest_value(&self, key: &[u8]) -> Option<Value> {
        self.state.lock().writes.get_latest(key).cloned()
    }

    pub fn lock_of(&self, key: &[u8]) -> Option<Lock> {
        self.state.lock().locks.get(key).cloned()
    }

    pub fn has_lock(&self, key: &[u8]) -> bool {
        self.state.lock().locks.get(key).is_some()
    }

    /// Keys a transaction still holds locks on
    pub fn locked_keys(&self, start_ts: Timestamp) -> Vec<Key> {
        self.state.lock().locks.locks_held_by(start_ts)
    }

    /// Commit timestamp a transaction left on a key, if it committed there
    pub fn commit_ts_of(&self, key: &[u8], start_ts: Timestamp) -> Option<Timestamp> {
        self.state
            .lock()
            .writes
            .find_by_start_ts(key, start_ts)
            .filter(|(_, w)| w.kind != WriteKind::Rollback)
            .map(|(ts, _)| ts)
    }

    fn trigger_fail_points(&self, kind: RpcKind, ctx: &RegionCtx, keys: &[Key]) -> Result<()> {
        let mut points = self.fail_points.lock();
        let position = points.iter().position(|point| match point {
            FailPoint::SplitBefore { kind: k, key } => *k == kind && keys.contains(key),
            FailPoint::Error { kind: k, key, .. } => {
                *k == kind && key.as_ref().is_none_or(|key| keys.contains(key))
            }
        });
        let Some(position) = position else {
            return Ok(());
        };
        let point = points.remove(position);
        drop(points);
        match point {
            FailPoint::SplitBefore { key, .. } => {
                self.meta.split(ctx.part.table_id, &key)?;
                Err(StoreError::RegionSplit { part: ctx.part })
            }
            FailPoint::Error { error, .. } => Err(error),
        }
    }

    /// Route check and fail points shared by every call
    fn admit(&self, kind: RpcKind, ctx: &RegionCtx, keys: &[Key]) -> Result<()> {
        self.trigger_fail_points(kind, ctx, keys)?;
        self.meta
            .check_region(ctx, keys.iter().map(|k| k.as_slice()))
    }

    fn record<T>(
        &self,
        kind: RpcKind,
        ctx: &RegionCtx,
        start_ts: Timestamp,
        keys: Vec<Key>,
        commit_ts: Option<Timestamp>,
        result: &Result<T>,
    ) {
        let record = RpcRecord {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            kind,
            part: ctx.part,
            start_ts,
            keys,
            commit_ts,
            error: result.as_ref().err().cloned(),
        };
        debug!(
            seq = record.seq,
            kind = ?record.kind,
            part = %record.part,
            start_ts = %record.start_ts,
            keys = record.keys.len(),
            ok = record.is_ok(),
            "store call"
        );
        self.journal.lock().push(record.clone());

        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer(&record);
        }
    }

    /// Decide whether a mutation must be written. `Ok(false)` means the
    /// transaction already wrote it (retried request).
    fn check_prewrite(state: &State, request: &PrewriteRequest, mutation: &Mutation) -> Result<bool> {
        let key = &mutation.key;
        match state.locks.check(request.start_ts, key) {
            LockAttemptResult::Conflict { holder } => {
                return Err(StoreError::WriteConflict {
                    key: key.clone(),
                    start_ts: request.start_ts,
                    conflict_start_ts: holder,
                    conflict_commit_ts: Timestamp::ZERO,
                });
            }
            LockAttemptResult::Owned(kind) if !kind.is_pessimistic() => return Ok(false),
            LockAttemptResult::Owned(_) => {}
            LockAttemptResult::Free => {
                if let Some((_, write)) = state.writes.find_by_start_ts(key, request.start_ts) {
                    return match write.kind {
                        WriteKind::Rollback => Err(StoreError::AlreadyRolledBack {
                            key: key.clone(),
                            start_ts: request.start_ts,
                        }),
                        _ => Ok(false),
                    };
                }
                if let Some((commit_ts, write)) = state.writes.latest_data_write(key)
                    && commit_ts >= request.start_ts
                {
                    return Err(StoreError::WriteConflict {
                        key: key.clone(),
                        start_ts: request.start_ts,
                        conflict_start_ts: write.start_ts,
                        conflict_commit_ts: commit_ts,
                    });
                }
            }
        }

        if mutation.op == Op::CheckNotExists && state.writes.get_latest(key).is_some() {
            return Err(StoreError::DuplicateEntry { key: key.clone() });
        }
        Ok(true)
    }

    fn validate_prewrite<'a>(state: &State, request: &'a PrewriteRequest) -> Result<Vec<&'a Mutation>> {
        let mut pending = Vec::with_capacity(request.mutations.len());
        for mutation in &request.mutations {
            if Self::check_prewrite(state, request, mutation)? {
                pending.push(mutation);
            }
        }
        Ok(pending)
    }

    fn try_pessimistic_lock(state: &mut State, request: &PessimisticLockRequest) -> Result<LockAttempt> {
        for key in &request.keys {
            match state.locks.check(request.start_ts, key) {
                LockAttemptResult::Conflict { holder } => {
                    return Ok(LockAttempt::Blocked {
                        key: key.clone(),
                        holder,
                    });
                }
                LockAttemptResult::Owned(_) => {}
                LockAttemptResult::Free => {
                    if let Some((commit_ts, write)) = state.writes.latest_data_write(key)
                        && commit_ts > request.for_update_ts
                    {
                        return Err(StoreError::WriteConflict {
                            key: key.clone(),
                            start_ts: request.start_ts,
                            conflict_start_ts: write.start_ts,
                            conflict_commit_ts: commit_ts,
                        });
                    }
                }
            }
        }

        let mut prior_values = Vec::with_capacity(request.keys.len());
        for key in &request.keys {
            prior_values.push(state.writes.get_latest(key).cloned());
            if let Some(lock) = state.locks.get_mut(key) {
                lock.for_update_ts = lock.for_update_ts.max(request.for_update_ts);
                continue;
            }
            state.locks.grant(
                key.clone(),
                Lock {
                    primary: request.primary.clone(),
                    start_ts: request.start_ts,
                    for_update_ts: request.for_update_ts,
                    ttl_ms: request.lock_ttl_ms,
                    kind: LockKind::Pessimistic,
                    min_commit_ts: request.for_update_ts.next(),
                    use_async_commit: false,
                    secondaries: Vec::new(),
                },
            );
        }

        Ok(LockAttempt::Acquired(PessimisticLockResponse {
            locked: true,
            prior_values,
        }))
    }

    async fn pessimistic_lock_inner(
        &self,
        ctx: &RegionCtx,
        request: &PessimisticLockRequest,
    ) -> Result<PessimisticLockResponse> {
        self.admit(RpcKind::PessimisticLock, ctx, &request.keys)?;
        let deadline = Instant::now() + request.wait_timeout;

        loop {
            // Register before checking so a release between the check and the
            // wait is not missed
            let released = self.lock_released.notified();

            let attempt = Self::try_pessimistic_lock(&mut self.state.lock(), request)?;
            let (key, holder) = match attempt {
                LockAttempt::Acquired(response) => return Ok(response),
                LockAttempt::Blocked { key, holder } => (key, holder),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::LockWaitTimeout { key, lock_ts: holder });
            }
            debug!(start_ts = %request.start_ts, holder = %holder, "waiting for lock release");
            let _ = tokio::time::timeout(deadline - now, released).await;
        }
    }

    fn prewrite_inner(&self, ctx: &RegionCtx, request: &PrewriteRequest) -> Result<PrewriteResponse> {
        let keys: Vec<Key> = request.mutations.iter().map(|m| m.key.clone()).collect();
        self.admit(RpcKind::Prewrite, ctx, &keys)?;

        let mut state = self.state.lock();
        let pending = Self::validate_prewrite(&state, request)?;

        let min_commit_ts = match &request.async_commit {
            Some(params) => params
                .min_commit_ts
                .max(state.max_read_ts.next())
                .max(request.start_ts.next()),
            None => request.start_ts.next(),
        };
        let for_update_ts = request.for_update_ts.unwrap_or(Timestamp::ZERO);

        for mutation in pending {
            let secondaries = match &request.async_commit {
                Some(params) if mutation.key == request.primary => params.secondaries.clone(),
                _ => Vec::new(),
            };
            state.locks.grant(
                mutation.key.clone(),
                Lock {
                    primary: request.primary.clone(),
                    start_ts: request.start_ts,
                    for_update_ts,
                    ttl_ms: request.lock_ttl_ms,
                    kind: LockKind::from_mutation(mutation),
                    min_commit_ts,
                    use_async_commit: request.async_commit.is_some(),
                    secondaries,
                },
            );
        }

        Ok(PrewriteResponse {
            min_commit_ts: request.async_commit.as_ref().map(|_| min_commit_ts),
        })
    }

    fn one_pc_inner(&self, ctx: &RegionCtx, request: &PrewriteRequest) -> Result<OnePcOutcome> {
        let keys: Vec<Key> = request.mutations.iter().map(|m| m.key.clone()).collect();
        self.admit(RpcKind::OnePc, ctx, &keys)?;

        if !self.one_pc_enabled.load(Ordering::SeqCst) {
            return Ok(OnePcOutcome::NeedsTwoPc);
        }

        let mut state = self.state.lock();
        let pending = Self::validate_prewrite(&state, request)?;

        let commit_ts = state
            .max_read_ts
            .max(request.start_ts)
            .max(request.for_update_ts.unwrap_or(Timestamp::ZERO))
            .next();

        for mutation in pending {
            state.locks.release(request.start_ts, &mutation.key);
            state.writes.put(
                mutation.key.clone(),
                commit_ts,
                Write {
                    start_ts: request.start_ts,
                    kind: write_kind(LockKind::from_mutation(mutation)),
                },
            );
        }
        drop(state);
        self.lock_released.notify_waiters();

        Ok(OnePcOutcome::Committed { commit_ts })
    }

    fn commit_inner(&self, ctx: &RegionCtx, request: &CommitRequest) -> Result<()> {
        self.admit(RpcKind::Commit, ctx, &request.keys)?;

        let mut state = self.state.lock();
        let mut pending = Vec::with_capacity(request.keys.len());
        for key in &request.keys {
            match state.locks.get(key) {
                Some(lock) if lock.start_ts == request.start_ts => {
                    if lock.kind.is_pessimistic() {
                        return Err(StoreError::TxnNotFound {
                            key: key.clone(),
                            start_ts: request.start_ts,
                        });
                    }
                    if request.commit_ts < lock.min_commit_ts {
                        return Err(StoreError::CommitTsExpired {
                            key: key.clone(),
                            commit_ts: request.commit_ts,
                            min_commit_ts: lock.min_commit_ts,
                        });
                    }
                    pending.push(key);
                }
                _ => match state.writes.find_by_start_ts(key, request.start_ts) {
                    Some((_, write)) if write.kind == WriteKind::Rollback => {
                        return Err(StoreError::AlreadyRolledBack {
                            key: key.clone(),
                            start_ts: request.start_ts,
                        });
                    }
                    // Already committed by an earlier attempt
                    Some(_) => {}
                    None => {
                        return Err(StoreError::TxnNotFound {
                            key: key.clone(),
                            start_ts: request.start_ts,
                        });
                    }
                },
            }
        }

        for key in pending {
            if let Some(lock) = state.locks.release(request.start_ts, key) {
                state.writes.put(
                    key.clone(),
                    request.commit_ts,
                    Write {
                        start_ts: request.start_ts,
                        kind: write_kind(lock.kind),
                    },
                );
            }
        }
        drop(state);
        self.lock_released.notify_waiters();
        Ok(())
    }

    fn batch_rollback_inner(&self, ctx: &RegionCtx, request: &BatchRollbackRequest) -> Result<()> {
        self.admit(RpcKind::BatchRollback, ctx, &request.keys)?;

        let mut state = self.state.lock();
        for key in &request.keys {
            if state.locks.check(request.start_ts, key) == LockAttemptResult::Free
                && let Some((commit_ts, write)) = state.writes.find_by_start_ts(key, request.start_ts)
                && write.kind != WriteKind::Rollback
            {
                return Err(StoreError::AlreadyCommitted {
                    key: key.clone(),
                    start_ts: request.start_ts,
                    commit_ts,
                });
            }
        }

        for key in &request.keys {
            state.locks.release(request.start_ts, key);
            let already_recorded = state.writes.find_by_start_ts(key, request.start_ts).is_some();
            let slot_taken = state
                .writes
                .latest_data_write(key)
                .is_some_and(|(ts, _)| ts == request.start_ts);
            // The rollback record stops a delayed pre-write from landing later
            if !already_recorded && !slot_taken {
                state.writes.put(
                    key.clone(),
                    request.start_ts,
                    Write {
                        start_ts: request.start_ts,
                        kind: WriteKind::Rollback,
                    },
                );
            }
        }
        drop(state);
        self.lock_released.notify_waiters();
        Ok(())
    }

    fn pessimistic_rollback_inner(&self, ctx: &RegionCtx, request: &PessimisticRollbackRequest) -> Result<()> {
        self.admit(RpcKind::PessimisticRollback, ctx, &request.keys)?;

        let mut state = self.state.lock();
        for key in &request.keys {
            let releasable = state.locks.get(key).is_some_and(|lock| {
                lock.start_ts == request.start_ts
                    && lock.kind.is_pessimistic()
                    && lock.for_update_ts <= request.for_update_ts
            });
            if releasable {
                state.locks.release(request.start_ts, key);
            }
        }
        drop(state);
        self.lock_released.notify_waiters();
        Ok(())
    }

    fn heart_beat_inner(&self, ctx: &RegionCtx, request: &HeartBeatRequest) -> Result<u64> {
        self.admit(RpcKind::HeartBeat, ctx, std::slice::from_ref(&request.primary))?;

        let mut state = self.state.lock();
        match state.locks.get_mut(&request.primary) {
            Some(lock) if lock.start_ts == request.start_ts => {
                lock.ttl_ms = lock.ttl_ms.max(request.advise_ttl_ms);
                Ok(lock.ttl_ms)
            }
            _ => Err(StoreError::TxnNotFound {
                key: request.primary.clone(),
                start_ts: request.start_ts,
            }),
        }
    }

    fn get_inner(&self, ctx: &RegionCtx, key: &[u8], read_ts: Timestamp) -> Result<Option<Value>> {
        let key = key.to_vec();
        self.admit(RpcKind::Get, ctx, std::slice::from_ref(&key))?;
        Ok(self.read_at(&key, read_ts))
    }

    /// Snapshot read without routing checks or journaling.
    ///
    /// Has the same side effects as a routed read: the store's read watermark
    /// advances and a pre-written primary lock older than the reader is
    /// pushed past `read_ts`.
    pub fn read_at(&self, key: &[u8], read_ts: Timestamp) -> Option<Value> {
        let mut state = self.state.lock();
        state.max_read_ts = state.max_read_ts.max(read_ts);

        // Secondaries follow their primary, so only the primary is pushed
        if let Some(lock) = state.locks.get_mut(key)
            && !lock.kind.is_pessimistic()
            && lock.primary.as_slice() == key
            && lock.start_ts <= read_ts
            && lock.min_commit_ts <= read_ts
        {
            lock.min_commit_ts = read_ts.next();
        }

        state.writes.get(key, read_ts).cloned()
    }
}

fn write_kind(kind: LockKind) -> WriteKind {
    match kind {
        LockKind::Put(value) => WriteKind::Put(value),
        LockKind::Delete => WriteKind::Delete,
        LockKind::Lock | LockKind::Pessimistic => WriteKind::Lock,
    }
}

#[async_trait]
impl StoreService for MemoryStore {
    async fn pessimistic_lock(
        &self,
        ctx: &RegionCtx,
        request: PessimisticLockRequest,
    ) -> Result<PessimisticLockResponse> {
        let result = self.pessimistic_lock_inner(ctx, &request).await;
        self.record(
            RpcKind::PessimisticLock,
            ctx,
            request.start_ts,
            request.keys,
            None,
            &result,
        );
        result
    }

    async fn prewrite(&self, ctx: &RegionCtx, request: PrewriteRequest) -> Result<PrewriteResponse> {
        let result = self.prewrite_inner(ctx, &request);
        let keys = request.mutations.into_iter().map(|m| m.key).collect();
        self.record(RpcKind::Prewrite, ctx, request.start_ts, keys, None, &result);
        result
    }

    async fn one_pc(&self, ctx: &RegionCtx, request: PrewriteRequest) -> Result<OnePcOutcome> {
        let result = self.one_pc_inner(ctx, &request);
        let commit_ts = match &result {
            Ok(OnePcOutcome::Committed { commit_ts }) => Some(*commit_ts),
            _ => None,
        };
        let keys = request.mutations.into_iter().map(|m| m.key).collect();
        self.record(RpcKind::OnePc, ctx, request.start_ts, keys, commit_ts, &result);
        result
    }

    async fn commit(&self, ctx: &RegionCtx, request: CommitRequest) -> Result<()> {
        let result = self.commit_inner(ctx, &request);
        self.record(
            RpcKind::Commit,
            ctx,
            request.start_ts,
            request.keys,
            Some(request.commit_ts),
            &result,
        );
        result
    }

    async fn batch_rollback(&self, ctx: &RegionCtx, request: BatchRollbackRequest) -> Result<()> {
        let result = self.batch_rollback_inner(ctx, &request);
        self.record(
            RpcKind::BatchRollback,
            ctx,
            request.start_ts,
            request.keys,
            None,
            &result,
        );
        result
    }

    async fn pessimistic_rollback(
        &self,
        ctx: &RegionCtx,
        request: PessimisticRollbackRequest,
    ) -> Result<()> {
        let result = self.pessimistic_rollback_inner(ctx, &request);
        self.record(
            RpcKind::PessimisticRollback,
            ctx,
            request.start_ts,
            request.keys,
            None,
            &result,
        );
        result
    }

    async fn txn_heart_beat(&self, ctx: &RegionCtx, request: HeartBeatRequest) -> Result<u64> {
        let result = self.heart_beat_inner(ctx, &request);
        self.record(
            RpcKind::HeartBeat,
            ctx,
            request.start_ts,
            vec![request.primary],
            None,
            &result,
        );
        result
    }

    async fn get(&self, ctx: &RegionCtx, key: &[u8], read_ts: Timestamp) -> Result<Option<Value>> {
        let result = self.get_inner(ctx, key, read_ts);
        self.record(RpcKind::Get, ctx, read_ts, vec![key.to_vec()], None, &result);
        result
    }
}
