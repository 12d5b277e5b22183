//! Per-partition transactional primitives consumed by the coordinator.

use crate::error::Result;
use crate::meta::RegionCtx;
use async_trait::async_trait;
use meridian_common::{Key, Mutation, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Acquire pessimistic locks on keys of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PessimisticLockRequest {
    pub start_ts: Timestamp,
    pub for_update_ts: Timestamp,
    pub primary: Key,
    pub keys: Vec<Key>,
    pub lock_ttl_ms: u64,
    /// How long to wait on a conflicting lock before giving up
    pub wait_timeout: Duration,
}

/// Outcome of a pessimistic lock request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PessimisticLockResponse {
    pub locked: bool,
    /// Latest committed value of each requested key, in request order
    pub prior_values: Vec<Option<Value>>,
}

/// Async-commit parameters attached to a pre-write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncCommitParams {
    /// Candidate minimum commit timestamp obtained by the coordinator
    pub min_commit_ts: Timestamp,
    /// Secondary keys, recorded on the primary lock only
    pub secondaries: Vec<Key>,
}

/// Pre-write a batch of mutations belonging to one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrewriteRequest {
    pub start_ts: Timestamp,
    pub primary: Key,
    pub mutations: Vec<Mutation>,
    pub lock_ttl_ms: u64,
    /// Set for pessimistic transactions
    pub for_update_ts: Option<Timestamp>,
    pub async_commit: Option<AsyncCommitParams>,
}

impl PrewriteRequest {
    pub fn is_pessimistic(&self) -> bool {
        self.for_update_ts.is_some()
    }
}

/// Outcome of a successful pre-write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrewriteResponse {
    /// Minimum commit timestamp of the written locks, for async commit
    pub min_commit_ts: Option<Timestamp>,
}

/// Outcome of a one-phase commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnePcOutcome {
    /// Locked and committed in one round trip
    Committed { commit_ts: Timestamp },
    /// The partition declined; nothing was written and the caller runs 2PC
    NeedsTwoPc,
}

/// Commit previously pre-written keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub start_ts: Timestamp,
    pub commit_ts: Timestamp,
    pub keys: Vec<Key>,
}

/// Roll back pre-written keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRollbackRequest {
    pub start_ts: Timestamp,
    pub keys: Vec<Key>,
}

/// Release pessimistic locks that were never pre-written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PessimisticRollbackRequest {
    pub start_ts: Timestamp,
    pub for_update_ts: Timestamp,
    pub keys: Vec<Key>,
}

/// Extend the TTL of a primary lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartBeatRequest {
    pub primary: Key,
    pub start_ts: Timestamp,
    pub advise_ttl_ms: u64,
}

/// Transactional key-value primitives of one partition.
///
/// Every call may fail with [`StoreError::RegionSplit`](crate::StoreError::RegionSplit)
/// when the routing context is stale; the caller re-resolves ownership from
/// metadata and resubmits.
#[async_trait]
pub trait StoreService: Send + Sync {
    async fn pessimistic_lock(
        &self,
        ctx: &RegionCtx,
        request: PessimisticLockRequest,
    ) -> Result<PessimisticLockResponse>;

    async fn prewrite(&self, ctx: &RegionCtx, request: PrewriteRequest) -> Result<PrewriteResponse>;

    /// Lock and commit in a single call when the partition agrees to.
    async fn one_pc(&self, ctx: &RegionCtx, request: PrewriteRequest) -> Result<OnePcOutcome>;

    async fn commit(&self, ctx: &RegionCtx, request: CommitRequest) -> Result<()>;

    /// Roll back keys; rolling back an already rolled back key succeeds.
    async fn batch_rollback(&self, ctx: &RegionCtx, request: BatchRollbackRequest) -> Result<()>;

    async fn pessimistic_rollback(
        &self,
        ctx: &RegionCtx,
        request: PessimisticRollbackRequest,
    ) -> Result<()>;

    /// Returns the TTL now in effect for the primary lock.
    async fn txn_heart_beat(&self, ctx: &RegionCtx, request: HeartBeatRequest) -> Result<u64>;

    /// Snapshot read of the latest value committed at or before `read_ts`.
    async fn get(&self, ctx: &RegionCtx, key: &[u8], read_ts: Timestamp) -> Result<Option<Value>>;
}
