//! Storage boundary of the Meridian transaction layer
//!
//! This crate provides:
//! - Range-partition metadata and key routing
//! - The per-partition transactional primitives the coordinator drives
//! - An in-memory multi-version store implementing those primitives

mod error;
mod lock;
mod memory;
mod meta;
mod mvcc;
mod service;

pub use error::{Result, StoreError};
pub use lock::{Lock, LockKind};
pub use memory::{FailPoint, MemoryStore, RpcKind, RpcRecord};
pub use meta::{
    MemoryMeta, MetaService, PartitionDescriptor, RangeDistribution, RegionCtx, key_in_range, locate,
};
pub use service::{
    AsyncCommitParams, BatchRollbackRequest, CommitRequest, HeartBeatRequest, OnePcOutcome,
    PessimisticLockRequest, PessimisticLockResponse, PessimisticRollbackRequest, PrewriteRequest,
    PrewriteResponse, StoreService,
};
