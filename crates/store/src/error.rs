//! Error types for the storage service boundary
//!
//! Every expected protocol outcome (routing staleness, conflicts, duplicate
//! keys, lock waits) is a distinguished variant so callers can match on it
//! instead of parsing messages.

use meridian_common::{Key, Timestamp, TxnPartData};
use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by storage primitives
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Region {part} no longer serves the request (split or epoch change)")]
    RegionSplit { part: TxnPartData },

    #[error(
        "Write conflict on key {}: txn {start_ts} conflicts with txn {conflict_start_ts} (commit {conflict_commit_ts})",
        String::from_utf8_lossy(.key)
    )]
    WriteConflict {
        key: Key,
        start_ts: Timestamp,
        conflict_start_ts: Timestamp,
        conflict_commit_ts: Timestamp,
    },

    #[error("Duplicate entry for key {}", String::from_utf8_lossy(.key))]
    DuplicateEntry { key: Key },

    #[error("Lock wait timeout on key {} held by txn {lock_ts}", String::from_utf8_lossy(.key))]
    LockWaitTimeout { key: Key, lock_ts: Timestamp },

    #[error(
        "Commit ts {commit_ts} expired for key {}: min commit ts is {min_commit_ts}",
        String::from_utf8_lossy(.key)
    )]
    CommitTsExpired {
        key: Key,
        commit_ts: Timestamp,
        min_commit_ts: Timestamp,
    },

    #[error("Transaction {start_ts} has no lock on key {}", String::from_utf8_lossy(.key))]
    TxnNotFound { key: Key, start_ts: Timestamp },

    #[error("Transaction {start_ts} already rolled back on key {}", String::from_utf8_lossy(.key))]
    AlreadyRolledBack { key: Key, start_ts: Timestamp },

    #[error(
        "Transaction {start_ts} already committed on key {} at {commit_ts}",
        String::from_utf8_lossy(.key)
    )]
    AlreadyCommitted {
        key: Key,
        start_ts: Timestamp,
        commit_ts: Timestamp,
    },

    #[error("Table not found: {0}")]
    TableNotFound(u64),

    #[error("Partition not found: {0}")]
    PartitionNotFound(TxnPartData),

    #[error("Storage error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the caller should re-resolve partition ownership and resubmit.
    pub fn is_region_split(&self) -> bool {
        matches!(self, StoreError::RegionSplit { .. })
    }

    /// Whether this error must unwind the whole commit attempt.
    pub fn is_conflict_class(&self) -> bool {
        matches!(
            self,
            StoreError::WriteConflict { .. }
                | StoreError::DuplicateEntry { .. }
                | StoreError::LockWaitTimeout { .. }
        )
    }
}
