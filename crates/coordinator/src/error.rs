//! Error types for the coordinator
//!
//! Conflict-class storage outcomes are lifted into their own variants so the
//! session layer can tell a retryable conflict from a duplicate key, a lock
//! wait timeout or a cancellation by calling [`CoordinatorError::class`].

use meridian_common::{Key, Timestamp, TxnPartData};
use meridian_dag::{ClassifiedError, DagError, FinError, FinKind};
use meridian_store::StoreError;
use thiserror::Error;

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// How the caller should treat a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Conflict with a concurrent transaction; retrying may succeed
    Retryable,
    DuplicateKey,
    LockTimeout,
    Cancelled,
    Internal,
}

/// Coordinator error types
#[derive(Error, Debug, Clone)]
pub enum CoordinatorError {
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
    LockWait { key: Key, lock_ts: Timestamp },

    #[error(
        "Commit ts {commit_ts} expired for key {}: min commit ts is {min_commit_ts}",
        String::from_utf8_lossy(.key)
    )]
    CommitTsExpired {
        key: Key,
        commit_ts: Timestamp,
        min_commit_ts: Timestamp,
    },

    #[error("Transaction cancelled: {0}")]
    Cancelled(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    #[error("Partition {part} still splitting after {attempts} re-resolutions")]
    RegionRetryExhausted { part: TxnPartData, attempts: usize },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error("Job error: {0}")]
    Dag(DagError),

    #[error("Task failed ({kind}): {message}")]
    TaskFin { kind: FinKind, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CoordinatorError::WriteConflict { .. }
            | CoordinatorError::CommitTsExpired { .. }
            | CoordinatorError::RegionRetryExhausted { .. } => ErrorClass::Retryable,
            CoordinatorError::DuplicateEntry { .. } => ErrorClass::DuplicateKey,
            CoordinatorError::LockWait { .. } => ErrorClass::LockTimeout,
            CoordinatorError::Cancelled(_) => ErrorClass::Cancelled,
            CoordinatorError::TaskFin { kind, .. } => match kind {
                FinKind::WriteConflict => ErrorClass::Retryable,
                FinKind::DuplicateEntry => ErrorClass::DuplicateKey,
                FinKind::LockWait => ErrorClass::LockTimeout,
                FinKind::Cancelled => ErrorClass::Cancelled,
                FinKind::Other => ErrorClass::Internal,
            },
            _ => ErrorClass::Internal,
        }
    }

    /// A pre-write lost to a concurrent writer; restarting with a fresh start
    /// timestamp may succeed.
    pub fn is_write_conflict(&self) -> bool {
        matches!(
            self,
            CoordinatorError::WriteConflict { .. }
                | CoordinatorError::TaskFin {
                    kind: FinKind::WriteConflict,
                    ..
                }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.class() == ErrorClass::Cancelled
    }

    /// Whether the error must unwind the whole commit attempt rather than
    /// just be logged next to another failure.
    pub fn is_conflict_class(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Retryable | ErrorClass::DuplicateKey | ErrorClass::LockTimeout
        )
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WriteConflict {
                key,
                start_ts,
                conflict_start_ts,
                conflict_commit_ts,
            } => CoordinatorError::WriteConflict {
                key,
                start_ts,
                conflict_start_ts,
                conflict_commit_ts,
            },
            StoreError::DuplicateEntry { key } => CoordinatorError::DuplicateEntry { key },
            StoreError::LockWaitTimeout { key, lock_ts } => CoordinatorError::LockWait { key, lock_ts },
            StoreError::CommitTsExpired {
                key,
                commit_ts,
                min_commit_ts,
            } => CoordinatorError::CommitTsExpired {
                key,
                commit_ts,
                min_commit_ts,
            },
            other => CoordinatorError::Store(other),
        }
    }
}

impl From<DagError> for CoordinatorError {
    fn from(err: DagError) -> Self {
        match err {
            DagError::Cancelled(task) => CoordinatorError::Cancelled(format!("{task} cancelled")),
            other => CoordinatorError::Dag(other),
        }
    }
}

impl From<FinError> for CoordinatorError {
    fn from(err: FinError) -> Self {
        if let Some(inner) = err.downcast_ref::<CoordinatorError>() {
            return inner.clone();
        }
        match err.kind {
            FinKind::Cancelled => CoordinatorError::Cancelled(err.message),
            kind => CoordinatorError::TaskFin {
                kind,
                message: err.message,
            },
        }
    }
}

impl ClassifiedError for CoordinatorError {
    fn fin_kind(&self) -> FinKind {
        match self.class() {
            ErrorClass::Retryable => FinKind::WriteConflict,
            ErrorClass::DuplicateKey => FinKind::DuplicateEntry,
            ErrorClass::LockTimeout => FinKind::LockWait,
            ErrorClass::Cancelled => FinKind::Cancelled,
            ErrorClass::Internal => FinKind::Other,
        }
    }

    fn conflict_key(&self) -> Option<Key> {
        match self {
            CoordinatorError::WriteConflict { key, .. }
            | CoordinatorError::DuplicateEntry { key }
            | CoordinatorError::LockWait { key, .. }
            | CoordinatorError::CommitTsExpired { key, .. } => Some(key.clone()),
            _ => None,
        }
    }
}
