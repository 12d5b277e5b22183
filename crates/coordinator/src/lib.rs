//! Distributed transaction coordinator
//!
//! Drives percolator-style commits over a partitioned MVCC store:
//! - optimistic and pessimistic transactions with snapshot or read-committed reads
//! - one-phase commit for small single-partition writes
//! - async commit with secondaries committed in the background
//! - pre-write, rollback and lock cleanup fanned out as DAG jobs across leader nodes

mod cache;
mod cancel;
mod config;
mod coordinator;
mod error;
mod heartbeat;
mod operators;
mod registry;
mod render;
mod strategy;
mod transaction;
mod tso;
mod two_phase;

pub use cache::{TxnCache, WriteSet};
pub use cancel::CancelToken;
pub use config::{ConflictPolicy, CoordinatorConfig};
pub use coordinator::Coordinator;
pub use error::{CoordinatorError, ErrorClass, Result};
pub use registry::TxnRegistry;
pub use transaction::{Transaction, TransactionStatus};
pub use tso::TimestampAuthority;
pub use two_phase::{TwoPhaseCommitData, TwoPhaseCommitExecutor};

// Re-export the vocabulary types callers need alongside the coordinator
pub use meridian_common::{IsolationLevel, Key, Mutation, Timestamp, TransactionKind, TxnId, Value};
