//! Common types for the Meridian transaction layer
//!
//! This crate defines:
//! - Packed hybrid logical timestamps
//! - Transaction, job, task, vertex and node identifiers
//! - Buffered mutations and the partitions they route to

mod mutation;
mod timestamp;
mod transaction_id;

pub use mutation::{IsolationLevel, Key, Mutation, Op, TransactionKind, TxnPartData, Value};
pub use timestamp::Timestamp;
pub use transaction_id::{JobId, NodeId, TaskId, TxnId, VertexId};
