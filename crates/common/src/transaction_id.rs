//! Identifiers handed out by the timestamp authority
//!
//! Transaction ids embed the start timestamp they were created with, so
//! ordering two ids orders the transactions by age. Job, task and vertex ids
//! are plain sequence numbers scoped to one coordinator process.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the node (server) that owns a task or a region leader.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(id: u64) -> Self {
        NodeId(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Server-unique transaction identifier.
///
/// Total ordering is start timestamp, then server, then sequence. The
/// sequence disambiguates two transactions started on the same server at the
/// same timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId {
    pub server_id: u64,
    /// Start timestamp at begin. An id never changes, so after a write
    /// conflict restart the transaction's current start timestamp is newer.
    pub start_ts: Timestamp,
    pub seq: u64,
}

impl TxnId {
    pub const fn new(server_id: u64, start_ts: Timestamp, seq: u64) -> Self {
        Self {
            server_id,
            start_ts,
            seq,
        }
    }

    /// Parse from the `server-start_ts-seq` form produced by `Display`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 3 {
            return Err(format!(
                "Invalid transaction ID: {} (expected server-start_ts-seq)",
                s
            ));
        }

        let server_id = parts[0]
            .parse()
            .map_err(|_| format!("Invalid server component: {}", parts[0]))?;
        let start_ts = parts[1]
            .parse::<u64>()
            .map_err(|_| format!("Invalid start_ts component: {}", parts[1]))?;
        let seq = parts[2]
            .parse()
            .map_err(|_| format!("Invalid sequence component: {}", parts[2]))?;

        Ok(Self::new(server_id, Timestamp::from_u64(start_ts), seq))
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.server_id,
            self.start_ts.as_u64(),
            self.seq
        )
    }
}

impl PartialOrd for TxnId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TxnId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start_ts
            .cmp(&other.start_ts)
            .then(self.server_id.cmp(&other.server_id))
            .then(self.seq.cmp(&other.seq))
    }
}

macro_rules! sequence_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

sequence_id!(
    /// Identifier of one distributed job.
    JobId,
    "job"
);
sequence_id!(
    /// Identifier of one task (the slice of a job that runs on one node).
    TaskId,
    "task"
);
sequence_id!(
    /// Identifier of one operator instance inside a task.
    VertexId,
    "vertex"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_follows_start_ts() {
        let older = TxnId::new(9, Timestamp::compose(100, 0), 5);
        let younger = TxnId::new(1, Timestamp::compose(100, 1), 0);
        assert!(older < younger);

        // Same timestamp falls back to server then sequence
        let a = TxnId::new(1, Timestamp::compose(100, 0), 0);
        let b = TxnId::new(1, Timestamp::compose(100, 0), 1);
        assert!(a < b);
    }

    #[test]
    fn test_string_roundtrip() {
        let id = TxnId::new(3, Timestamp::compose(123_456, 10), 77);
        let parsed = TxnId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TxnId::parse("nope").is_err());
        assert!(TxnId::parse("1-x-2").is_err());
    }

    #[test]
    fn test_sequence_id_display() {
        assert_eq!(JobId::new(4).to_string(), "job-4");
        assert_eq!(TaskId::new(5).to_string(), "task-5");
        assert_eq!(VertexId::new(6).to_string(), "vertex-6");
        assert_eq!(NodeId::new(2).to_string(), "node-2");
    }
}
