//! Rows flowing along edges

use meridian_common::{Key, Mutation, TxnPartData};

/// One row pushed between vertices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tuple {
    /// A buffered mutation bound for a partition
    Mutation { part: TxnPartData, mutation: Mutation },
    /// A bare key of a partition (commit, rollback, cleanup)
    Key { part: TxnPartData, key: Key },
    /// Number of rows an upstream vertex processed
    Count(u64),
}

impl Tuple {
    pub fn part(&self) -> Option<TxnPartData> {
        match self {
            Tuple::Mutation { part, .. } | Tuple::Key { part, .. } => Some(*part),
            Tuple::Count(_) => None,
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Tuple::Mutation { mutation, .. } => Some(&mutation.key),
            Tuple::Key { key, .. } => Some(key),
            Tuple::Count(_) => None,
        }
    }
}

/// Batch of rows, the unit of a push
pub type Batch = Vec<Tuple>;
