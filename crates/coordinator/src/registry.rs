//! Process-wide map of live transactions

use crate::transaction::Transaction;
use dashmap::DashMap;
use meridian_common::TxnId;
use std::sync::Arc;

/// Live transactions by id; entries are removed when a transaction closes.
#[derive(Default)]
pub struct TxnRegistry {
    txns: DashMap<TxnId, Arc<Transaction>>,
}

impl TxnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, txn: Arc<Transaction>) {
        self.txns.insert(txn.id(), txn);
    }

    pub fn get(&self, id: &TxnId) -> Option<Arc<Transaction>> {
        self.txns.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &TxnId) -> Option<Arc<Transaction>> {
        self.txns.remove(id).map(|(_, txn)| txn)
    }

    /// Every live transaction, in no particular order
    pub fn snapshot(&self) -> Vec<Arc<Transaction>> {
        self.txns.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }
}
