//! Primary lock keep-alive
//!
//! While a commit is in flight the primary lock's TTL is extended on an
//! interval so concurrent readers do not resolve it as abandoned. The loop
//! stops when the handle is dropped, the transaction is cancelled, or the
//! primary lock is gone.

use crate::cancel::CancelToken;
use crate::error::CoordinatorError;
use crate::two_phase::TwoPhaseCommitExecutor;
use meridian_common::{Key, Timestamp, TxnId, TxnPartData};
use meridian_store::StoreError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, warn};

/// Primary lock being kept alive
pub(crate) struct HeartbeatTarget {
    pub txn_id: TxnId,
    pub part: TxnPartData,
    pub primary: Key,
    pub start_ts: Timestamp,
    pub lock_ttl_ms: u64,
}

/// Running heartbeat; aborted on drop
pub(crate) struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Start the heartbeat task
    pub fn start(
        executor: Arc<TwoPhaseCommitExecutor>,
        target: HeartbeatTarget,
        interval: Duration,
        cancel: CancelToken,
    ) -> Self {
        let span = info_span!("heartbeat", txn_id = %target.txn_id);
        let handle = tokio::spawn(
            async move {
                let started = Instant::now();
                let mut ticker = tokio::time::interval(interval);
                // The first tick completes immediately
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = cancel.cancelled() => {
                            debug!("transaction cancelled, stopping heartbeat");
                            return;
                        }
                    }

                    let advise_ttl_ms = started.elapsed().as_millis() as u64 + target.lock_ttl_ms;
                    match executor
                        .heart_beat(target.part, target.primary.clone(), target.start_ts, advise_ttl_ms)
                        .await
                    {
                        Ok(ttl) => debug!(ttl, "primary lock TTL extended"),
                        Err(CoordinatorError::Store(StoreError::TxnNotFound { .. })) => {
                            debug!("primary lock gone, stopping heartbeat");
                            return;
                        }
                        Err(err) => warn!(error = %err, "failed to send heartbeat"),
                    }
                }
            }
            .instrument(span),
        );
        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::two_phase::TwoPhaseCommitData;
    use meridian_common::{IsolationLevel, Mutation, NodeId, TransactionKind};
    use meridian_store::{MemoryMeta, MemoryStore, RpcKind};

    fn setup() -> (Arc<MemoryStore>, Arc<TwoPhaseCommitExecutor>, TxnPartData) {
        let meta = Arc::new(MemoryMeta::new());
        let parts = meta.create_table(1, &[], &[NodeId::new(1)]);
        let store = Arc::new(MemoryStore::new(meta.clone()));
        let executor = Arc::new(TwoPhaseCommitExecutor::new(store.clone(), meta, 8));
        (store, executor, parts[0].part)
    }

    fn target(part: TxnPartData) -> HeartbeatTarget {
        HeartbeatTarget {
            txn_id: TxnId::new(1, Timestamp::from_u64(10), 0),
            part,
            primary: b"k1".to_vec(),
            start_ts: Timestamp::from_u64(10),
            lock_ttl_ms: 100,
        }
    }

    #[tokio::test]
    async fn test_extends_primary_lock_ttl() {
        let (store, executor, part) = setup();
        let data = TwoPhaseCommitData::new(
            Timestamp::from_u64(10),
            TransactionKind::Optimistic,
            IsolationLevel::SnapshotIsolation,
            part,
            b"k1".to_vec(),
            Vec::new(),
        )
        .with_lock_ttl(100);
        executor
            .prewrite(&data, part, vec![Mutation::put(b"k1".to_vec(), b"v".to_vec())])
            .await
            .unwrap();

        let heartbeat = Heartbeat::start(
            executor,
            target(part),
            Duration::from_millis(10),
            CancelToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(heartbeat);

        assert!(!store.journal_of(RpcKind::HeartBeat).is_empty());
        assert!(store.lock_of(b"k1").unwrap().ttl_ms > 100);
    }

    #[tokio::test]
    async fn test_stops_when_primary_lock_is_gone() {
        let (store, executor, part) = setup();
        let heartbeat = Heartbeat::start(
            executor,
            target(part),
            Duration::from_millis(5),
            CancelToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One failed attempt, then the loop exited on its own
        assert_eq!(store.journal_of(RpcKind::HeartBeat).len(), 1);
        assert!(heartbeat.handle.is_finished());
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let (_store, executor, part) = setup();
        let cancel = CancelToken::new();
        let heartbeat = Heartbeat::start(executor, target(part), Duration::from_secs(60), cancel.clone());
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(heartbeat.handle.is_finished());
    }
}
