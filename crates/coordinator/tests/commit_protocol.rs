//! End-to-end commit protocol behaviour against the in-memory store

use meridian_common::{IsolationLevel, NodeId, Timestamp, TransactionKind};
use meridian_coordinator::{
    ConflictPolicy, Coordinator, CoordinatorConfig, CoordinatorError, ErrorClass, Transaction,
    TransactionStatus,
};
use meridian_store::{MemoryMeta, MemoryStore, RpcKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const TABLE: u64 = 1;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Table split at "k2": k1 lives on node 1, k2 and k3 on node 2
fn setup(config: CoordinatorConfig) -> (Coordinator, Arc<MemoryStore>) {
    init_tracing();
    let meta = Arc::new(MemoryMeta::new());
    meta.create_table(TABLE, &[b"k2".as_slice()], &[NodeId::new(1), NodeId::new(2)]);
    let store = Arc::new(MemoryStore::new(meta.clone()));
    let coordinator = Coordinator::new(config.with_server_id(1), store.clone(), meta).unwrap();
    (coordinator, store)
}

fn sync_config() -> CoordinatorConfig {
    CoordinatorConfig::default().with_async_commit(false)
}

fn optimistic(coordinator: &Coordinator) -> Arc<Transaction> {
    coordinator.begin(TransactionKind::Optimistic, IsolationLevel::SnapshotIsolation)
}

fn write_three(txn: &Transaction) {
    txn.put(TABLE, b"k1".to_vec(), b"v1".to_vec()).unwrap();
    txn.put(TABLE, b"k2".to_vec(), b"v2".to_vec()).unwrap();
    txn.put(TABLE, b"k3".to_vec(), b"v3".to_vec()).unwrap();
}

fn prewrites_touching(store: &MemoryStore, key: &[u8]) -> usize {
    store
        .journal_of(RpcKind::Prewrite)
        .iter()
        .filter(|r| r.touches(key))
        .count()
}

#[tokio::test]
async fn test_primary_commits_before_secondaries() {
    let (coordinator, store) = setup(sync_config());
    let txn = optimistic(&coordinator);
    write_three(&txn);
    txn.commit().await.unwrap();

    assert_eq!(txn.status(), TransactionStatus::Commit);
    let commits = store.journal_of(RpcKind::Commit);
    assert!(commits[0].touches(b"k1"));
    assert!(commits.iter().skip(1).all(|r| !r.touches(b"k1")));

    let commit_ts = txn.commit_ts().unwrap();
    for key in [b"k1", b"k2", b"k3"] {
        assert_eq!(store.commit_ts_of(key, txn.start_ts()), Some(commit_ts));
        assert!(!store.has_lock(key));
    }
    assert_eq!(store.latest_value(b"k3"), Some(b"v3".to_vec()));
    txn.close().await.unwrap();
}

#[tokio::test]
async fn test_async_commit_finishes_secondaries_in_background() {
    let (coordinator, store) = setup(CoordinatorConfig::default());
    let txn = optimistic(&coordinator);
    write_three(&txn);
    txn.commit().await.unwrap();

    // The primary write is visible as soon as commit returns
    assert_eq!(store.latest_value(b"k1"), Some(b"v1".to_vec()));
    txn.join_background().await.unwrap();

    let commits = store.journal_of(RpcKind::Commit);
    assert!(commits[0].touches(b"k1"));
    let start_ts = txn.start_ts();
    assert!(store.locked_keys(start_ts).is_empty());
    assert_eq!(store.latest_value(b"k2"), Some(b"v2".to_vec()));

    let commit_ts = txn.commit_ts().unwrap();
    assert!(commit_ts > start_ts);
    for key in [b"k2", b"k3"] {
        assert_eq!(store.commit_ts_of(key, start_ts), Some(commit_ts));
    }
    txn.close().await.unwrap();
}

#[tokio::test]
async fn test_aborted_background_commit_keeps_primary() {
    let (coordinator, store) = setup(CoordinatorConfig::default());
    let txn = optimistic(&coordinator);
    write_three(&txn);
    txn.commit().await.unwrap();
    let start_ts = txn.start_ts();
    let commit_ts = txn.commit_ts().unwrap();

    txn.abort_background();
    assert!(!txn.abort_background());
    txn.join_background().await.unwrap();
    assert!(txn.background_error().is_none());

    assert_eq!(txn.status(), TransactionStatus::Commit);
    assert_eq!(store.commit_ts_of(b"k1", start_ts), Some(commit_ts));
    // Each secondary either committed or still waits on the primary
    for key in [b"k2", b"k3"] {
        let committed = store.commit_ts_of(key, start_ts) == Some(commit_ts);
        assert!(committed || store.has_lock(key));
    }
    txn.close().await.unwrap();
}

#[tokio::test]
async fn test_region_split_retries_only_the_failed_partition() {
    let (coordinator, store) = setup(sync_config());
    // k2 and k3 are pre-written together; splitting at k3 fails that call
    store.fail_split_before(RpcKind::Prewrite, b"k3".to_vec());

    let txn = optimistic(&coordinator);
    write_three(&txn);
    txn.commit().await.unwrap();

    assert_eq!(prewrites_touching(&store, b"k1"), 1);
    assert_eq!(prewrites_touching(&store, b"k2"), 2);
    assert_eq!(prewrites_touching(&store, b"k3"), 2);
    assert_eq!(store.latest_value(b"k3"), Some(b"v3".to_vec()));
    assert!(store.locked_keys(txn.start_ts()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_writers_conflict_once() {
    let (coordinator, store) = setup(sync_config());
    let a = optimistic(&coordinator);
    let b = optimistic(&coordinator);
    for (txn, value) in [(&a, b"a".to_vec()), (&b, b"b".to_vec())] {
        txn.put(TABLE, b"k1".to_vec(), value.clone()).unwrap();
        txn.put(TABLE, b"k3".to_vec(), value).unwrap();
    }

    let (ra, rb) = tokio::join!(a.commit(), b.commit());
    let failures: Vec<CoordinatorError> = [ra, rb].into_iter().filter_map(|r| r.err()).collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].is_write_conflict());

    let loser = if a.status() == TransactionStatus::Commit { &b } else { &a };
    assert_eq!(loser.status(), TransactionStatus::Rollback);
    assert!(store.locked_keys(loser.start_ts()).is_empty());
    assert_eq!(store.latest_value(b"k1"), store.latest_value(b"k3"));
}

#[tokio::test]
async fn test_cancel_during_prewrite_rolls_back() {
    let (coordinator, store) = setup(sync_config());
    let txn = optimistic(&coordinator);
    write_three(&txn);

    let weak: Weak<_> = Arc::downgrade(&txn);
    store.set_observer(move |record| {
        if record.kind == RpcKind::Prewrite
            && record.touches(b"k3")
            && let Some(txn) = weak.upgrade()
        {
            txn.cancel();
        }
    });

    let err = txn.commit().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Cancelled);
    assert_eq!(txn.status(), TransactionStatus::Cancel);

    let rollbacks = store.journal_of(RpcKind::BatchRollback);
    for key in [b"k1", b"k2", b"k3"] {
        assert!(rollbacks.iter().any(|r| r.touches(key)));
        assert!(!store.has_lock(key));
        assert_eq!(store.latest_value(key), None);
    }
    assert!(store.journal_of(RpcKind::Commit).is_empty());

    // Rolling back again is harmless
    txn.rollback().await.unwrap();
    assert_eq!(txn.status(), TransactionStatus::Cancel);
}

#[tokio::test]
async fn test_cancel_before_commit() {
    let (coordinator, store) = setup(sync_config());
    let txn = optimistic(&coordinator);
    write_three(&txn);
    txn.cancel();

    let err = txn.commit().await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(txn.status(), TransactionStatus::Cancel);
    assert!(store.journal().is_empty());
}

#[tokio::test]
async fn test_single_partition_commits_in_one_phase() {
    let (coordinator, store) = setup(CoordinatorConfig::default());
    let txn = optimistic(&coordinator);
    txn.put(TABLE, b"k2".to_vec(), b"v2".to_vec()).unwrap();
    txn.put(TABLE, b"k3".to_vec(), b"v3".to_vec()).unwrap();
    txn.commit().await.unwrap();

    let one_pc = store.journal_of(RpcKind::OnePc);
    assert_eq!(one_pc.len(), 1);
    assert_eq!(one_pc[0].commit_ts, txn.commit_ts());
    assert!(store.journal_of(RpcKind::Prewrite).is_empty());
    assert!(store.journal_of(RpcKind::Commit).is_empty());
    assert_eq!(store.latest_value(b"k2"), Some(b"v2".to_vec()));
}

#[tokio::test]
async fn test_declined_one_phase_falls_back_to_two_phases() {
    let (coordinator, store) = setup(sync_config());
    store.set_one_pc_enabled(false);

    let txn = optimistic(&coordinator);
    txn.put(TABLE, b"k2".to_vec(), b"v2".to_vec()).unwrap();
    txn.commit().await.unwrap();

    assert_eq!(store.journal_of(RpcKind::OnePc).len(), 1);
    assert_eq!(store.journal_of(RpcKind::Prewrite).len(), 1);
    assert_eq!(store.journal_of(RpcKind::Commit).len(), 1);
    assert_eq!(store.latest_value(b"k2"), Some(b"v2".to_vec()));
}

#[tokio::test]
async fn test_pushed_primary_refreshes_commit_ts() {
    let (coordinator, store) = setup(sync_config());
    let txn = optimistic(&coordinator);
    txn.put(TABLE, b"k1".to_vec(), b"v1".to_vec()).unwrap();
    txn.put(TABLE, b"k3".to_vec(), b"v3".to_vec()).unwrap();

    // A reader a minute ahead pushes the primary lock once it is written
    let weak = Arc::downgrade(&store);
    let fired = AtomicBool::new(false);
    store.set_observer(move |record| {
        if record.kind == RpcKind::Prewrite
            && record.touches(b"k1")
            && record.is_ok()
            && !fired.swap(true, Ordering::SeqCst)
            && let Some(store) = weak.upgrade()
        {
            store.read_at(b"k1", record.start_ts.add_physical_ms(60_000));
        }
    });

    txn.commit().await.unwrap();

    let primary_commits: Vec<_> = store
        .journal_of(RpcKind::Commit)
        .into_iter()
        .filter(|r| r.touches(b"k1"))
        .collect();
    assert_eq!(primary_commits.len(), 2);
    assert!(matches!(
        primary_commits[0].error,
        Some(meridian_store::StoreError::CommitTsExpired { .. })
    ));
    assert!(primary_commits[1].is_ok());

    let commit_ts = txn.commit_ts().unwrap();
    assert!(commit_ts > txn.start_ts().add_physical_ms(60_000));
    assert_eq!(store.commit_ts_of(b"k3", txn.start_ts()), Some(commit_ts));
}

#[tokio::test]
async fn test_insert_of_existing_key_is_duplicate() {
    let (coordinator, _store) = setup(sync_config());
    let first = optimistic(&coordinator);
    first.put(TABLE, b"k1".to_vec(), b"v1".to_vec()).unwrap();
    first.commit().await.unwrap();

    let second = optimistic(&coordinator);
    second.insert(TABLE, b"k1".to_vec(), b"again".to_vec()).unwrap();
    let err = second.commit().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::DuplicateKey);
    assert_eq!(second.status(), TransactionStatus::Rollback);
}

#[tokio::test]
async fn test_pessimistic_residual_locks_are_released() {
    let (coordinator, store) = setup(sync_config());
    let txn = coordinator.begin(TransactionKind::Pessimistic, IsolationLevel::SnapshotIsolation);

    let values = txn
        .lock_for_update(TABLE, &[b"k1".to_vec(), b"k3".to_vec()])
        .await
        .unwrap();
    assert_eq!(values, vec![None, None]);
    assert!(store.has_lock(b"k1") && store.has_lock(b"k3"));

    // Only k1 is written; the lock on k3 is residual
    txn.put(TABLE, b"k1".to_vec(), b"v1".to_vec()).unwrap();
    txn.commit().await.unwrap();

    let released = store.journal_of(RpcKind::PessimisticRollback);
    assert!(released.iter().any(|r| r.touches(b"k3")));
    assert!(store.journal_of(RpcKind::OnePc).is_empty());
    assert!(!store.has_lock(b"k3"));
    assert_eq!(store.latest_value(b"k1"), Some(b"v1".to_vec()));
    assert_eq!(store.latest_value(b"k3"), None);
}

#[tokio::test]
async fn test_pessimistic_lock_wait_times_out() {
    let config = sync_config().with_lock_wait_timeout(Duration::from_millis(50));
    let (coordinator, store) = setup(config);
    let holder = coordinator.begin(TransactionKind::Pessimistic, IsolationLevel::SnapshotIsolation);
    let waiter = coordinator.begin(TransactionKind::Pessimistic, IsolationLevel::SnapshotIsolation);

    holder.lock_for_update(TABLE, &[b"k1".to_vec()]).await.unwrap();
    let err = waiter
        .lock_for_update(TABLE, &[b"k1".to_vec()])
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::LockTimeout);
    assert_eq!(waiter.status(), TransactionStatus::Start);

    // Closing the holder releases its lock
    holder.close().await.unwrap();
    assert!(!store.has_lock(b"k1"));
    waiter.lock_for_update(TABLE, &[b"k1".to_vec()]).await.unwrap();
}

#[tokio::test]
async fn test_conflict_policy() {
    async fn contend(policy: ConflictPolicy) -> (Result<(), CoordinatorError>, Timestamp, Timestamp) {
        let (coordinator, store) = setup(sync_config().with_conflict_policy(policy));
        let early = optimistic(&coordinator);
        let late = optimistic(&coordinator);
        late.put(TABLE, b"k1".to_vec(), b"late".to_vec()).unwrap();
        late.put(TABLE, b"k3".to_vec(), b"late".to_vec()).unwrap();

        early.put(TABLE, b"k1".to_vec(), b"early".to_vec()).unwrap();
        early.commit().await.unwrap();
        assert_eq!(store.latest_value(b"k1"), Some(b"early".to_vec()));

        let first_start = late.start_ts();
        let result = late.commit().await;
        // The id keeps the start timestamp it was issued with
        assert_eq!(late.id().start_ts, first_start);
        (result, first_start, late.start_ts())
    }

    let (result, first, last) = contend(ConflictPolicy::Abort).await;
    assert!(result.unwrap_err().is_write_conflict());
    assert_eq!(first, last);

    let (result, first, last) = contend(ConflictPolicy::Retry { max_attempts: 2 }).await;
    result.unwrap();
    assert!(last > first);
}

#[tokio::test]
async fn test_read_isolation_levels() {
    let (coordinator, _store) = setup(sync_config());
    let snapshot = coordinator.begin(TransactionKind::Optimistic, IsolationLevel::SnapshotIsolation);
    let committed = coordinator.begin(TransactionKind::Optimistic, IsolationLevel::ReadCommitted);

    let writer = optimistic(&coordinator);
    writer.put(TABLE, b"k2".to_vec(), b"new".to_vec()).unwrap();
    writer.commit().await.unwrap();

    assert_eq!(snapshot.get(TABLE, b"k2").await.unwrap(), None);
    assert_eq!(committed.get(TABLE, b"k2").await.unwrap(), Some(b"new".to_vec()));

    // Buffered writes shadow storage
    snapshot.delete(TABLE, b"k2".to_vec()).unwrap();
    assert_eq!(snapshot.get(TABLE, b"k2").await.unwrap(), None);
    committed.put(TABLE, b"k2".to_vec(), b"mine".to_vec()).unwrap();
    assert_eq!(committed.get(TABLE, b"k2").await.unwrap(), Some(b"mine".to_vec()));
}

#[tokio::test]
async fn test_read_only_commit_writes_nothing() {
    let (coordinator, store) = setup(sync_config());
    let txn = optimistic(&coordinator);
    assert_eq!(txn.get(TABLE, b"k1").await.unwrap(), None);
    txn.commit().await.unwrap();

    assert_eq!(txn.status(), TransactionStatus::Commit);
    assert_eq!(txn.commit_ts(), None);
    assert!(store.journal_of(RpcKind::Prewrite).is_empty());
    assert!(store.journal_of(RpcKind::Commit).is_empty());
}

#[tokio::test]
async fn test_registry_follows_lifecycle() {
    let (coordinator, _store) = setup(sync_config());
    let txn = optimistic(&coordinator);
    let id = txn.id();

    assert_eq!(coordinator.active_transactions(), 1);
    assert!(coordinator.find(&id.to_string()).is_ok());

    txn.close().await.unwrap();
    txn.close().await.unwrap();
    assert_eq!(txn.status(), TransactionStatus::Close);
    assert!(coordinator.lookup(id).is_none());
    assert!(matches!(
        coordinator.find(&id.to_string()),
        Err(CoordinatorError::TransactionNotFound(_))
    ));
    assert!(coordinator.find("not-an-id").is_err());

    // A closed transaction accepts nothing
    assert!(matches!(
        txn.put(TABLE, b"k1".to_vec(), b"v".to_vec()),
        Err(CoordinatorError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_rollback_rules() {
    let (coordinator, store) = setup(sync_config());
    let txn = optimistic(&coordinator);
    txn.put(TABLE, b"k1".to_vec(), b"v1".to_vec()).unwrap();
    txn.rollback().await.unwrap();
    txn.rollback().await.unwrap();
    assert_eq!(txn.status(), TransactionStatus::Rollback);
    assert!(txn.commit().await.is_err());
    assert!(store.journal().is_empty());

    let committed = optimistic(&coordinator);
    committed.put(TABLE, b"k1".to_vec(), b"v1".to_vec()).unwrap();
    committed.commit().await.unwrap();
    assert!(matches!(
        committed.rollback().await,
        Err(CoordinatorError::InvalidState(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_waits_for_running_commit() {
    let config = sync_config().with_lock_wait_timeout(Duration::from_millis(200));
    let (coordinator, store) = setup(config);
    let holder = coordinator.begin(TransactionKind::Pessimistic, IsolationLevel::SnapshotIsolation);
    let waiter = coordinator.begin(TransactionKind::Pessimistic, IsolationLevel::SnapshotIsolation);
    holder.lock_for_update(TABLE, &[b"k1".to_vec()]).await.unwrap();

    waiter.put(TABLE, b"k1".to_vec(), b"v1".to_vec()).unwrap();
    waiter.put(TABLE, b"k3".to_vec(), b"v3".to_vec()).unwrap();
    let committing = {
        let waiter = waiter.clone();
        tokio::spawn(async move { waiter.commit().await })
    };
    // The commit blocks on the holder's lock on k1
    for _ in 0..100 {
        if waiter.status().is_committing() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(waiter.status().is_committing());

    waiter.close().await.unwrap();
    assert_eq!(waiter.status(), TransactionStatus::Close);
    assert!(committing.await.unwrap().is_err());
    assert_eq!(waiter.status(), TransactionStatus::Close);
    assert!(waiter.commit().await.is_err());

    assert!(coordinator.lookup(waiter.id()).is_none());
    assert!(!store.has_lock(b"k3"));
    assert!(store.has_lock(b"k1"));
    holder.close().await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_everything() {
    let (coordinator, store) = setup(sync_config());
    let pessimistic = coordinator.begin(TransactionKind::Pessimistic, IsolationLevel::SnapshotIsolation);
    pessimistic.lock_for_update(TABLE, &[b"k2".to_vec()]).await.unwrap();
    let _idle = optimistic(&coordinator);

    coordinator.stop().await;
    assert_eq!(coordinator.active_transactions(), 0);
    assert!(!store.has_lock(b"k2"));
    assert_eq!(pessimistic.status(), TransactionStatus::Close);
}
