//! Behaviour of the in-memory storage primitives

use meridian_common::{Mutation, NodeId, Timestamp};
use meridian_store::{
    AsyncCommitParams, BatchRollbackRequest, CommitRequest, HeartBeatRequest, MemoryMeta,
    MemoryStore, MetaService, OnePcOutcome, PartitionDescriptor, PessimisticLockRequest,
    PessimisticRollbackRequest, PrewriteRequest, RpcKind, StoreError, StoreService,
};
use std::sync::Arc;
use std::time::Duration;

const TABLE: u64 = 1;

fn setup() -> (Arc<MemoryStore>, PartitionDescriptor) {
    let meta = Arc::new(MemoryMeta::new());
    let parts = meta.create_table(TABLE, &[], &[NodeId::new(1)]);
    (Arc::new(MemoryStore::new(meta)), parts[0].clone())
}

fn ts(n: u64) -> Timestamp {
    Timestamp::from_u64(n)
}

fn prewrite_req(start: u64, mutations: Vec<Mutation>) -> PrewriteRequest {
    PrewriteRequest {
        start_ts: ts(start),
        primary: mutations[0].key.clone(),
        mutations,
        lock_ttl_ms: 3000,
        for_update_ts: None,
        async_commit: None,
    }
}

#[tokio::test]
async fn test_prewrite_commit_read() {
    let (store, part) = setup();
    let ctx = part.region_ctx();

    store
        .prewrite(&ctx, prewrite_req(10, vec![Mutation::put(b"k1".to_vec(), b"v1".to_vec())]))
        .await
        .unwrap();
    assert!(store.has_lock(b"k1"));
    // Uncommitted data is invisible
    assert_eq!(store.get(&ctx, b"k1", ts(100)).await.unwrap(), None);

    store
        .commit(
            &ctx,
            CommitRequest {
                start_ts: ts(10),
                commit_ts: ts(20),
                keys: vec![b"k1".to_vec()],
            },
        )
        .await
        .unwrap_err();

    // The read at 100 pushed the lock's minimum commit timestamp past it
    store
        .commit(
            &ctx,
            CommitRequest {
                start_ts: ts(10),
                commit_ts: ts(101),
                keys: vec![b"k1".to_vec()],
            },
        )
        .await
        .unwrap();

    assert!(!store.has_lock(b"k1"));
    assert_eq!(store.get(&ctx, b"k1", ts(100)).await.unwrap(), None);
    assert_eq!(
        store.get(&ctx, b"k1", ts(101)).await.unwrap(),
        Some(b"v1".to_vec())
    );
    assert_eq!(store.commit_ts_of(b"k1", ts(10)), Some(ts(101)));
}

#[tokio::test]
async fn test_commit_ts_expired() {
    let (store, part) = setup();
    let ctx = part.region_ctx();

    store
        .prewrite(&ctx, prewrite_req(10, vec![Mutation::put(b"k1".to_vec(), b"v1".to_vec())]))
        .await
        .unwrap();
    store.get(&ctx, b"k1", ts(50)).await.unwrap();

    let err = store
        .commit(
            &ctx,
            CommitRequest {
                start_ts: ts(10),
                commit_ts: ts(40),
                keys: vec![b"k1".to_vec()],
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::CommitTsExpired {
            key: b"k1".to_vec(),
            commit_ts: ts(40),
            min_commit_ts: ts(51),
        }
    );
}

#[tokio::test]
async fn test_write_conflict_on_foreign_lock_and_newer_commit() {
    let (store, part) = setup();
    let ctx = part.region_ctx();

    store
        .prewrite(&ctx, prewrite_req(10, vec![Mutation::put(b"k".to_vec(), b"a".to_vec())]))
        .await
        .unwrap();

    let err = store
        .prewrite(&ctx, prewrite_req(11, vec![Mutation::put(b"k".to_vec(), b"b".to_vec())]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::WriteConflict { conflict_start_ts, .. } if conflict_start_ts == ts(10)));

    store
        .commit(
            &ctx,
            CommitRequest {
                start_ts: ts(10),
                commit_ts: ts(15),
                keys: vec![b"k".to_vec()],
            },
        )
        .await
        .unwrap();

    // A transaction that started before the commit can no longer write the key
    let err = store
        .prewrite(&ctx, prewrite_req(12, vec![Mutation::put(b"k".to_vec(), b"c".to_vec())]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::WriteConflict { conflict_commit_ts, .. } if conflict_commit_ts == ts(15)));

    // Nothing of the failed pre-write was written
    assert!(!store.has_lock(b"k"));
}

#[tokio::test]
async fn test_prewrite_is_idempotent() {
    let (store, part) = setup();
    let ctx = part.region_ctx();
    let request = prewrite_req(10, vec![Mutation::put(b"k".to_vec(), b"v".to_vec())]);

    store.prewrite(&ctx, request.clone()).await.unwrap();
    store.prewrite(&ctx, request).await.unwrap();
    assert_eq!(store.locked_keys(ts(10)), vec![b"k".to_vec()]);
}

#[tokio::test]
async fn test_duplicate_entry() {
    let (store, part) = setup();
    let ctx = part.region_ctx();

    let outcome = store
        .one_pc(&ctx, prewrite_req(10, vec![Mutation::put(b"k".to_vec(), b"v".to_vec())]))
        .await
        .unwrap();
    assert!(matches!(outcome, OnePcOutcome::Committed { .. }));

    let err = store
        .prewrite(&ctx, prewrite_req(30, vec![Mutation::insert(b"k".to_vec(), b"w".to_vec())]))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::DuplicateEntry { key: b"k".to_vec() });
}

#[tokio::test]
async fn test_one_pc_declined_when_disabled() {
    let (store, part) = setup();
    let ctx = part.region_ctx();
    store.set_one_pc_enabled(false);

    let outcome = store
        .one_pc(&ctx, prewrite_req(10, vec![Mutation::put(b"k".to_vec(), b"v".to_vec())]))
        .await
        .unwrap();
    assert_eq!(outcome, OnePcOutcome::NeedsTwoPc);
    assert!(!store.has_lock(b"k"));
    assert_eq!(store.latest_value(b"k"), None);
}

#[tokio::test]
async fn test_rollback_idempotent_and_blocks_late_prewrite() {
    let (store, part) = setup();
    let ctx = part.region_ctx();
    let keys = vec![b"k1".to_vec(), b"k2".to_vec()];

    store
        .prewrite(&ctx, prewrite_req(10, vec![Mutation::put(b"k1".to_vec(), b"v".to_vec())]))
        .await
        .unwrap();

    let rollback = BatchRollbackRequest {
        start_ts: ts(10),
        keys: keys.clone(),
    };
    store.batch_rollback(&ctx, rollback.clone()).await.unwrap();
    store.batch_rollback(&ctx, rollback).await.unwrap();
    assert!(store.locked_keys(ts(10)).is_empty());

    // k2 was never written but the rollback record refuses a delayed pre-write
    let err = store
        .prewrite(&ctx, prewrite_req(10, vec![Mutation::put(b"k2".to_vec(), b"v".to_vec())]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyRolledBack { .. }));
}

#[tokio::test]
async fn test_rollback_after_commit_is_refused() {
    let (store, part) = setup();
    let ctx = part.region_ctx();

    store
        .prewrite(&ctx, prewrite_req(10, vec![Mutation::put(b"k".to_vec(), b"v".to_vec())]))
        .await
        .unwrap();
    store
        .commit(
            &ctx,
            CommitRequest {
                start_ts: ts(10),
                commit_ts: ts(20),
                keys: vec![b"k".to_vec()],
            },
        )
        .await
        .unwrap();

    let err = store
        .batch_rollback(
            &ctx,
            BatchRollbackRequest {
                start_ts: ts(10),
                keys: vec![b"k".to_vec()],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyCommitted { commit_ts, .. } if commit_ts == ts(20)));
}

#[tokio::test]
async fn test_async_commit_min_commit_ts_and_secondaries() {
    let (store, part) = setup();
    let ctx = part.region_ctx();
    store.get(&ctx, b"other", ts(90)).await.unwrap();

    let mut request = prewrite_req(
        10,
        vec![
            Mutation::put(b"p".to_vec(), b"1".to_vec()),
            Mutation::put(b"s".to_vec(), b"2".to_vec()),
        ],
    );
    request.async_commit = Some(AsyncCommitParams {
        min_commit_ts: ts(50),
        secondaries: vec![b"s".to_vec()],
    });

    let response = store.prewrite(&ctx, request).await.unwrap();
    // Bounded below by the highest read timestamp seen
    assert_eq!(response.min_commit_ts, Some(ts(91)));

    let primary = store.lock_of(b"p").unwrap();
    assert!(primary.use_async_commit);
    assert_eq!(primary.secondaries, vec![b"s".to_vec()]);
    assert!(store.lock_of(b"s").unwrap().secondaries.is_empty());
}

#[tokio::test]
async fn test_pessimistic_lock_wait_timeout() {
    let (store, part) = setup();
    let ctx = part.region_ctx();

    let lock = |start: u64, wait_ms: u64| PessimisticLockRequest {
        start_ts: ts(start),
        for_update_ts: ts(start),
        primary: b"k".to_vec(),
        keys: vec![b"k".to_vec()],
        lock_ttl_ms: 3000,
        wait_timeout: Duration::from_millis(wait_ms),
    };

    let response = store.pessimistic_lock(&ctx, lock(10, 0)).await.unwrap();
    assert!(response.locked);
    assert_eq!(response.prior_values, vec![None]);

    let err = store.pessimistic_lock(&ctx, lock(20, 20)).await.unwrap_err();
    assert_eq!(
        err,
        StoreError::LockWaitTimeout {
            key: b"k".to_vec(),
            lock_ts: ts(10),
        }
    );
}

#[tokio::test]
async fn test_pessimistic_lock_waits_for_release() {
    let (store, part) = setup();
    let ctx = part.region_ctx();

    store
        .pessimistic_lock(
            &ctx,
            PessimisticLockRequest {
                start_ts: ts(10),
                for_update_ts: ts(10),
                primary: b"k".to_vec(),
                keys: vec![b"k".to_vec()],
                lock_ttl_ms: 3000,
                wait_timeout: Duration::ZERO,
            },
        )
        .await
        .unwrap();

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .pessimistic_lock(
                    &ctx,
                    PessimisticLockRequest {
                        start_ts: ts(20),
                        for_update_ts: ts(20),
                        primary: b"k".to_vec(),
                        keys: vec![b"k".to_vec()],
                        lock_ttl_ms: 3000,
                        wait_timeout: Duration::from_secs(5),
                    },
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    store
        .pessimistic_rollback(
            &ctx,
            PessimisticRollbackRequest {
                start_ts: ts(10),
                for_update_ts: ts(10),
                keys: vec![b"k".to_vec()],
            },
        )
        .await
        .unwrap();

    let response = waiter.await.unwrap().unwrap();
    assert!(response.locked);
    assert_eq!(store.lock_of(b"k").unwrap().start_ts, ts(20));
}

#[tokio::test]
async fn test_heart_beat_extends_ttl() {
    let (store, part) = setup();
    let ctx = part.region_ctx();
    store
        .prewrite(&ctx, prewrite_req(10, vec![Mutation::put(b"p".to_vec(), b"v".to_vec())]))
        .await
        .unwrap();

    let ttl = store
        .txn_heart_beat(
            &ctx,
            HeartBeatRequest {
                primary: b"p".to_vec(),
                start_ts: ts(10),
                advise_ttl_ms: 9000,
            },
        )
        .await
        .unwrap();
    assert_eq!(ttl, 9000);

    let err = store
        .txn_heart_beat(
            &ctx,
            HeartBeatRequest {
                primary: b"p".to_vec(),
                start_ts: ts(11),
                advise_ttl_ms: 9000,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::TxnNotFound { .. }));
}

#[tokio::test]
async fn test_split_fail_point() {
    let (store, part) = setup();
    let ctx = part.region_ctx();
    store.fail_split_before(RpcKind::Prewrite, b"m".to_vec());

    let err = store
        .prewrite(
            &ctx,
            prewrite_req(
                10,
                vec![
                    Mutation::put(b"a".to_vec(), b"1".to_vec()),
                    Mutation::put(b"m".to_vec(), b"2".to_vec()),
                ],
            ),
        )
        .await
        .unwrap_err();
    assert!(err.is_region_split());

    let left = store.meta().locate(TABLE, b"a").unwrap();
    let right = store.meta().locate(TABLE, b"m").unwrap();
    assert_ne!(left.part, right.part);

    // Fresh routing succeeds
    store
        .prewrite(
            &left.region_ctx(),
            prewrite_req(10, vec![Mutation::put(b"a".to_vec(), b"1".to_vec())]),
        )
        .await
        .unwrap();
    store
        .prewrite(
            &right.region_ctx(),
            prewrite_req(10, vec![Mutation::put(b"m".to_vec(), b"2".to_vec())]),
        )
        .await
        .unwrap();

    let prewrites = store.journal_of(RpcKind::Prewrite);
    assert_eq!(prewrites.len(), 3);
    assert!(!prewrites[0].is_ok());
    assert!(prewrites[1].is_ok() && prewrites[2].is_ok());
}
