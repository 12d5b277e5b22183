//! Hybrid logical clock handing out start and commit timestamps
//!
//! The clock keeps the last issued timestamp packed in one atomic. A new
//! timestamp takes the wall clock when it moved forward and otherwise bumps
//! the logical part, so timestamps from one authority are strictly
//! increasing even under concurrent callers.

use meridian_common::{Timestamp, TxnId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct TimestampAuthority {
    server_id: u64,
    last: AtomicU64,
    next_seq: AtomicU64,
}

impl TimestampAuthority {
    pub fn new(server_id: u64) -> Self {
        Self {
            server_id,
            last: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    /// A timestamp greater than every one issued or observed so far.
    pub fn now(&self) -> Timestamp {
        let wall = Timestamp::compose(Self::physical_now(), 0).as_u64();
        let mut issued = 0;
        // The closure never returns None, so the update always succeeds
        let _ = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                issued = wall.max(last + 1);
                Some(issued)
            });
        Timestamp::from_u64(issued)
    }

    /// Observe a timestamp issued elsewhere; later calls to [`now`] exceed it.
    ///
    /// [`now`]: TimestampAuthority::now
    pub fn update(&self, received: Timestamp) {
        self.last.fetch_max(received.as_u64(), Ordering::SeqCst);
    }

    /// A fresh timestamp strictly greater than `ts`.
    pub fn next_after(&self, ts: Timestamp) -> Timestamp {
        self.update(ts);
        self.now()
    }

    /// New transaction id embedding `start_ts`
    pub fn next_txn_id(&self, start_ts: Timestamp) -> TxnId {
        TxnId::new(
            self.server_id,
            start_ts,
            self.next_seq.fetch_add(1, Ordering::SeqCst),
        )
    }

    fn physical_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}
