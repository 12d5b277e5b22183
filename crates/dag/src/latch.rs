//! Countdown barrier joining the source workers of a task

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Debug)]
pub struct CountDownLatch {
    count: AtomicUsize,
    notify: Notify,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn count_down(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.notify.notify_waiters();
        }
    }

    /// Wait until the count reaches zero
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_releases_at_zero() {
        let latch = Arc::new(CountDownLatch::new(3));
        let mut workers = Vec::new();
        for _ in 0..3 {
            let latch = latch.clone();
            workers.push(tokio::spawn(async move { latch.count_down() }));
        }
        latch.wait().await;
        assert_eq!(latch.count(), 0);

        // Extra count downs saturate
        latch.count_down();
        assert_eq!(latch.count(), 0);
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_zero_latch_is_open() {
        CountDownLatch::new(0).wait().await;
    }
}
