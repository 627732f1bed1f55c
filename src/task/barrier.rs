//! Exit barrier for coordinated teardown of several tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

struct BarrierInner {
    count: AtomicUsize,
    notify: Notify,
}

/// Shared reference counter of tasks that must tear down together.
///
/// A task registers when it starts. If it is stopped by cancellation it
/// arrives (decrements) and waits for the count to reach zero before running
/// its final teardown; any other exit just leaves without waiting, so the
/// count only ever reflects live members.
#[derive(Clone)]
pub struct ExitBarrier {
    inner: Arc<BarrierInner>,
}

impl ExitBarrier {
    /// Create an empty barrier.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BarrierInner {
                count: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Number of members that have not yet arrived or left.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Add one member.
    pub fn register(&self) {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove one member without waiting for the others.
    pub fn leave(&self) {
        let _ = self
            .inner
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.inner.notify.notify_waiters();
    }

    /// Remove one member, then wait until every member has arrived or left.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn arrive_and_wait(&self, timeout: Duration) -> bool {
        self.leave();
        tokio::time::timeout(timeout, self.drained()).await.is_ok()
    }

    async fn drained(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ExitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExitBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitBarrier")
            .field("count", &self.count())
            .finish()
    }
}
