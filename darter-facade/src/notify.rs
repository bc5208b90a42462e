//! Level-triggered one-shot notification with timed waits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// A latch that stays fired once triggered.
///
/// Background fibers use this as their termination signal: the owner fires it
/// during shutdown and the fiber's periodic `wait_for` returns `true`.
#[derive(Debug, Default)]
pub struct Done {
    fired: AtomicBool,
    notify: Notify,
}

impl Done {
    /// Creates an unfired latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the latch and wakes all waiters. Idempotent.
    pub fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Returns whether the latch fired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Waits until the latch fires.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }

    /// Waits up to `timeout` for the latch.
    ///
    /// Returns `true` when fired, `false` on timeout.
    pub async fn wait_for(&self, timeout: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent fire cannot slip
        // between the check and the await.
        notified.as_mut().enable();
        if self.is_fired() {
            return true;
        }
        match tokio::time::timeout(timeout, notified).await {
            Ok(()) => true,
            Err(_) => self.is_fired(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Done;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;

    #[rstest]
    fn wait_times_out_when_not_fired() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime must build");
        let done = Done::new();
        let fired = runtime.block_on(done.wait_for(Duration::from_millis(5)));
        assert_that!(fired, eq(false));
    }

    #[rstest]
    fn fire_wakes_pending_waiter_and_stays_fired() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime must build");
        let done = Arc::new(Done::new());
        let waiter = Arc::clone(&done);
        let fired = runtime.block_on(async move {
            let wait = tokio::task::spawn(async move {
                waiter.wait_for(Duration::from_secs(5)).await
            });
            done.fire();
            wait.await.expect("waiter task must finish")
        });
        assert_that!(fired, eq(true));
    }

    #[rstest]
    fn already_fired_latch_returns_immediately() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime must build");
        let done = Done::new();
        done.fire();
        assert_that!(done.is_fired(), eq(true));
        let fired = runtime.block_on(done.wait_for(Duration::from_millis(1)));
        assert_that!(fired, eq(true));
    }
}
