//! Re-arming timers on top of cancellable tasks

use std::future::Future;
use std::time::Duration;

use super::Supervisor;

impl Supervisor {
    /// Run `f` after `interval`, then again after whatever interval it
    /// returns, until it returns [`Duration::ZERO`] or shutdown cancels the
    /// timer. Returns false if the timer could not be scheduled.
    pub fn set_timeout<F, Fut>(&self, interval: Duration, mut f: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Duration> + Send + 'static,
    {
        if interval.is_zero() {
            tracing::warn!("Ignoring timer with zero interval");
            return false;
        }
        tracing::debug!("Timer armed for {:?}", interval);

        self.spawn_cancellable(move |token| async move {
            let mut next = interval;
            while !next.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(next) => {
                        next = f().await;
                    }
                }
            }
        })
    }
}
