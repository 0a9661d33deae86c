//! Shutdown state and drain watchdog

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::Supervisor;
use crate::config::ShutdownConfig;

/// One-way stop flag plus descriptions of operations that may hold up a
/// shutdown.
#[derive(Clone, Default)]
pub struct ShutdownState {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    stopped: AtomicBool,
    exit: CancellationToken,
    next_check: AtomicU64,
    checks: Mutex<HashMap<u64, String>>,
}

/// Removes its slow-operation entry when dropped
pub struct StopCheckGuard {
    state: ShutdownState,
    id: u64,
}

impl Drop for StopCheckGuard {
    fn drop(&mut self) {
        self.state.remove_stop_check(self.id);
    }
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.is_stopped()
    }

    /// Flip the stop flag. Returns true only for the caller that flipped it.
    pub fn begin(&self) -> bool {
        self.inner
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Wake whoever waits in [`ShutdownState::exit_requested`]
    pub fn request_exit(&self) {
        self.inner.exit.cancel();
    }

    pub async fn exit_requested(&self) {
        self.inner.exit.cancelled().await;
    }

    /// Register a description of a long-running operation
    pub fn add_stop_check(&self, description: impl Into<String>) -> u64 {
        let id = self.inner.next_check.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut checks) = self.inner.checks.lock() {
            checks.insert(id, description.into());
        }
        id
    }

    pub fn remove_stop_check(&self, id: u64) {
        if let Ok(mut checks) = self.inner.checks.lock() {
            checks.remove(&id);
        }
    }

    /// Register a slow operation for as long as the guard lives
    pub fn stop_check(&self, description: impl Into<String>) -> StopCheckGuard {
        StopCheckGuard {
            id: self.add_stop_check(description),
            state: self.clone(),
        }
    }

    pub fn pending_checks(&self) -> Vec<String> {
        self.inner
            .checks
            .lock()
            .map(|checks| checks.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Poll until every supervised task has finished. Every
/// `stall_report_polls` polls, log what is still registered as slow; never
/// give up. Returns the number of stall reports emitted.
pub async fn drain(supervisor: &Supervisor, state: &ShutdownState, config: &ShutdownConfig) -> u32 {
    let interval = Duration::from_millis(config.poll_interval_ms.max(1));
    let mut polls = 0u32;
    let mut reports = 0u32;

    while !supervisor.is_idle() {
        tokio::time::sleep(interval).await;
        polls += 1;
        if polls >= config.stall_report_polls {
            for description in state.pending_checks() {
                tracing::error!("Server stop timeout: {}", description);
            }
            tracing::warn!(
                "Still waiting for {} tasks to finish",
                supervisor.active_tasks()
            );
            reports += 1;
            polls = 0;
        }
    }

    reports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_is_one_way() {
        let state = ShutdownState::new();
        assert!(state.is_running());
        assert!(state.begin());
        assert!(!state.begin());
        assert!(state.is_stopped());
    }

    #[test]
    fn test_stop_check_guard() {
        let state = ShutdownState::new();
        let id = state.add_stop_check("flush journal");
        {
            let _guard = state.stop_check("msgque listen");
            assert_eq!(state.pending_checks().len(), 2);
        }
        assert_eq!(state.pending_checks(), vec!["flush journal".to_string()]);
        state.remove_stop_check(id);
        assert!(state.pending_checks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_reports_stalls_and_keeps_waiting() {
        let supervisor = Supervisor::new();
        let state = ShutdownState::new();
        let config = ShutdownConfig {
            poll_interval_ms: 1,
            stall_report_polls: 10,
        };

        let guard = state.stop_check("slow flush");
        supervisor.spawn(async move {
            tokio::time::sleep(Duration::from_millis(35)).await;
            drop(guard);
        });

        let reports = drain(&supervisor, &state, &config).await;
        assert!(reports >= 2);
        assert!(supervisor.is_idle());
        assert!(state.pending_checks().is_empty());
    }

    #[tokio::test]
    async fn test_exit_request_wakes_waiter() {
        let state = ShutdownState::new();
        let waiter = state.clone();
        let handle = tokio::spawn(async move { waiter.exit_requested().await });
        state.request_exit();
        handle.await.unwrap();
    }
}
