//! Process-scoped context
//!
//! The [`Context`] owns everything that is shared between queues: the
//! configuration, the task supervisor, the shutdown state, the connection
//! registry and the UDP session registry. It is cheap to clone and is
//! threaded through every constructor instead of living in globals.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use super::{drain, Registry, ShutdownState, Stat, Supervisor};
use crate::config::Config;
use crate::network::QueueRef;

/// Application callback run after shutdown completes
pub type AtExit = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: Config,
    supervisor: Supervisor,
    shutdown: ShutdownState,
    /// Every live queue by id
    queues: Registry<u32>,
    /// UDP virtual sessions by remote address
    udp_sessions: Registry<String>,
    next_queue_id: AtomicU32,
    epoch: Instant,
    start_time: AtomicU64,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                config,
                supervisor: Supervisor::new(),
                shutdown: ShutdownState::new(),
                queues: Registry::default(),
                udp_sessions: Registry::default(),
                next_queue_id: AtomicU32::new(0),
                epoch: Instant::now(),
                start_time: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    pub fn shutdown(&self) -> &ShutdownState {
        &self.inner.shutdown
    }

    pub fn queues(&self) -> &Registry<u32> {
        &self.inner.queues
    }

    pub fn udp_sessions(&self) -> &Registry<String> {
        &self.inner.udp_sessions
    }

    /// Look up a live queue by id
    pub fn queue(&self, id: u32) -> Option<QueueRef> {
        self.inner.queues.get(&id)
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.shutdown.is_stopped()
    }

    /// Next queue id; ids start at 1 and are never reused
    pub(crate) fn next_queue_id(&self) -> u32 {
        self.inner.next_queue_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Milliseconds since the context was created
    pub fn now_millis(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }

    pub fn stats(&self) -> Stat {
        let supervisor = &self.inner.supervisor;
        Stat {
            task_count: supervisor.active_tasks(),
            queue_count: self.inner.queues.len(),
            udp_session_count: self.inner.udp_sessions.len(),
            start_time: self.inner.start_time.load(Ordering::Acquire),
            last_panic: supervisor.last_panic(),
            panic_count: supervisor.panic_count(),
        }
    }

    /// Ask [`Context::wait_for_exit`] to run the shutdown sequence. Safe to
    /// call from inside handlers and supervised tasks.
    pub fn request_stop(&self) {
        self.inner.shutdown.request_exit();
    }

    /// Run the shutdown sequence once: stop every queue, cancel every
    /// cancellable task, then wait for all supervised tasks to finish.
    ///
    /// Must not be awaited from a supervised task, which would wait on
    /// itself; use [`Context::request_stop`] there.
    pub async fn stop(&self) {
        if !self.inner.shutdown.begin() {
            return;
        }
        tracing::info!("Server stopping");

        for queue in self.inner.queues.snapshot() {
            queue.stop();
        }
        self.inner.supervisor.cancel_all();
        self.inner.shutdown.request_exit();

        drain(
            &self.inner.supervisor,
            &self.inner.shutdown,
            &self.inner.config.shutdown,
        )
        .await;

        tracing::info!("Server stop");
    }

    /// Block until SIGINT, SIGTERM or [`Context::request_stop`], run the
    /// shutdown sequence, then the application callbacks.
    pub async fn wait_for_exit(&self, at_exit: Vec<AtExit>) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.inner.start_time.store(now, Ordering::Release);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received");
            }
            _ = terminate_signal() => {
                tracing::info!("Terminate signal received");
            }
            _ = self.inner.shutdown.exit_requested() => {}
        }

        self.stop().await;

        for callback in at_exit {
            self.inner.supervisor.try_run(callback);
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_queue_ids_are_monotonic() {
        let ctx = Context::new(Config::default());
        let a = ctx.next_queue_id();
        let b = ctx.next_queue_id();
        assert_eq!(a, 1);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_stop_cancels_tasks_and_runs_at_exit() {
        let ctx = Context::new(Config::default());
        ctx.supervisor().spawn_cancellable(|token| async move {
            token.cancelled().await;
        });
        assert_eq!(ctx.stats().task_count, 1);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_exit(vec![Box::new(move || flag.store(true, Ordering::SeqCst))])
                .await;
        });

        ctx.request_stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("shutdown stalled")
            .unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert!(ctx.is_stopping());
        assert_eq!(ctx.stats().task_count, 0);
        assert!(ctx.stats().start_time > 0);
    }

    #[tokio::test]
    async fn test_stop_runs_once() {
        let ctx = Context::new(Config::default());
        ctx.stop().await;
        ctx.stop().await;
        assert!(ctx.is_stopping());
        assert!(!ctx.supervisor().spawn_cancellable(|_| async {}));
    }
}
