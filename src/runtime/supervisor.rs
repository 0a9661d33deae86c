//! Supervised task spawning
//!
//! Every background task goes through a [`Supervisor`]. Each task is
//! counted, tracked for shutdown joins, and run behind a panic boundary so a
//! panicking task is logged and counted without taking down its siblings.

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Spawns and accounts for every background task
#[derive(Clone, Default)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

#[derive(Default)]
struct SupervisorInner {
    /// Wait group for shutdown joins
    tracker: TaskTracker,
    /// Parent of every cancellable task token
    root: CancellationToken,
    /// Stop tokens of live cancellable tasks
    cancellable: Mutex<HashMap<u64, CancellationToken>>,
    next_task_id: AtomicU64,
    active: AtomicI64,
    panics: AtomicU64,
    /// Unix seconds of the last recovered panic, 0 if none
    last_panic: AtomicU64,
}

/// Decrements the live task counter however the task ends
struct ActiveGuard(Arc<SupervisorInner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Removes a cancellable task's token from the registry on exit
struct Registration {
    inner: Arc<SupervisorInner>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut tokens) = self.inner.cancellable.lock() {
            tokens.remove(&self.id);
        }
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire-and-forget task
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(self.guarded(fut))
    }

    /// Task that receives its own stop token. The token is cancelled by
    /// [`Supervisor::cancel_all`]. Returns false once cancellation has been
    /// broadcast.
    pub fn spawn_cancellable<F, Fut>(&self, f: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.inner.root.is_cancelled() {
            return false;
        }

        let id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.root.child_token();
        if let Ok(mut tokens) = self.inner.cancellable.lock() {
            tokens.insert(id, token.clone());
        }

        let registration = Registration {
            inner: self.inner.clone(),
            id,
        };
        let fut = f(token);
        self.spawn(async move {
            let _registration = registration;
            fut.await;
        });
        true
    }

    /// Task built from `f` applied to `arg`
    pub fn spawn_with<A, F, Fut>(&self, arg: A, f: F) -> JoinHandle<()>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(f(arg))
    }

    /// Run `f` inline behind the same panic boundary as spawned tasks
    pub fn try_run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        match std::panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Some(value),
            Err(payload) => {
                self.inner.record_panic(payload);
                None
            }
        }
    }

    /// Cancel every registered cancellable task and refuse new ones
    pub fn cancel_all(&self) {
        self.inner.root.cancel();
        let drained = match self.inner.cancellable.lock() {
            Ok(mut tokens) => tokens.drain().count(),
            Err(_) => 0,
        };
        tracing::debug!("Cancelled {} background tasks", drained);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// True once every tracked task has finished
    pub fn is_idle(&self) -> bool {
        self.inner.tracker.is_empty()
    }

    /// Wait for every tracked task to finish
    pub async fn wait(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    pub fn active_tasks(&self) -> i64 {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn cancellable_tasks(&self) -> usize {
        self.inner.cancellable.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn panic_count(&self) -> u64 {
        self.inner.panics.load(Ordering::Acquire)
    }

    /// Unix seconds of the last recovered panic, 0 if none
    pub fn last_panic(&self) -> u64 {
        self.inner.last_panic.load(Ordering::Acquire)
    }

    fn guarded<F>(&self, fut: F) -> impl Future<Output = ()> + Send + 'static
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        let guard = ActiveGuard(self.inner.clone());
        let inner = self.inner.clone();
        self.inner.tracker.track_future(async move {
            let _guard = guard;
            if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
                inner.record_panic(payload);
            }
        })
    }
}

impl SupervisorInner {
    fn record_panic(&self, payload: Box<dyn Any + Send>) {
        let message = panic_message(payload.as_ref());
        let count = self.panics.fetch_add(1, Ordering::AcqRel) + 1;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.last_panic.store(now, Ordering::Release);
        // The panic hook already reported the location; the stack is unwound here
        tracing::error!("Recovered panic in supervised task: {} (panics: {})", message, count);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
