// FieldVault — Task scheduler
//
// A registry of spawned tokio tasks with two cancellation levels:
//   - scheduler shutdown stops everything it ever spawned
//   - a `TaskScope` stops only the tasks spawned through it (one per session)
//
// One-shot tasks can be awaited with `settle()`; under tokio's paused clock
// this makes delayed work fully deterministic.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

struct TrackedTask {
    name: &'static str,
    recurring: bool,
    handle: JoinHandle<()>,
}

struct SchedulerInner {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<TrackedTask>>,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        for task in self.tasks.get_mut().drain(..) {
            task.handle.abort();
        }
    }
}

/// Registry for detached background work.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a cancellation scope. Tasks spawned through it stop when the
    /// scope is cancelled or the last clone of it is dropped.
    pub fn scope(&self) -> TaskScope {
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        TaskScope {
            scheduler: self.clone(),
            cancel_tx: Arc::new(cancel_tx),
        }
    }

    pub fn spawn<F>(&self, name: &'static str, fut: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.launch(name, false, None, fut)
    }

    pub fn spawn_after<F>(&self, name: &'static str, delay: Duration, fut: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.launch(name, false, None, delayed(delay, fut))
    }

    /// Run `f` every `period`, first after one full period has elapsed.
    pub fn spawn_interval<F, Fut>(&self, name: &'static str, period: Duration, f: F) -> TaskHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.launch(name, true, None, every(period, f))
    }

    /// Stop every task and wait for them to unwind.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in &tasks {
            task.handle.abort();
        }
        let count = tasks.len();
        for task in tasks {
            let _ = task.handle.await;
        }
        tracing::debug!(stopped = count, "Task scheduler shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Wait until every outstanding one-shot task (including ones spawned
    /// while waiting) has finished. Recurring tasks are left running.
    pub async fn settle(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = {
                let mut tasks = self.inner.tasks.lock();
                let (one_shot, recurring): (Vec<_>, Vec<_>) =
                    tasks.drain(..).partition(|t| !t.recurring);
                *tasks = recurring;
                one_shot.into_iter().map(|t| t.handle).collect()
            };
            if pending.is_empty() {
                break;
            }
            for handle in pending {
                let _ = handle.await;
            }
        }
    }

    /// Number of tracked tasks that have not finished yet.
    pub fn active_tasks(&self) -> usize {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.handle.is_finished());
        tasks.len()
    }

    fn launch<F>(
        &self,
        name: &'static str,
        recurring: bool,
        scope_rx: Option<watch::Receiver<bool>>,
        fut: F,
    ) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let scope_cancelled = async move {
                match scope_rx {
                    Some(mut rx) => cancelled(&mut rx).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancelled(&mut shutdown_rx) => {
                    tracing::debug!(task = name, "Task stopped by scheduler shutdown");
                }
                _ = scope_cancelled => {
                    tracing::debug!(task = name, "Task cancelled with its scope");
                }
                _ = fut => {}
            }
        });

        let abort = handle.abort_handle();
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(TrackedTask {
            name,
            recurring,
            handle,
        });

        TaskHandle { name, abort }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tasks = self.inner.tasks.lock();
        let names: Vec<&str> = tasks.iter().map(|t| t.name).collect();
        f.debug_struct("TaskScheduler")
            .field("shut_down", &*self.inner.shutdown_tx.borrow())
            .field("tasks", &names)
            .finish()
    }
}

/// Cancellation scope for a group of tasks (typically one user session).
#[derive(Clone)]
pub struct TaskScope {
    scheduler: TaskScheduler,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl TaskScope {
    pub fn spawn_after<F>(&self, name: &'static str, delay: Duration, fut: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.scheduler
            .launch(name, false, Some(self.cancel_tx.subscribe()), delayed(delay, fut))
    }

    pub fn spawn_interval<F, Fut>(&self, name: &'static str, period: Duration, f: F) -> TaskHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.scheduler
            .launch(name, true, Some(self.cancel_tx.subscribe()), every(period, f))
    }

    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

impl std::fmt::Debug for TaskScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScope")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle to a single spawned task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: &'static str,
    abort: AbortHandle,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Resolves once the flag is set or its sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn delayed<F>(delay: Duration, fut: F)
where
    F: Future<Output = ()>,
{
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    fut.await;
}

async fn every<F, Fut>(period: Duration, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::time::sleep(period).await;
        f().await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
