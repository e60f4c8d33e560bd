//! Interval based task scheduling.
//!
//! Tasks optionally run inside a serializer and repeat with either a fixed
//! period (measured start-to-start) or a delay period (measured from the end
//! of the previous run). Cancellation is idempotent and reports whether the
//! task was still armed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::serializer::{Serializer, ShutdownGroup};

type TaskFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// How a scheduled task repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPolicy {
    /// Runs every `period`, measured from the start of the previous run.
    FixedInterval,
    /// Runs `period` after the previous run finished.
    Delay,
    /// Runs once after `period`.
    OneShot,
}

struct TaskState {
    last_start: Option<Instant>,
    last_end: Option<Instant>,
    next_run: Instant,
}

/// Handle to a scheduled task.
pub struct SchedTask {
    id: u64,
    name: Arc<str>,
    period: Duration,
    policy: RunPolicy,
    cancelled: CancellationToken,
    running: AtomicBool,
    state: Mutex<TaskState>,
}

impl SchedTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Time until the next run, `None` once cancelled or completed.
    pub fn next_run_in(&self) -> Option<Duration> {
        if self.cancelled.is_cancelled() {
            return None;
        }

        let state = self.state.lock();
        Some(state.next_run.saturating_duration_since(Instant::now()))
    }

    pub fn last_times(&self) -> (Option<Instant>, Option<Instant>) {
        let state = self.state.lock();
        (state.last_start, state.last_end)
    }
}

#[derive(Default)]
struct SchedulerInner {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, Arc<SchedTask>>>,
}

/// Scheduler owning all interval tasks of the core.
#[derive(Default, Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task`. When `serializer` is set every run is submitted to
    /// it instead of running on the timer task directly.
    pub fn schedule<F, Fut>(
        &self,
        name: impl Into<String>,
        period: Duration,
        policy: RunPolicy,
        serializer: Option<Serializer>,
        group: &ShutdownGroup,
        task: F,
    ) -> Arc<SchedTask>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task: TaskFn = Arc::new(move || Box::pin(task()));

        let handle = Arc::new(SchedTask {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.into().into(),
            period,
            policy,
            cancelled: CancellationToken::new(),
            running: AtomicBool::new(false),
            state: Mutex::new(TaskState {
                last_start: None,
                last_end: None,
                next_run: Instant::now() + period,
            }),
        });

        self.inner.tasks.lock().insert(handle.id, handle.clone());

        group.spawn(run_task(
            handle.clone(),
            task,
            serializer,
            self.inner.clone(),
            group.token().clone(),
        ));

        handle
    }

    /// Cancel `task` if it is still armed.
    ///
    /// Returns true exactly once per task; further calls (and calls after
    /// the task completed by itself) return false, so the caller releases
    /// its bookkeeping reference at most once.
    pub fn cancel_if_active(&self, task: &SchedTask) -> bool {
        let removed = self.inner.tasks.lock().remove(&task.id).is_some();
        task.cancelled.cancel();
        removed
    }

    pub fn cancel_by_name(&self, name: &str) -> bool {
        let task = {
            let tasks = self.inner.tasks.lock();
            tasks.values().find(|t| &*t.name == name).cloned()
        };

        match task {
            Some(task) => self.cancel_if_active(&task),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.lock().is_empty()
    }
}

async fn run_task(
    handle: Arc<SchedTask>,
    task: TaskFn,
    serializer: Option<Serializer>,
    inner: Arc<SchedulerInner>,
    shutdown: CancellationToken,
) {
    loop {
        let next_run = handle.state.lock().next_run;

        tokio::select! {
            _ = handle.cancelled.cancelled() => break,
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(next_run) => {}
        }

        let started = Instant::now();
        handle.running.store(true, Ordering::Relaxed);
        handle.state.lock().last_start = Some(started);

        match &serializer {
            Some(serializer) => {
                let task = task.clone();
                if serializer.send_wait(async move { task().await }).await.is_err() {
                    // Owning serializer is gone, nothing left to schedule for
                    break;
                }
            }
            None => task().await,
        }

        let ended = Instant::now();
        handle.running.store(false, Ordering::Relaxed);

        {
            let mut state = handle.state.lock();
            state.last_end = Some(ended);
            state.next_run = match handle.policy {
                RunPolicy::FixedInterval => {
                    let mut next = started + handle.period;
                    // A run that overran its own period reschedules from now
                    if next <= ended {
                        next = ended + handle.period;
                    }
                    next
                }
                RunPolicy::Delay => ended + handle.period,
                RunPolicy::OneShot => break,
            };
        }
    }

    handle.cancelled.cancel();
    inner.tasks.lock().remove(&handle.id);
}
