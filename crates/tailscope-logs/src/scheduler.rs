use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;

/// Delay before a task that returned an error is invoked again
const FAULT_BACKOFF: Duration = Duration::from_millis(100);

/// One unit of periodic work.
///
/// Returns how long to wait before the next invocation; `Duration::ZERO`
/// asks to be run again right away. Long loops inside the work should check
/// the token and return early once it is cancelled.
pub type TaskFn = Box<dyn FnMut(&CancellationToken) -> Result<Duration> + Send>;

/// Shared state between a scheduled task and its handle
struct TaskCell {
    name: String,
    cancel: CancellationToken,
    work: Mutex<TaskFn>,
}

impl TaskCell {
    fn new(name: &str, work: TaskFn) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            cancel: CancellationToken::new(),
            work: Mutex::new(work),
        })
    }

    /// Run the work once; `None` once the task has been disposed
    fn invoke(&self) -> Option<Duration> {
        let mut work = self.work.lock();
        if self.cancel.is_cancelled() {
            return None;
        }

        match work(&self.cancel) {
            Ok(delay) => Some(delay),
            Err(e) => {
                warn!(task = %self.name, error = %e, "periodic task failed");
                Some(FAULT_BACKOFF)
            }
        }
    }
}

/// Handle to a task created by a `TaskScheduler`.
///
/// Dropping the handle disposes the task.
pub struct PeriodicTask {
    cell: Arc<TaskCell>,
}

impl PeriodicTask {
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn is_disposed(&self) -> bool {
        self.cell.cancel.is_cancelled()
    }

    /// Cancel the task.
    ///
    /// Waits for an in-flight invocation to return, so no invocation starts
    /// or runs after this returns. Must not be called from inside the task's
    /// own work.
    pub fn dispose(&self) {
        if !self.cell.cancel.is_cancelled() {
            debug!(task = %self.cell.name, "disposing periodic task");
        }
        self.cell.cancel.cancel();
        drop(self.cell.work.lock());
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.cell.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Runs periodic tasks for pipeline stages.
///
/// A scheduler never runs two invocations of the same task at once.
pub trait TaskScheduler: Send + Sync {
    fn schedule(&self, name: &str, work: TaskFn) -> PeriodicTask;
}

/// Scheduler backed by a tokio runtime: every task is an independent tokio
/// task on the runtime's worker pool.
#[derive(Clone, Debug)]
pub struct TokioTaskScheduler {
    handle: Handle,
}

impl TokioTaskScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler for the runtime this is called from
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl TaskScheduler for TokioTaskScheduler {
    fn schedule(&self, name: &str, work: TaskFn) -> PeriodicTask {
        let cell = TaskCell::new(name, work);
        let task = Arc::clone(&cell);
        debug!(task = %name, "scheduling periodic task");

        self.handle.spawn(async move {
            loop {
                let Some(delay) = task.invoke() else {
                    break;
                };

                if delay.is_zero() {
                    tokio::task::yield_now().await;
                    continue;
                }

                tokio::select! {
                    _ = task.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!(task = %task.name, "periodic task stopped");
        });

        PeriodicTask { cell }
    }
}

/// Scheduler that only runs tasks when told to, on the caller's thread.
///
/// Delays returned by tasks are ignored; every live task runs once per
/// `run_once`.
#[derive(Default)]
pub struct ManualTaskScheduler {
    tasks: Mutex<Vec<Weak<TaskCell>>>,
}

impl ManualTaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks that have not been disposed
    pub fn task_count(&self) -> usize {
        self.live_tasks().len()
    }

    /// Invoke every live task once; returns how many ran
    pub fn run_once(&self) -> usize {
        self.run_round().0
    }

    /// Run rounds until no task asks to be run again immediately, or
    /// `max_rounds` is reached. Returns the number of rounds run.
    pub fn run_until_idle(&self, max_rounds: usize) -> usize {
        for round in 1..=max_rounds {
            let (_, busy) = self.run_round();
            if !busy {
                return round;
            }
        }
        max_rounds
    }

    fn run_round(&self) -> (usize, bool) {
        let mut ran = 0;
        let mut busy = false;
        // Invoked without holding the registry so tasks may schedule others
        for task in self.live_tasks() {
            if let Some(delay) = task.invoke() {
                ran += 1;
                busy |= delay.is_zero();
            }
        }
        (ran, busy)
    }

    fn live_tasks(&self) -> Vec<Arc<TaskCell>> {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| t.upgrade().is_some_and(|cell| !cell.cancel.is_cancelled()));
        tasks.iter().filter_map(Weak::upgrade).collect()
    }
}

impl TaskScheduler for ManualTaskScheduler {
    fn schedule(&self, name: &str, work: TaskFn) -> PeriodicTask {
        let cell = TaskCell::new(name, work);
        self.tasks.lock().push(Arc::downgrade(&cell));
        PeriodicTask { cell }
    }
}
