//! Executors running single cancelable units of work.
//!
//! The engine never spawns threads on its own. Every node computation and
//! every node build is handed to a [`TaskExecutor`], which decides where the
//! work runs. After the task, the executor always calls the cleanup with
//! `(canceled, error)`.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use rayon::ThreadPool;
use tokio_util::sync::CancellationToken;

use crate::error::OperationCanceled;
use crate::event::lock;

/// A unit of work observing a cancellation token.
pub type CancelableTask = Box<dyn FnOnce(&CancellationToken) -> anyhow::Result<()> + Send>;

/// Called after a [`CancelableTask`] with `(canceled, error)`.
pub type CleanupTask = Box<dyn FnOnce(bool, Option<anyhow::Error>) + Send>;

pub trait TaskExecutor: Send + Sync {
    /// Runs `task` (unless `cancel` is already triggered when it would
    /// start) and then `cleanup`.
    ///
    /// `canceled` is `true` if the task was skipped or stopped with
    /// [`OperationCanceled`]. A skipped task reports `OperationCanceled` as
    /// its error.
    fn execute(&self, cancel: &CancellationToken, task: CancelableTask, cleanup: CleanupTask);
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}

/// Runs a task on the current thread, converting panics into errors.
pub fn run_cancelable(cancel: &CancellationToken, task: CancelableTask, cleanup: CleanupTask) {
    if cancel.is_cancelled() {
        cleanup(true, Some(OperationCanceled.into()));
        return;
    }

    let output = match catch_unwind(AssertUnwindSafe(|| task(cancel))) {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(panic_message(panic.as_ref()))),
    };

    match output {
        Ok(()) => cleanup(false, None),
        Err(error) => {
            let canceled = error.is::<OperationCanceled>();
            cleanup(canceled, Some(error));
        }
    }
}

/// Runs tasks on the calling thread.
///
/// A task submitted while another one runs on the same thread is queued
/// instead of running nested, and the outermost call runs it before
/// returning. Chains of tasks submitting their successors therefore use a
/// constant amount of stack, however long they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncTaskExecutor;

thread_local! {
    /// Tasks waiting for the outermost `SyncTaskExecutor::execute` of this
    /// thread. `None` while no such call is running.
    static SYNC_QUEUE: RefCell<Option<VecDeque<QueuedTask>>> = const { RefCell::new(None) };
}

/// Marks the outermost call as done, even if a cleanup panics.
struct SyncDrain;

impl Drop for SyncDrain {
    fn drop(&mut self) {
        let rest = SYNC_QUEUE.with_borrow_mut(Option::take);
        drop(rest);
    }
}

impl TaskExecutor for SyncTaskExecutor {
    fn execute(&self, cancel: &CancellationToken, task: CancelableTask, cleanup: CleanupTask) {
        let mut next = Some((cancel.clone(), task, cleanup));
        let outermost = SYNC_QUEUE.with_borrow_mut(|queue| {
            if let Some(queue) = queue {
                queue.extend(next.take());
                return false;
            }
            *queue = Some(VecDeque::new());
            true
        });
        if !outermost {
            return;
        }

        let _drain = SyncDrain;
        while let Some((cancel, task, cleanup)) = next.take().or_else(|| {
            SYNC_QUEUE.with_borrow_mut(|queue| queue.as_mut().and_then(VecDeque::pop_front))
        }) {
            run_cancelable(&cancel, task, cleanup);
        }
    }
}

/// Runs tasks on a rayon thread pool, the global one unless a pool is given.
#[derive(Clone, Default)]
pub struct RayonTaskExecutor {
    pool: Option<Arc<ThreadPool>>,
}

impl RayonTaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(pool: Arc<ThreadPool>) -> Self {
        Self { pool: Some(pool) }
    }
}

impl TaskExecutor for RayonTaskExecutor {
    fn execute(&self, cancel: &CancellationToken, task: CancelableTask, cleanup: CleanupTask) {
        let cancel = cancel.clone();
        let job = move || run_cancelable(&cancel, task, cleanup);
        match &self.pool {
            Some(pool) => pool.spawn(job),
            None => rayon::spawn(job),
        }
    }
}

impl fmt::Debug for RayonTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RayonTaskExecutor")
            .field("dedicated_pool", &self.pool.is_some())
            .finish()
    }
}

type QueuedTask = (CancellationToken, CancelableTask, CleanupTask);

/// Queues tasks until they are explicitly run, which makes the order of
/// execution fully controlled by the caller.
#[derive(Default)]
pub struct ManualTaskExecutor {
    queue: Mutex<VecDeque<QueuedTask>>,
}

impl ManualTaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Runs the oldest queued task. Returns `false` if there was none.
    pub fn try_execute_one(&self) -> bool {
        let next = lock(&self.queue).pop_front();
        match next {
            Some((cancel, task, cleanup)) => {
                run_cancelable(&cancel, task, cleanup);
                true
            }
            None => false,
        }
    }

    /// Runs the tasks queued at the time of the call, returning how many ran.
    /// Tasks submitted meanwhile stay queued.
    pub fn execute_current_tasks(&self) -> usize {
        let current: Vec<_> = lock(&self.queue).drain(..).collect();
        let count = current.len();
        for (cancel, task, cleanup) in current {
            run_cancelable(&cancel, task, cleanup);
        }
        count
    }

    /// Runs tasks until the queue stays empty.
    pub fn execute_all(&self) -> usize {
        let mut count = 0;
        while self.try_execute_one() {
            count += 1;
        }
        count
    }
}

impl TaskExecutor for ManualTaskExecutor {
    fn execute(&self, cancel: &CancellationToken, task: CancelableTask, cleanup: CleanupTask) {
        lock(&self.queue).push_back((cancel.clone(), task, cleanup));
    }
}

impl fmt::Debug for ManualTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTaskExecutor")
            .field("queued", &self.queued())
            .finish()
    }
}

/// Runs tasks on the blocking thread pool of a tokio runtime.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone)]
pub struct TokioTaskExecutor {
    handle: tokio::runtime::Handle,
}

#[cfg(feature = "tokio")]
impl TokioTaskExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running in.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

#[cfg(feature = "tokio")]
impl TaskExecutor for TokioTaskExecutor {
    fn execute(&self, cancel: &CancellationToken, task: CancelableTask, cleanup: CleanupTask) {
        let cancel = cancel.clone();
        // The join handle is not needed, completion is reported by `cleanup`.
        drop(
            self.handle
                .spawn_blocking(move || run_cancelable(&cancel, task, cleanup)),
        );
    }
}
