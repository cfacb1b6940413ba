use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::engine::Dynamic;
use crate::error::{ResultError, is_benign_cancellation};
use crate::event::{OneShotEvent, lock};
use crate::key::NodeKey;
use crate::properties::TaskNodeProperties;

type DynNodeTask = Box<dyn FnOnce(&CancellationToken) -> anyhow::Result<Dynamic> + Send>;

/// The computation of a node together with the settings it runs with.
pub(crate) struct NodeTaskRef {
    properties: TaskNodeProperties,
    task: DynNodeTask,
}

impl NodeTaskRef {
    pub fn new(properties: TaskNodeProperties, task: DynNodeTask) -> Self {
        Self { properties, task }
    }
}

enum NodeTaskState {
    Unbuilt,
    Ready(NodeTaskRef),
    Claimed,
}

/// How a node ended, as seen by the execution result.
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    Computed(Dynamic),
    /// The computation of the node itself failed.
    Failed(Arc<anyhow::Error>),
    /// The node finished without a result and without an error of its own:
    /// it was canceled, or one of its dependencies did not produce a result.
    Canceled,
}

/// One unit of computation of the graph.
///
/// A node is created once per key while the graph is built. Its computation
/// can be claimed only once, so scheduling the node repeatedly is harmless.
/// Two events mark its progress: *computed* fires when the result becomes
/// available, *finished* fires when the node will never produce a result
/// anymore, with or without having computed one.
pub struct TaskNode {
    key: NodeKey,
    task: Mutex<NodeTaskState>,
    result: OnceLock<Dynamic>,
    failure: OnceLock<Arc<anyhow::Error>>,
    computed: OneShotEvent,
    finished: OneShotEvent,
}

impl TaskNode {
    pub(crate) fn new(key: NodeKey) -> Self {
        Self {
            key,
            task: Mutex::new(NodeTaskState::Unbuilt),
            result: OnceLock::new(),
            failure: OnceLock::new(),
            computed: OneShotEvent::new(),
            finished: OneShotEvent::new(),
        }
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn has_result(&self) -> bool {
        self.result.get().is_some()
    }

    /// Error raised by the computation of this node, if any.
    pub fn failure(&self) -> Option<&Arc<anyhow::Error>> {
        self.failure.get()
    }

    pub(crate) fn set_task(&self, task: NodeTaskRef) {
        let mut state = lock(&self.task);
        if matches!(*state, NodeTaskState::Unbuilt) {
            *state = NodeTaskState::Ready(task);
        }
    }

    /// Schedules the computation of the node unless it was already
    /// scheduled. A node whose token is already canceled is finished
    /// right away without computing.
    pub(crate) fn ensure_schedule_computed<E>(self: &Arc<Self>, cancel: &CancellationToken, on_error: E)
    where
        E: FnOnce(&NodeKey, &anyhow::Error) + Send + 'static,
    {
        let claimed = mem::replace(&mut *lock(&self.task), NodeTaskState::Claimed);
        let NodeTaskRef { properties, task } = match claimed {
            NodeTaskState::Ready(task_ref) => task_ref,
            NodeTaskState::Claimed => return,
            NodeTaskState::Unbuilt => {
                tracing::warn!(key = %self.key, "Scheduled a node which was never built");
                self.finish();
                return;
            }
        };

        if cancel.is_cancelled() {
            self.finish();
            return;
        }

        let computing = Arc::clone(self);
        let finishing = Arc::clone(self);
        properties.executor().execute(
            cancel,
            Box::new(move |cancel| {
                let output = task(cancel)?;
                computing.computed(output);
                Ok(())
            }),
            Box::new(move |canceled, error| {
                if let Some(error) = error
                    && !is_benign_cancellation(canceled, &error)
                {
                    on_error(&finishing.key, &error);
                    let _ = finishing.failure.set(Arc::new(error));
                }
                finishing.finish();
            }),
        );
    }

    fn computed(&self, output: Dynamic) {
        if self.result.set(output).is_err() {
            return;
        }
        if !self.computed.fire() {
            tracing::warn!(
                key = %self.key,
                "Node was marked as finished but computation completed after marked finished"
            );
        }
    }

    /// Marks the node as done. Only the first call has any effect: the
    /// finished listeners run, the computed listeners are dropped and the
    /// computation, if never claimed, will not run anymore.
    pub(crate) fn finish(&self) {
        let unclaimed = mem::replace(&mut *lock(&self.task), NodeTaskState::Claimed);
        drop(unclaimed);

        if self.finished.fire() {
            self.computed.discard();
        }
    }

    /// Runs `listener` once the result is available. It never runs for a
    /// node finishing without a result.
    pub(crate) fn add_on_computed(&self, listener: impl FnOnce() + Send + 'static) {
        if let Err(listener) = self.computed.register_or_notify(Box::new(listener))
            && self.has_result()
        {
            listener();
        }
    }

    pub(crate) fn add_on_finished(&self, listener: impl FnOnce() + Send + 'static) {
        // The finished event is never discarded.
        let _ = self.finished.register_or_notify(Box::new(listener));
    }

    pub(crate) fn get_result(&self) -> Result<&Dynamic, ResultError> {
        self.result
            .get()
            .ok_or_else(|| ResultError::NotComputed(self.key.clone()))
    }

    pub(crate) fn outcome(&self) -> NodeOutcome {
        match (self.result.get(), self.failure.get()) {
            (Some(output), _) => NodeOutcome::Computed(Arc::clone(output)),
            (None, Some(error)) => NodeOutcome::Failed(Arc::clone(error)),
            (None, None) => NodeOutcome::Canceled,
        }
    }
}

thread_local! {
    /// Tasks of dropped nodes still to be dropped by the outermost
    /// `TaskNode::drop` of this thread. `None` while no node is dropped.
    static DROPPED_TASKS: RefCell<Option<Vec<NodeTaskRef>>> = const { RefCell::new(None) };
}

struct DropDrain;

impl Drop for DropDrain {
    fn drop(&mut self) {
        let rest = DROPPED_TASKS.with_borrow_mut(Option::take);
        drop(rest);
    }
}

// A task never run owns the nodes of its inputs. Dropping them in a loop
// keeps unexecuted chains of any length off the stack.
impl Drop for TaskNode {
    fn drop(&mut self) {
        let state = mem::replace(
            self.task.get_mut().unwrap_or_else(PoisonError::into_inner),
            NodeTaskState::Claimed,
        );
        let NodeTaskState::Ready(task) = state else {
            return;
        };

        let mut next = Some(task);
        let outermost = DROPPED_TASKS.with_borrow_mut(|tasks| {
            if let Some(tasks) = tasks {
                tasks.extend(next.take());
                return false;
            }
            *tasks = Some(Vec::new());
            true
        });
        if !outermost {
            return;
        }

        let _drain = DropDrain;
        while let Some(task) = next
            .take()
            .or_else(|| DROPPED_TASKS.with_borrow_mut(|tasks| tasks.as_mut().and_then(Vec::pop)))
        {
            drop(task);
        }
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("key", &self.key)
            .field("has_result", &self.has_result())
            .field("failed", &self.failure.get().is_some())
            .finish_non_exhaustive()
    }
}
