//! Building and executing task graphs.
//!
//! A [`CollectingTaskGraphBuilder`] expands the requested node keys into the
//! complete graph, calling factories to discover dependencies. Once every
//! node is built, the resulting [`DependencyDag`] and nodes are handed to a
//! [`TaskGraphExecutorFactory`], which produces the [`TaskGraphExecutor`]
//! driving the computation.
//!
//! All outputs are stored type-erased as `Arc<dyn Any + Send + Sync>`; the
//! typed keys are used to downcast them back when the result is read.

mod builder;
mod eager;
mod execution;
mod node;
mod restrictable;
mod result;

use std::any::Any;
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{BuildError, ExecutionError};
use crate::event::lock;
use crate::graph::DependencyDag;
use crate::key::NodeKey;
use crate::properties::TaskGraphExecutorPropertiesBuilder;
use crate::restriction::{EagerRestrictionStrategy, TaskExecutionRestrictionStrategyFactory};

pub use builder::CollectingTaskGraphBuilder;
pub(crate) use builder::GraphBuild;
pub use eager::EagerTaskGraphExecutor;
pub(crate) use node::NodeTaskRef;
pub use node::{NodeOutcome, TaskNode};
pub use restrictable::RestrictableTaskGraphExecutor;
pub use result::{ExecutionResultType, TaskGraphExecutionResult};

pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Resolves to the executor of a fully built graph.
pub type BuildFuture = BoxFuture<'static, Result<Box<dyn TaskGraphExecutor>, BuildError>>;

/// Resolves once every node of the graph has finished.
pub type ExecutionFuture = BoxFuture<'static, Result<TaskGraphExecutionResult, ExecutionError>>;

/// Drives the computation of a built graph.
pub trait TaskGraphExecutor: Send {
    /// Settings used by the next call to [`execute`](Self::execute).
    fn properties(&mut self) -> &mut TaskGraphExecutorPropertiesBuilder;

    /// Starts computing every node. Nodes are single-use, so an executor can
    /// run only once.
    fn execute(&self, cancel: &CancellationToken) -> ExecutionFuture;
}

/// Creates the executor for a graph once it is built.
pub trait TaskGraphExecutorFactory: Send + Sync {
    fn create_executor(
        &self,
        graph: DependencyDag<NodeKey>,
        nodes: Vec<Arc<TaskNode>>,
    ) -> anyhow::Result<Box<dyn TaskGraphExecutor>>;
}

impl<F> TaskGraphExecutorFactory for F
where
    F: Fn(DependencyDag<NodeKey>, Vec<Arc<TaskNode>>) -> anyhow::Result<Box<dyn TaskGraphExecutor>>
        + Send
        + Sync,
{
    fn create_executor(
        &self,
        graph: DependencyDag<NodeKey>,
        nodes: Vec<Arc<TaskNode>>,
    ) -> anyhow::Result<Box<dyn TaskGraphExecutor>> {
        self(graph, nodes)
    }
}

/// Ready-made executor factories.
pub struct TaskGraphExecutors;

impl TaskGraphExecutors {
    /// Computes the end nodes right away, cascading down to their
    /// dependencies.
    pub fn eager() -> Arc<dyn TaskGraphExecutorFactory> {
        Arc::new(
            |graph: DependencyDag<NodeKey>,
             nodes: Vec<Arc<TaskNode>>|
             -> anyhow::Result<Box<dyn TaskGraphExecutor>> {
                Ok(Box::new(EagerTaskGraphExecutor::new(graph, nodes)))
            },
        )
    }

    /// Lets `strategy` decide when nodes may start.
    pub fn restrictable(
        strategy: impl TaskExecutionRestrictionStrategyFactory + 'static,
    ) -> Arc<dyn TaskGraphExecutorFactory> {
        let strategy: Arc<dyn TaskExecutionRestrictionStrategyFactory> = Arc::new(strategy);
        Arc::new(
            move |graph: DependencyDag<NodeKey>,
                  nodes: Vec<Arc<TaskNode>>|
                  -> anyhow::Result<Box<dyn TaskGraphExecutor>> {
                Ok(Box::new(RestrictableTaskGraphExecutor::new(
                    graph,
                    nodes,
                    Arc::clone(&strategy),
                )))
            },
        )
    }

    /// The default: a restrictable executor releasing every node at once.
    pub fn unrestricted() -> Arc<dyn TaskGraphExecutorFactory> {
        Self::restrictable(EagerRestrictionStrategy)
    }
}

/// The sending half of a single-value future. Only the first value sent is
/// delivered.
pub(crate) struct Completion<T> {
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Completion<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (sender, receiver) = oneshot::channel();
        let completion = Self {
            sender: Mutex::new(Some(sender)),
        };
        (completion, receiver)
    }

    /// Returns `false` if a value was already sent.
    pub fn complete(&self, value: T) -> bool {
        let sender = lock(&self.sender).take();
        match sender {
            Some(sender) => {
                // The caller may have dropped the future, nobody to tell then.
                let _ = sender.send(value);
                true
            }
            None => false,
        }
    }
}
