use std::fmt;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future;
use tokio_util::sync::CancellationToken;

use super::execution::GraphExecution;
use crate::engine::{ExecutionFuture, TaskGraphExecutor, TaskNode};
use crate::error::ExecutionError;
use crate::event::{CountDownEvent, lock};
use crate::graph::DependencyDag;
use crate::key::NodeKey;
use crate::properties::TaskGraphExecutorPropertiesBuilder;
use crate::restriction::{RestrictableNode, TaskExecutionRestrictionStrategyFactory};

/// Schedules a node once all of its inputs are computed and the restriction
/// strategy has released it.
pub struct RestrictableTaskGraphExecutor {
    dag: DependencyDag<NodeKey>,
    nodes: Mutex<Option<Vec<Arc<TaskNode>>>>,
    strategy_factory: Arc<dyn TaskExecutionRestrictionStrategyFactory>,
    properties: TaskGraphExecutorPropertiesBuilder,
}

impl RestrictableTaskGraphExecutor {
    pub fn new(
        dag: DependencyDag<NodeKey>,
        nodes: Vec<Arc<TaskNode>>,
        strategy_factory: Arc<dyn TaskExecutionRestrictionStrategyFactory>,
    ) -> Self {
        Self {
            dag,
            nodes: Mutex::new(Some(nodes)),
            strategy_factory,
            properties: TaskGraphExecutorPropertiesBuilder::new(),
        }
    }
}

impl TaskGraphExecutor for RestrictableTaskGraphExecutor {
    fn properties(&mut self) -> &mut TaskGraphExecutorPropertiesBuilder {
        &mut self.properties
    }

    fn execute(&self, cancel: &CancellationToken) -> ExecutionFuture {
        let Some(nodes) = lock(&self.nodes).take() else {
            return future::ready(Err(ExecutionError::AlreadyExecuted)).boxed();
        };

        let (execution, result) =
            GraphExecution::new(self.properties.build(), self.dag.clone(), &nodes, cancel);
        execution.start();

        // Each node waits for its inputs, for its release and for the
        // strategy to be in place.
        let mut restrictable = Vec::with_capacity(nodes.len());
        let mut startups = Vec::with_capacity(nodes.len());
        for node in nodes {
            let dependencies = execution.dependencies(node.key());
            let key = node.key().clone();

            let scheduling = Arc::clone(&execution);
            let ready = Arc::new(CountDownEvent::new(dependencies.len() + 2, move || {
                scheduling.ensure_scheduled(&node);
            }));

            for dependency in dependencies {
                let ready = Arc::clone(&ready);
                dependency.add_on_computed(move || ready.dec());
            }

            let release = Arc::clone(&ready);
            restrictable.push(RestrictableNode::new(key, move || release.dec()));
            startups.push(ready);
        }

        let strategy = self.strategy_factory.build_strategy(&self.dag, restrictable);
        execution.set_strategy(Arc::from(strategy));

        for ready in startups {
            ready.dec();
        }
        result
    }
}

impl fmt::Debug for RestrictableTaskGraphExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestrictableTaskGraphExecutor")
            .field("executed", &lock(&self.nodes).is_none())
            .finish_non_exhaustive()
    }
}
