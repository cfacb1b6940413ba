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

/// Schedules every node as soon as all of its inputs are computed.
pub struct EagerTaskGraphExecutor {
    dag: DependencyDag<NodeKey>,
    nodes: Mutex<Option<Vec<Arc<TaskNode>>>>,
    properties: TaskGraphExecutorPropertiesBuilder,
}

impl EagerTaskGraphExecutor {
    pub fn new(dag: DependencyDag<NodeKey>, nodes: Vec<Arc<TaskNode>>) -> Self {
        Self {
            dag,
            nodes: Mutex::new(Some(nodes)),
            properties: TaskGraphExecutorPropertiesBuilder::new(),
        }
    }
}

impl TaskGraphExecutor for EagerTaskGraphExecutor {
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

        let mut ready = Vec::new();
        for node in nodes {
            let dependencies = execution.dependencies(node.key());
            if dependencies.is_empty() {
                ready.push(node);
                continue;
            }

            let scheduling = Arc::clone(&execution);
            let inputs_ready = Arc::new(CountDownEvent::new(dependencies.len(), move || {
                scheduling.ensure_scheduled(&node);
            }));
            for dependency in dependencies {
                let inputs_ready = Arc::clone(&inputs_ready);
                dependency.add_on_computed(move || inputs_ready.dec());
            }
        }

        for node in &ready {
            execution.ensure_scheduled(node);
        }
        result
    }
}

impl fmt::Debug for EagerTaskGraphExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EagerTaskGraphExecutor")
            .field("executed", &lock(&self.nodes).is_none())
            .finish_non_exhaustive()
    }
}
