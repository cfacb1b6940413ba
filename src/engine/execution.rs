use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    Completion, ExecutionFuture, ExecutionResultType, NodeOutcome, TaskGraphExecutionResult, TaskNode,
};
use crate::error::ExecutionError;
use crate::event::{CountDownEvent, lock};
use crate::graph::DependencyDag;
use crate::key::NodeKey;
use crate::properties::{TaskGraphExecutorProperties, notify_error_handler};
use crate::restriction::TaskExecutionRestrictionStrategy;

type ExecutionResult = Result<TaskGraphExecutionResult, ExecutionError>;

/// Bookkeeping of one graph execution, shared by both executors.
///
/// Every node is tracked until it finishes. A node finishing without a
/// result takes down every node depending on it, since those can never be
/// computed anymore. Once the last node finishes the execution result is
/// delivered.
pub(crate) struct GraphExecution {
    properties: TaskGraphExecutorProperties,
    dag: DependencyDag<NodeKey>,
    nodes: DashMap<NodeKey, Arc<TaskNode>>,
    outcomes: DashMap<NodeKey, NodeOutcome>,
    errored: AtomicBool,
    canceled: AtomicBool,
    cancel: CancellationToken,
    strategy: Mutex<Option<Arc<dyn TaskExecutionRestrictionStrategy>>>,
    result: Completion<ExecutionResult>,
}

impl GraphExecution {
    pub fn new(
        properties: TaskGraphExecutorProperties,
        dag: DependencyDag<NodeKey>,
        nodes: &[Arc<TaskNode>],
        cancel: &CancellationToken,
    ) -> (Arc<Self>, ExecutionFuture) {
        let (result, receiver) = Completion::new();
        let execution = Arc::new(Self {
            properties,
            dag,
            nodes: nodes
                .iter()
                .map(|node| (node.key().clone(), Arc::clone(node)))
                .collect(),
            outcomes: DashMap::new(),
            errored: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            cancel: cancel.child_token(),
            strategy: Mutex::new(None),
            result,
        });

        let future = receiver
            .map(|result| result.unwrap_or(Err(ExecutionError::Canceled)))
            .boxed();
        (execution, future)
    }

    /// Tracks every node until it finishes. Must be called before any node
    /// is scheduled.
    pub fn start(self: &Arc<Self>) {
        let nodes = self.live_nodes();
        tracing::debug!(nodes = nodes.len(), "Executing task graph");
        if nodes.is_empty() {
            self.finish();
            return;
        }

        let execution = Arc::clone(self);
        let remaining = Arc::new(CountDownEvent::new(nodes.len(), move || execution.finish()));
        for node in nodes {
            let execution = Arc::clone(self);
            let remaining = Arc::clone(&remaining);
            let key = node.key().clone();
            node.add_on_finished(move || {
                execution.on_node_finished(&key);
                remaining.dec();
            });
        }
    }

    pub fn set_strategy(&self, strategy: Arc<dyn TaskExecutionRestrictionStrategy>) {
        *lock(&self.strategy) = Some(strategy);
    }

    pub fn node(&self, key: &NodeKey) -> Option<Arc<TaskNode>> {
        self.nodes.get(key).map(|node| Arc::clone(node.value()))
    }

    /// Nodes the computation of `key` depends on.
    pub fn dependencies(&self, key: &NodeKey) -> Vec<Arc<TaskNode>> {
        self.dag
            .dependency_graph()
            .children(key)
            .into_iter()
            .filter_map(|dependency| self.node(dependency))
            .collect()
    }

    pub fn ensure_scheduled(self: &Arc<Self>, node: &Arc<TaskNode>) {
        let execution = Arc::clone(self);
        node.ensure_schedule_computed(&self.cancel, move |key, error| {
            execution.on_error(key, error);
        });
    }

    fn live_nodes(&self) -> Vec<Arc<TaskNode>> {
        self.nodes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn on_error(&self, key: &NodeKey, error: &anyhow::Error) {
        self.errored.store(true, Ordering::Release);
        notify_error_handler(self.properties.compute_error_handler(), key, error);
        if self.properties.stop_on_failure() {
            tracing::debug!(%key, "Stopping execution after failure");
            self.cancel.cancel();
        }
    }

    fn on_node_finished(&self, key: &NodeKey) {
        let Some((_, node)) = self.nodes.remove(key) else {
            return;
        };

        if !node.has_result() {
            self.canceled.store(true, Ordering::Release);
            self.finish_forward_nodes(key);
        }

        if self.properties.result_node_keys().contains(key) {
            self.outcomes.insert(key.clone(), node.outcome());
        }

        let strategy = lock(&self.strategy).clone();
        if let Some(strategy) = strategy {
            strategy.set_node_computed(key);
        }
    }

    /// Finishes every node still running which depends on `key`, directly
    /// or not, deepest dependents first. Nodes already finished are not
    /// walked again.
    fn finish_forward_nodes(&self, key: &NodeKey) {
        let forward = self.dag.forward_graph();
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<_> = forward
            .children(key)
            .into_iter()
            .map(|child| (child.clone(), false))
            .collect();

        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if !self.nodes.contains_key(&node) || !visited.insert(node.clone()) {
                continue;
            }
            // Children go above their parent, so the parent is emitted after
            // all of them.
            stack.push((node.clone(), true));
            for child in forward.children(&node) {
                if !visited.contains(child) {
                    stack.push((child.clone(), false));
                }
            }
        }

        for key in order {
            if let Some(node) = self.node(&key) {
                node.finish();
            }
        }
    }

    fn finish(&self) {
        lock(&self.strategy).take();

        let errored = self.errored.load(Ordering::Acquire);
        let canceled = self.canceled.load(Ordering::Acquire);
        let result_type = if errored {
            ExecutionResultType::Errored
        } else if canceled {
            ExecutionResultType::Canceled
        } else {
            ExecutionResultType::Success
        };
        tracing::debug!(?result_type, "Task graph execution finished");

        let result = if self.properties.deliver_result_on_failure()
            || result_type == ExecutionResultType::Success
        {
            Ok(self.execution_result(result_type))
        } else if errored {
            Err(ExecutionError::Failed)
        } else {
            Err(ExecutionError::Canceled)
        };
        self.result.complete(result);
    }

    fn execution_result(&self, result_type: ExecutionResultType) -> TaskGraphExecutionResult {
        let outcomes = self
            .outcomes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        TaskGraphExecutionResult::new(
            result_type,
            self.properties.result_node_keys().clone(),
            outcomes,
        )
    }
}
