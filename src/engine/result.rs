use std::any::type_name;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::engine::NodeOutcome;
use crate::error::ResultError;
use crate::key::{KeyValue, NodeKey, TaskNodeKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionResultType {
    /// Every node computed its result.
    Success,
    /// At least one node failed.
    Errored,
    /// No node failed, but some nodes finished without a result.
    Canceled,
}

/// Outcome of a graph execution, holding the outcomes of the requested
/// result nodes.
#[derive(Debug, Clone)]
pub struct TaskGraphExecutionResult {
    result_type: ExecutionResultType,
    requested: HashSet<NodeKey>,
    outcomes: HashMap<NodeKey, NodeOutcome>,
}

impl TaskGraphExecutionResult {
    pub(crate) fn new(
        result_type: ExecutionResultType,
        requested: HashSet<NodeKey>,
        outcomes: HashMap<NodeKey, NodeOutcome>,
    ) -> Self {
        Self {
            result_type,
            requested,
            outcomes,
        }
    }

    pub fn result_type(&self) -> ExecutionResultType {
        self.result_type
    }

    pub fn is_errored(&self) -> bool {
        self.result_type == ExecutionResultType::Errored
    }

    pub fn is_fully_completed(&self) -> bool {
        self.result_type == ExecutionResultType::Success
    }

    /// Outcome of a requested node. `None` for keys which were not
    /// requested or are not part of the graph.
    pub fn outcome(&self, key: &NodeKey) -> Option<&NodeOutcome> {
        self.outcomes.get(key)
    }

    /// The value computed by a requested node.
    pub fn get_result<R, I>(&self, key: &TaskNodeKey<R, I>) -> Result<Arc<R>, ResultError>
    where
        R: Send + Sync + 'static,
        I: KeyValue + Clone,
    {
        let key = key.erase();
        if !self.requested.contains(&key) {
            return Err(ResultError::NotRequested(key));
        }

        match self.outcomes.get(&key) {
            Some(NodeOutcome::Computed(output)) => {
                Arc::clone(output)
                    .downcast::<R>()
                    .map_err(|_| ResultError::TypeMismatch {
                        key,
                        expected: type_name::<R>(),
                    })
            }
            Some(NodeOutcome::Failed(error)) => Err(ResultError::NodeFailed {
                key,
                error: Arc::clone(error),
            }),
            Some(NodeOutcome::Canceled) => Err(ResultError::Canceled(key)),
            None => Err(ResultError::NotComputed(key)),
        }
    }
}
