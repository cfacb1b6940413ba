use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;

use crate::key::{FactoryKey, NodeKey};

/// Signals that a unit of work stopped because its cancellation token was
/// triggered. Returned from tasks as an `anyhow::Error`, it is told apart
/// from genuine failures with [`is_benign_cancellation`].
#[derive(Debug, Error, Clone, Copy, Default, PartialEq, Eq)]
#[error("operation canceled")]
pub struct OperationCanceled;

/// Returns `true` if the pair reported by a task's cleanup describes a
/// plain cancellation instead of a failure.
pub fn is_benign_cancellation(canceled: bool, error: &anyhow::Error) -> bool {
    canceled && error.is::<OperationCanceled>()
}

/// The path of a cycle found in a directed graph. The first and the last
/// element are the same node.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("The graph is cyclic: {cycle:?}")]
pub struct CycleError<N: Debug> {
    pub cycle: Vec<N>,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Cyclic(#[from] CycleError<NodeKey>),

    #[error("Missing node factory definition for key: {0}")]
    MissingFactory(FactoryKey),

    #[error("Duplicate node key: {0}")]
    DuplicateNode(NodeKey),
}

/// Failure of [`CollectingTaskGraphBuilder::build_graph`](crate::CollectingTaskGraphBuilder::build_graph).
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Failed to create task node {key}:\n{error:#}")]
    NodeCreate { key: NodeKey, error: anyhow::Error },

    #[error("Graph build was canceled")]
    Canceled,

    #[error("Failed to create graph executor:\n{0:#}")]
    Executor(anyhow::Error),
}

impl From<CycleError<NodeKey>> for BuildError {
    fn from(err: CycleError<NodeKey>) -> Self {
        BuildError::Graph(GraphError::Cyclic(err))
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Computation failed")]
    Failed,

    #[error("Computation was canceled")]
    Canceled,

    #[error("Task graph was already executed")]
    AlreadyExecuted,
}

/// Failure to read the value of a single node.
#[derive(Debug, Error, Clone)]
pub enum ResultError {
    #[error("Key was not requested as a result: {0}")]
    NotRequested(NodeKey),

    #[error("Trying to retrieve result of node before computation: {0}")]
    NotComputed(NodeKey),

    #[error("Node {key} failed:\n{error:#}")]
    NodeFailed {
        key: NodeKey,
        error: Arc<anyhow::Error>,
    },

    #[error("Node {0} was canceled before producing a result")]
    Canceled(NodeKey),

    #[error("Result of node {key} is not of type {expected}")]
    TypeMismatch { key: NodeKey, expected: &'static str },

    #[error("Input already consumed for key: {0}")]
    InputConsumed(NodeKey),
}

impl ResultError {
    /// The original error of a failed node, if this is a [`ResultError::NodeFailed`].
    pub fn node_error(&self) -> Option<&anyhow::Error> {
        match self {
            ResultError::NodeFailed { error, .. } => Some(error),
            _ => None,
        }
    }
}
