#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod configurer;
mod engine;
mod error;
mod event;
mod executor;
mod factory;
mod graph;
mod key;
#[cfg(feature = "logging")]
pub mod logging;
mod properties;
pub mod restriction;

pub use crate::configurer::{TaskFactoryDefiner, TaskGraphDefConfigurer};
pub use crate::engine::{
    BuildFuture, CollectingTaskGraphBuilder, EagerTaskGraphExecutor, ExecutionFuture,
    ExecutionResultType, NodeOutcome, RestrictableTaskGraphExecutor, TaskGraphExecutionResult,
    TaskGraphExecutor, TaskGraphExecutorFactory, TaskGraphExecutors, TaskNode,
};
pub use crate::error::*;
#[cfg(feature = "tokio")]
pub use crate::executor::TokioTaskExecutor;
pub use crate::executor::{
    CancelableTask, CleanupTask, ManualTaskExecutor, RayonTaskExecutor, SyncTaskExecutor,
    TaskExecutor, run_cancelable,
};
pub use crate::factory::{
    NodeTask, TaskFactory, TaskFactoryGroupConfigurer, TaskInputBinder, TaskInputRef,
    TaskNodeCreateArgs, node_task,
};
pub use crate::graph::{ChildrenBuilder, DependencyDag, DirectedGraph, DirectedGraphBuilder};
pub use crate::key::{CustomKey, FactoryKey, KeyValue, NodeKey, TaskFactoryKey, TaskNodeKey};
pub use crate::properties::{
    TaskErrorHandler, TaskFactoryProperties, TaskFactoryPropertiesBuilder,
    TaskGraphBuilderProperties, TaskGraphBuilderPropertiesBuilder, TaskGraphExecutorProperties,
    TaskGraphExecutorPropertiesBuilder, TaskNodeProperties, TaskNodePropertiesBuilder,
};

pub use tokio_util::sync::CancellationToken;
