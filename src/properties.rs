//! Configuration objects.
//!
//! Every property object is immutable and is edited through its builder.
//! Builders start either from the defaults or from an existing object, so
//! settings flow down explicitly: builder defaults seed factory groups,
//! factory groups seed their nodes.

use std::collections::HashSet;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::executor::{SyncTaskExecutor, TaskExecutor, panic_message};
use crate::key::NodeKey;

/// Receives errors raised while creating or computing a node.
pub type TaskErrorHandler = Arc<dyn Fn(&NodeKey, &anyhow::Error) + Send + Sync>;

pub(crate) fn notify_error_handler(handler: &TaskErrorHandler, key: &NodeKey, error: &anyhow::Error) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(key, error))) {
        tracing::error!(
            %key,
            "Error handler panicked ({}) while reporting: {error:#}",
            panic_message(panic.as_ref())
        );
    }
}

fn log_create_error(key: &NodeKey, error: &anyhow::Error) {
    tracing::error!(%key, "Failure while creating node: {error:#}");
}

fn log_compute_error(key: &NodeKey, error: &anyhow::Error) {
    tracing::error!(%key, "Failure while computing node: {error:#}");
}

/// Settings of a single node.
#[derive(Clone)]
pub struct TaskNodeProperties {
    executor: Arc<dyn TaskExecutor>,
}

impl TaskNodeProperties {
    /// Executor running the computation of the node.
    pub fn executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.executor
    }

    pub fn to_builder(&self) -> TaskNodePropertiesBuilder {
        TaskNodePropertiesBuilder {
            executor: Arc::clone(&self.executor),
        }
    }
}

impl Default for TaskNodeProperties {
    fn default() -> Self {
        Self {
            executor: Arc::new(SyncTaskExecutor),
        }
    }
}

impl fmt::Debug for TaskNodeProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNodeProperties").finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct TaskNodePropertiesBuilder {
    executor: Arc<dyn TaskExecutor>,
}

impl Default for TaskNodePropertiesBuilder {
    fn default() -> Self {
        TaskNodeProperties::default().to_builder()
    }
}

impl TaskNodePropertiesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_executor(&mut self, executor: impl TaskExecutor + 'static) -> &mut Self {
        self.executor = Arc::new(executor);
        self
    }

    pub fn set_shared_executor(&mut self, executor: Arc<dyn TaskExecutor>) -> &mut Self {
        self.executor = executor;
        self
    }

    pub fn build(&self) -> TaskNodeProperties {
        TaskNodeProperties {
            executor: Arc::clone(&self.executor),
        }
    }
}

/// Settings shared by the factories of one group.
#[derive(Clone, Default)]
pub struct TaskFactoryProperties {
    factory_executor: Option<Arc<dyn TaskExecutor>>,
    default_node_properties: TaskNodeProperties,
}

impl TaskFactoryProperties {
    /// Executor creating the nodes of the group, if it differs from the
    /// graph builder executor.
    pub fn factory_executor(&self) -> Option<&Arc<dyn TaskExecutor>> {
        self.factory_executor.as_ref()
    }

    /// Starting point of the properties of every node of the group.
    pub fn default_node_properties(&self) -> &TaskNodeProperties {
        &self.default_node_properties
    }

    pub fn to_builder(&self) -> TaskFactoryPropertiesBuilder {
        TaskFactoryPropertiesBuilder {
            factory_executor: self.factory_executor.clone(),
            default_node_properties: self.default_node_properties.to_builder(),
        }
    }
}

impl fmt::Debug for TaskFactoryProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFactoryProperties")
            .field("own_factory_executor", &self.factory_executor.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default)]
pub struct TaskFactoryPropertiesBuilder {
    factory_executor: Option<Arc<dyn TaskExecutor>>,
    default_node_properties: TaskNodePropertiesBuilder,
}

impl TaskFactoryPropertiesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_factory_executor(&mut self, executor: impl TaskExecutor + 'static) -> &mut Self {
        self.factory_executor = Some(Arc::new(executor));
        self
    }

    pub fn set_shared_factory_executor(&mut self, executor: Arc<dyn TaskExecutor>) -> &mut Self {
        self.factory_executor = Some(executor);
        self
    }

    pub fn default_node_properties(&mut self) -> &mut TaskNodePropertiesBuilder {
        &mut self.default_node_properties
    }

    pub fn build(&self) -> TaskFactoryProperties {
        TaskFactoryProperties {
            factory_executor: self.factory_executor.clone(),
            default_node_properties: self.default_node_properties.build(),
        }
    }
}

/// Settings of one graph build.
#[derive(Clone)]
pub struct TaskGraphBuilderProperties {
    graph_builder_executor: Arc<dyn TaskExecutor>,
    node_create_error_handler: TaskErrorHandler,
    default_factory_properties: TaskFactoryProperties,
}

impl TaskGraphBuilderProperties {
    pub fn graph_builder_executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.graph_builder_executor
    }

    pub fn node_create_error_handler(&self) -> &TaskErrorHandler {
        &self.node_create_error_handler
    }

    pub fn default_factory_properties(&self) -> &TaskFactoryProperties {
        &self.default_factory_properties
    }
}

impl fmt::Debug for TaskGraphBuilderProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGraphBuilderProperties")
            .field("default_factory_properties", &self.default_factory_properties)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct TaskGraphBuilderPropertiesBuilder {
    graph_builder_executor: Arc<dyn TaskExecutor>,
    node_create_error_handler: TaskErrorHandler,
    default_factory_properties: TaskFactoryPropertiesBuilder,
}

impl Default for TaskGraphBuilderPropertiesBuilder {
    fn default() -> Self {
        Self {
            graph_builder_executor: Arc::new(SyncTaskExecutor),
            node_create_error_handler: Arc::new(log_create_error),
            default_factory_properties: TaskFactoryPropertiesBuilder::new(),
        }
    }
}

impl TaskGraphBuilderPropertiesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_graph_builder_executor(&mut self, executor: impl TaskExecutor + 'static) -> &mut Self {
        self.graph_builder_executor = Arc::new(executor);
        self
    }

    pub fn set_shared_graph_builder_executor(
        &mut self,
        executor: Arc<dyn TaskExecutor>,
    ) -> &mut Self {
        self.graph_builder_executor = executor;
        self
    }

    pub fn set_node_create_error_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&NodeKey, &anyhow::Error) + Send + Sync + 'static,
    {
        self.node_create_error_handler = Arc::new(handler);
        self
    }

    pub fn default_factory_properties(&mut self) -> &mut TaskFactoryPropertiesBuilder {
        &mut self.default_factory_properties
    }

    pub fn build(&self) -> TaskGraphBuilderProperties {
        TaskGraphBuilderProperties {
            graph_builder_executor: Arc::clone(&self.graph_builder_executor),
            node_create_error_handler: Arc::clone(&self.node_create_error_handler),
            default_factory_properties: self.default_factory_properties.build(),
        }
    }
}

/// Settings of one graph execution.
#[derive(Clone)]
pub struct TaskGraphExecutorProperties {
    stop_on_failure: bool,
    deliver_result_on_failure: bool,
    compute_error_handler: TaskErrorHandler,
    result_node_keys: HashSet<NodeKey>,
}

impl TaskGraphExecutorProperties {
    /// Whether the first failing node cancels the rest of the execution.
    pub fn stop_on_failure(&self) -> bool {
        self.stop_on_failure
    }

    /// Whether an errored or canceled execution still resolves to a result.
    pub fn deliver_result_on_failure(&self) -> bool {
        self.deliver_result_on_failure
    }

    pub fn compute_error_handler(&self) -> &TaskErrorHandler {
        &self.compute_error_handler
    }

    /// Nodes whose outcome is kept for the execution result.
    pub fn result_node_keys(&self) -> &HashSet<NodeKey> {
        &self.result_node_keys
    }
}

impl fmt::Debug for TaskGraphExecutorProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGraphExecutorProperties")
            .field("stop_on_failure", &self.stop_on_failure)
            .field("deliver_result_on_failure", &self.deliver_result_on_failure)
            .field("result_node_keys", &self.result_node_keys)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct TaskGraphExecutorPropertiesBuilder {
    stop_on_failure: bool,
    deliver_result_on_failure: bool,
    compute_error_handler: TaskErrorHandler,
    result_node_keys: HashSet<NodeKey>,
}

impl Default for TaskGraphExecutorPropertiesBuilder {
    fn default() -> Self {
        Self {
            stop_on_failure: false,
            deliver_result_on_failure: false,
            compute_error_handler: Arc::new(log_compute_error),
            result_node_keys: HashSet::new(),
        }
    }
}

impl TaskGraphExecutorPropertiesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stop_on_failure(&mut self, stop_on_failure: bool) -> &mut Self {
        self.stop_on_failure = stop_on_failure;
        self
    }

    pub fn set_deliver_result_on_failure(&mut self, deliver: bool) -> &mut Self {
        self.deliver_result_on_failure = deliver;
        self
    }

    pub fn set_compute_error_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&NodeKey, &anyhow::Error) + Send + Sync + 'static,
    {
        self.compute_error_handler = Arc::new(handler);
        self
    }

    pub fn add_result_node_key(&mut self, key: impl Into<NodeKey>) -> &mut Self {
        self.result_node_keys.insert(key.into());
        self
    }

    pub fn add_result_node_keys<K>(&mut self, keys: impl IntoIterator<Item = K>) -> &mut Self
    where
        K: Into<NodeKey>,
    {
        self.result_node_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn build(&self) -> TaskGraphExecutorProperties {
        TaskGraphExecutorProperties {
            stop_on_failure: self.stop_on_failure,
            deliver_result_on_failure: self.deliver_result_on_failure,
            compute_error_handler: Arc::clone(&self.compute_error_handler),
            result_node_keys: self.result_node_keys.clone(),
        }
    }
}
