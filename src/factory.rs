//! Factories creating the computations of nodes.
//!
//! A factory is registered under a [`TaskFactoryKey`]. Whenever the graph
//! needs a node of that key, the factory receives the node's argument and a
//! [`TaskInputBinder`]. Every input it binds becomes a dependency of the node
//! and is built recursively.

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use indexmap::IndexSet;
use tokio_util::sync::CancellationToken;

use crate::engine::{Dynamic, GraphBuild, NodeTaskRef, TaskNode};
use crate::error::{GraphError, ResultError};
use crate::event::lock;
use crate::key::{FactoryKey, KeyValue, NodeKey, TaskFactoryKey, TaskNodeKey};
use crate::properties::{TaskFactoryProperties, TaskFactoryPropertiesBuilder, TaskNodePropertiesBuilder};

/// The computation of a node producing `R`.
pub type NodeTask<R> = Box<dyn FnOnce(&CancellationToken) -> anyhow::Result<R> + Send>;

/// Boxes a closure as a [`NodeTask`].
pub fn node_task<R, F>(task: F) -> NodeTask<R>
where
    F: FnOnce(&CancellationToken) -> anyhow::Result<R> + Send + 'static,
{
    Box::new(task)
}

/// Creates the computation of nodes with results of type `R` from
/// arguments of type `I`.
pub trait TaskFactory<R, I>: Send + Sync {
    fn create_task_node(
        &self,
        cancel: &CancellationToken,
        args: &mut TaskNodeCreateArgs<I>,
    ) -> anyhow::Result<NodeTask<R>>;
}

impl<R, I, F> TaskFactory<R, I> for F
where
    F: Fn(&CancellationToken, &mut TaskNodeCreateArgs<I>) -> anyhow::Result<NodeTask<R>> + Send + Sync,
{
    fn create_task_node(
        &self,
        cancel: &CancellationToken,
        args: &mut TaskNodeCreateArgs<I>,
    ) -> anyhow::Result<NodeTask<R>> {
        self(cancel, args)
    }
}

/// Creates a [`TaskFactory`] from the properties of its group.
pub(crate) trait TaskFactorySetup<R, I>: Send + Sync {
    fn setup(&self, properties: &TaskFactoryProperties) -> anyhow::Result<Box<dyn TaskFactory<R, I>>>;
}

impl<R, I, S, F> TaskFactorySetup<R, I> for S
where
    S: Fn(&TaskFactoryProperties) -> anyhow::Result<F> + Send + Sync,
    F: TaskFactory<R, I> + 'static,
{
    fn setup(&self, properties: &TaskFactoryProperties) -> anyhow::Result<Box<dyn TaskFactory<R, I>>> {
        Ok(Box::new(self(properties)?))
    }
}

/// Adjusts the properties shared by a group of factories. Factories sharing
/// the same configurer (the same instance, not an equal one) form a group,
/// and the configurer runs at most once per group and build.
#[derive(Clone)]
pub struct TaskFactoryGroupConfigurer {
    configure: Arc<dyn Fn(&mut TaskFactoryPropertiesBuilder) + Send + Sync>,
}

impl TaskFactoryGroupConfigurer {
    pub fn new<F>(configure: F) -> Self
    where
        F: Fn(&mut TaskFactoryPropertiesBuilder) + Send + Sync + 'static,
    {
        Self {
            configure: Arc::new(configure),
        }
    }

    pub fn configure(&self, properties: &mut TaskFactoryPropertiesBuilder) {
        (self.configure)(properties);
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.configure) as *const () as usize
    }
}

impl Default for TaskFactoryGroupConfigurer {
    fn default() -> Self {
        Self::new(|_| {})
    }
}

impl fmt::Debug for TaskFactoryGroupConfigurer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskFactoryGroupConfigurer")
            .field(&self.id())
            .finish()
    }
}

/// A factory registration: its key, its group and how to set it up.
pub(crate) struct TaskFactoryConfig<R, I> {
    key: TaskFactoryKey<R, I>,
    configurer: TaskFactoryGroupConfigurer,
    setup: Arc<dyn TaskFactorySetup<R, I>>,
}

impl<R, I> TaskFactoryConfig<R, I>
where
    R: Send + Sync + 'static,
    I: KeyValue + Clone,
{
    pub fn new(
        key: TaskFactoryKey<R, I>,
        configurer: TaskFactoryGroupConfigurer,
        setup: impl TaskFactorySetup<R, I> + 'static,
    ) -> Self {
        Self {
            key,
            configurer,
            setup: Arc::new(setup),
        }
    }
}

/// [`TaskFactoryConfig`] with its types erased, as stored by the builder.
pub(crate) trait FactoryConfig: Send + Sync {
    fn factory_key(&self) -> FactoryKey;

    fn configurer(&self) -> &TaskFactoryGroupConfigurer;

    /// Creates the computation of the node `key`, returning it with the
    /// keys of the inputs it bound.
    fn create_task_node(
        &self,
        cancel: &CancellationToken,
        properties: &TaskFactoryProperties,
        key: &NodeKey,
        inputs: TaskInputBinder,
    ) -> anyhow::Result<(NodeTaskRef, Vec<NodeKey>)>;
}

impl<R, I> FactoryConfig for TaskFactoryConfig<R, I>
where
    R: Send + Sync + 'static,
    I: KeyValue + Clone,
{
    fn factory_key(&self) -> FactoryKey {
        self.key.erase()
    }

    fn configurer(&self) -> &TaskFactoryGroupConfigurer {
        &self.configurer
    }

    fn create_task_node(
        &self,
        cancel: &CancellationToken,
        properties: &TaskFactoryProperties,
        key: &NodeKey,
        inputs: TaskInputBinder,
    ) -> anyhow::Result<(NodeTaskRef, Vec<NodeKey>)> {
        let factory_arg = key.factory_arg::<I>().cloned().ok_or_else(|| {
            anyhow::anyhow!("Factory argument of {key} is not a {}", type_name::<I>())
        })?;

        let factory = self.setup.setup(properties)?;
        let mut args = TaskNodeCreateArgs {
            factory_arg,
            properties: properties.default_node_properties().to_builder(),
            inputs,
        };
        let task = factory.create_task_node(cancel, &mut args)?;

        let TaskNodeCreateArgs {
            properties, inputs, ..
        } = args;
        let task_ref = NodeTaskRef::new(
            properties.build(),
            Box::new(move |cancel| Ok(Arc::new(task(cancel)?) as Dynamic)),
        );
        Ok((task_ref, inputs.into_input_keys()))
    }
}

/// Everything a factory gets to create one node.
pub struct TaskNodeCreateArgs<I> {
    factory_arg: I,
    properties: TaskNodePropertiesBuilder,
    inputs: TaskInputBinder,
}

impl<I> TaskNodeCreateArgs<I> {
    pub fn factory_arg(&self) -> &I {
        &self.factory_arg
    }

    /// Properties of the node, starting from the defaults of the group.
    pub fn properties(&mut self) -> &mut TaskNodePropertiesBuilder {
        &mut self.properties
    }

    pub fn inputs(&mut self) -> &mut TaskInputBinder {
        &mut self.inputs
    }

    /// Shorthand for `self.inputs().bind_input(key)`.
    pub fn bind_input<R, J>(&mut self, key: &TaskNodeKey<R, J>) -> Result<TaskInputRef<R>, GraphError>
    where
        R: Send + Sync + 'static,
        J: KeyValue + Clone,
    {
        self.inputs.bind_input(key)
    }
}

/// Declares the inputs of the node being created.
///
/// The binder belongs to a single node creation and is consumed when the
/// factory returns, so inputs can only be bound from within the factory.
pub struct TaskInputBinder {
    build: Arc<GraphBuild>,
    input_keys: IndexSet<NodeKey>,
}

impl TaskInputBinder {
    pub(crate) fn new(build: Arc<GraphBuild>) -> Self {
        Self {
            build,
            input_keys: IndexSet::new(),
        }
    }

    /// Makes `key` a dependency of the node being created, building its
    /// node if it does not exist yet. Fails if no factory is defined for
    /// the key.
    pub fn bind_input<R, I>(&mut self, key: &TaskNodeKey<R, I>) -> Result<TaskInputRef<R>, GraphError>
    where
        R: Send + Sync + 'static,
        I: KeyValue + Clone,
    {
        let node = self.build.add_and_build_node(key.erase())?;
        self.input_keys.insert(node.key().clone());
        Ok(TaskInputRef::new(node))
    }

    pub(crate) fn into_input_keys(self) -> Vec<NodeKey> {
        self.input_keys.into_iter().collect()
    }
}

impl fmt::Debug for TaskInputBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInputBinder")
            .field("input_keys", &self.input_keys)
            .finish_non_exhaustive()
    }
}

/// Reads the result of one input, once. Consuming the input releases the
/// reference to its node, so intermediate results are not retained longer
/// than needed.
pub struct TaskInputRef<R> {
    key: NodeKey,
    node: Mutex<Option<Arc<TaskNode>>>,
    _phantom: PhantomData<fn() -> R>,
}

impl<R: Send + Sync + 'static> TaskInputRef<R> {
    fn new(node: Arc<TaskNode>) -> Self {
        Self {
            key: node.key().clone(),
            node: Mutex::new(Some(node)),
            _phantom: PhantomData,
        }
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn consume_input(&self) -> Result<Arc<R>, ResultError> {
        let node = lock(&self.node)
            .take()
            .ok_or_else(|| ResultError::InputConsumed(self.key.clone()))?;

        Arc::clone(node.get_result()?)
            .downcast::<R>()
            .map_err(|_| ResultError::TypeMismatch {
                key: self.key.clone(),
                expected: type_name::<R>(),
            })
    }
}

impl<R> fmt::Debug for TaskInputRef<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInputRef")
            .field("key", &self.key)
            .field("consumed", &lock(&self.node).is_none())
            .finish()
    }
}
