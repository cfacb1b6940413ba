use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::engine::{CollectingTaskGraphBuilder, TaskGraphExecutorFactory, TaskGraphExecutors};
use crate::factory::{
    FactoryConfig, NodeTask, TaskFactory, TaskFactoryConfig, TaskFactoryGroupConfigurer,
    TaskNodeCreateArgs,
};
use crate::key::{FactoryKey, KeyValue, TaskFactoryKey};
use crate::properties::TaskFactoryProperties;

/// Collects the factory definitions of a task graph.
///
/// ```
/// use taskgraph::{TaskFactoryGroupConfigurer, TaskFactoryKey, TaskGraphDefConfigurer, node_task};
///
/// let mut configurer = TaskGraphDefConfigurer::new();
/// configurer
///     .factory_group_definer(TaskFactoryGroupConfigurer::default())
///     .define_simple_factory(TaskFactoryKey::<u64, u64>::new(), |_, args| {
///         let n = *args.factory_arg();
///         Ok(node_task(move |_| Ok(n * n)))
///     });
/// let builder = configurer.build();
/// ```
pub struct TaskGraphDefConfigurer {
    factory_defs: IndexMap<FactoryKey, Arc<dyn FactoryConfig>>,
    executor_factory: Arc<dyn TaskGraphExecutorFactory>,
}

impl TaskGraphDefConfigurer {
    /// A configurer without factories, executing graphs with
    /// [`TaskGraphExecutors::unrestricted`].
    pub fn new() -> Self {
        Self {
            factory_defs: IndexMap::new(),
            executor_factory: TaskGraphExecutors::unrestricted(),
        }
    }

    pub fn with_executor_factory(&mut self, executor_factory: Arc<dyn TaskGraphExecutorFactory>) -> &mut Self {
        self.executor_factory = executor_factory;
        self
    }

    /// Defines factories belonging to the group of `configurer`.
    pub fn factory_group_definer(&mut self, configurer: TaskFactoryGroupConfigurer) -> TaskFactoryDefiner<'_> {
        TaskFactoryDefiner {
            definitions: self,
            configurer,
        }
    }

    /// A builder over a snapshot of the factories defined so far.
    pub fn build(&self) -> CollectingTaskGraphBuilder {
        CollectingTaskGraphBuilder::new(self.factory_defs.clone(), Arc::clone(&self.executor_factory))
    }

    fn define(&mut self, config: Arc<dyn FactoryConfig>) -> bool {
        let key = config.factory_key();
        let replaced = self.factory_defs.insert(key.clone(), config).is_some();
        if replaced {
            tracing::warn!(%key, "Factory definition replaced");
        }
        replaced
    }
}

impl Default for TaskGraphDefConfigurer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskGraphDefConfigurer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGraphDefConfigurer")
            .field("factories", &self.factory_defs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Defines factories sharing one [`TaskFactoryGroupConfigurer`].
pub struct TaskFactoryDefiner<'a> {
    definitions: &'a mut TaskGraphDefConfigurer,
    configurer: TaskFactoryGroupConfigurer,
}

impl TaskFactoryDefiner<'_> {
    /// Defines the factory of `key`. Each time a node of this factory is
    /// created, `setup` makes a factory from the properties of the group.
    /// Returns `true` if an earlier definition of the same key was replaced.
    pub fn define_factory<R, I, S, F>(&mut self, key: TaskFactoryKey<R, I>, setup: S) -> bool
    where
        R: Send + Sync + 'static,
        I: KeyValue + Clone,
        S: Fn(&TaskFactoryProperties) -> anyhow::Result<F> + Send + Sync + 'static,
        F: TaskFactory<R, I> + 'static,
    {
        let config = TaskFactoryConfig::new(key, self.configurer.clone(), setup);
        self.definitions.define(Arc::new(config))
    }

    /// Defines the factory of `key` without any setup step.
    pub fn define_simple_factory<R, I, F>(&mut self, key: TaskFactoryKey<R, I>, factory: F) -> bool
    where
        R: Send + Sync + 'static,
        I: KeyValue + Clone,
        F: Fn(&CancellationToken, &mut TaskNodeCreateArgs<I>) -> anyhow::Result<NodeTask<R>>
            + Send
            + Sync
            + 'static,
    {
        let factory = Arc::new(factory);
        self.define_factory(key, move |_: &TaskFactoryProperties| {
            Ok(SharedFactory(Arc::clone(&factory)))
        })
    }
}

impl fmt::Debug for TaskFactoryDefiner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFactoryDefiner")
            .field("configurer", &self.configurer)
            .finish_non_exhaustive()
    }
}

struct SharedFactory<F>(Arc<F>);

impl<R, I, F> TaskFactory<R, I> for SharedFactory<F>
where
    F: TaskFactory<R, I>,
{
    fn create_task_node(
        &self,
        cancel: &CancellationToken,
        args: &mut TaskNodeCreateArgs<I>,
    ) -> anyhow::Result<NodeTask<R>> {
        self.0.create_task_node(cancel, args)
    }
}
