use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use indexmap::{IndexMap, IndexSet};
use tokio_util::sync::CancellationToken;

use crate::engine::{BuildFuture, Completion, TaskGraphExecutor, TaskGraphExecutorFactory, TaskNode};
use crate::error::{BuildError, GraphError, is_benign_cancellation};
use crate::event::lock;
use crate::factory::{FactoryConfig, TaskFactoryGroupConfigurer, TaskInputBinder};
use crate::graph::{DependencyDag, DirectedGraphBuilder};
use crate::key::{FactoryKey, NodeKey};
use crate::properties::{
    TaskFactoryProperties, TaskGraphBuilderProperties, TaskGraphBuilderPropertiesBuilder,
    notify_error_handler,
};

/// Collects the requested nodes and builds the graph needed to compute them.
///
/// Obtained from [`TaskGraphDefConfigurer::build`](crate::TaskGraphDefConfigurer::build).
/// The builder itself is reusable: every call to
/// [`build_graph`](Self::build_graph) creates fresh nodes.
pub struct CollectingTaskGraphBuilder {
    factory_defs: Arc<IndexMap<FactoryKey, Arc<dyn FactoryConfig>>>,
    properties: TaskGraphBuilderPropertiesBuilder,
    executor_factory: Arc<dyn TaskGraphExecutorFactory>,
    node_keys: IndexSet<NodeKey>,
}

impl CollectingTaskGraphBuilder {
    pub(crate) fn new(
        factory_defs: IndexMap<FactoryKey, Arc<dyn FactoryConfig>>,
        executor_factory: Arc<dyn TaskGraphExecutorFactory>,
    ) -> Self {
        Self {
            factory_defs: Arc::new(factory_defs),
            properties: TaskGraphBuilderPropertiesBuilder::new(),
            executor_factory,
            node_keys: IndexSet::new(),
        }
    }

    pub fn properties(&mut self) -> &mut TaskGraphBuilderPropertiesBuilder {
        &mut self.properties
    }

    /// Requests the node `key` to be part of the graph.
    pub fn add_node(&mut self, key: impl Into<NodeKey>) -> Result<(), GraphError> {
        let key = key.into();
        if !self.factory_defs.contains_key(key.factory_key()) {
            return Err(GraphError::MissingFactory(key.factory_key().clone()));
        }
        if self.node_keys.contains(&key) {
            return Err(GraphError::DuplicateNode(key));
        }
        self.node_keys.insert(key);
        Ok(())
    }

    pub fn node_keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.node_keys.iter()
    }

    /// Creates every requested node and, recursively, all their inputs.
    ///
    /// The future resolves to the executor of the graph once every node is
    /// created. It fails on the first node which cannot be created, if the
    /// graph turns out to be cyclic, or if `cancel` is triggered first.
    pub fn build_graph(&self, cancel: &CancellationToken) -> BuildFuture {
        let properties = self.properties.build();

        let mut groups: HashMap<usize, Arc<FactoryGroup>> = HashMap::new();
        let factory_defs = self
            .factory_defs
            .iter()
            .map(|(key, config)| {
                let configurer = config.configurer();
                let group = groups
                    .entry(configurer.id())
                    .or_insert_with(|| Arc::new(FactoryGroup::new(configurer.clone())));
                let def = FactoryDef {
                    config: Arc::clone(config),
                    group: Arc::clone(group),
                };
                (key.clone(), def)
            })
            .collect();

        let (result, receiver) = Completion::new();
        let build = Arc::new(GraphBuild {
            factory_defs,
            properties,
            cancel: cancel.child_token(),
            nodes: DashMap::new(),
            dag_builder: Mutex::new(DirectedGraphBuilder::new()),
            outstanding_builds: AtomicUsize::new(0),
            executor_factory: Arc::clone(&self.executor_factory),
            result,
        });

        tracing::debug!(nodes = self.node_keys.len(), "Building task graph");
        build.build(self.node_keys.iter().cloned());

        receiver
            .map(|result| result.unwrap_or(Err(BuildError::Canceled)))
            .boxed()
    }
}

impl fmt::Debug for CollectingTaskGraphBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectingTaskGraphBuilder")
            .field("factories", &self.factory_defs.keys().collect::<Vec<_>>())
            .field("node_keys", &self.node_keys)
            .finish_non_exhaustive()
    }
}

/// Factories sharing a configurer. Their properties are computed the
/// first time any of them is used.
struct FactoryGroup {
    configurer: TaskFactoryGroupConfigurer,
    properties: OnceLock<TaskFactoryProperties>,
}

impl FactoryGroup {
    fn new(configurer: TaskFactoryGroupConfigurer) -> Self {
        Self {
            configurer,
            properties: OnceLock::new(),
        }
    }

    fn properties(&self, defaults: &TaskFactoryProperties) -> &TaskFactoryProperties {
        self.properties.get_or_init(|| {
            let mut builder = defaults.to_builder();
            self.configurer.configure(&mut builder);
            builder.build()
        })
    }
}

struct FactoryDef {
    config: Arc<dyn FactoryConfig>,
    group: Arc<FactoryGroup>,
}

type BuildResult = Result<Box<dyn TaskGraphExecutor>, BuildError>;

/// State of a single run of [`CollectingTaskGraphBuilder::build_graph`].
pub(crate) struct GraphBuild {
    factory_defs: HashMap<FactoryKey, FactoryDef>,
    properties: TaskGraphBuilderProperties,
    cancel: CancellationToken,
    nodes: DashMap<NodeKey, Arc<TaskNode>>,
    dag_builder: Mutex<DirectedGraphBuilder<NodeKey>>,
    /// Node creations still running, plus one while a batch of keys is
    /// being added.
    outstanding_builds: AtomicUsize,
    executor_factory: Arc<dyn TaskGraphExecutorFactory>,
    result: Completion<BuildResult>,
}

impl GraphBuild {
    fn build(self: &Arc<Self>, keys: impl IntoIterator<Item = NodeKey>) {
        self.outstanding_builds.fetch_add(1, Ordering::AcqRel);
        for key in keys {
            if let Err(err) = self.add_and_build_node(key) {
                self.cancel.cancel();
                self.result.complete(Err(err.into()));
                return;
            }
        }
        self.release();
    }

    /// Returns the node of `key`, creating it on first use.
    pub fn add_and_build_node(self: &Arc<Self>, key: NodeKey) -> Result<Arc<TaskNode>, GraphError> {
        let def = self
            .factory_defs
            .get(key.factory_key())
            .ok_or_else(|| GraphError::MissingFactory(key.factory_key().clone()))?;

        let node = match self.nodes.entry(key) {
            Entry::Occupied(entry) => return Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let node = Arc::new(TaskNode::new(entry.key().clone()));
                entry.insert(Arc::clone(&node));
                node
            }
        };

        self.build_children(def, Arc::clone(&node));
        Ok(node)
    }

    fn build_children(self: &Arc<Self>, def: &FactoryDef, node: Arc<TaskNode>) {
        let factory_properties = def
            .group
            .properties(self.properties.default_factory_properties())
            .clone();
        let executor = factory_properties
            .factory_executor()
            .cloned()
            .unwrap_or_else(|| Arc::clone(self.properties.graph_builder_executor()));

        self.outstanding_builds.fetch_add(1, Ordering::AcqRel);

        let build = Arc::clone(self);
        let finished = Arc::clone(self);
        let config = Arc::clone(&def.config);
        let key = node.key().clone();
        executor.execute(
            &self.cancel,
            Box::new(move |cancel| {
                let inputs = TaskInputBinder::new(Arc::clone(&build));
                let (task, input_keys) =
                    config.create_task_node(cancel, &factory_properties, node.key(), inputs)?;
                node.set_task(task);
                lock(&build.dag_builder).add_node_with_children(node.key().clone(), input_keys);
                Ok(())
            }),
            Box::new(move |canceled, error| match error {
                Some(error) if is_benign_cancellation(canceled, &error) => finished.on_cancel(),
                Some(error) => finished.on_error(key, error),
                None => finished.release(),
            }),
        );
    }

    fn release(&self) {
        if self.outstanding_builds.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.on_success();
        }
    }

    fn on_cancel(&self) {
        self.result.complete(Err(BuildError::Canceled));
    }

    fn on_error(&self, key: NodeKey, error: anyhow::Error) {
        self.cancel.cancel();
        notify_error_handler(self.properties.node_create_error_handler(), &key, &error);
        self.result.complete(Err(BuildError::NodeCreate { key, error }));
    }

    fn on_success(&self) {
        if self.cancel.is_cancelled() {
            self.on_cancel();
            return;
        }
        let result = self.create_executor();
        if let Err(err) = &result {
            tracing::error!("Failed to build task graph: {err}");
        }
        self.result.complete(result);
    }

    fn create_executor(&self) -> BuildResult {
        let dag_builder = lock(&self.dag_builder);
        let graph = DependencyDag::new(dag_builder.build())?;
        let nodes: Vec<_> = dag_builder
            .nodes()
            .filter_map(|key| self.nodes.get(key).map(|node| Arc::clone(node.value())))
            .collect();
        drop(dag_builder);

        tracing::debug!(nodes = nodes.len(), "Task graph built");
        self.executor_factory
            .create_executor(graph, nodes)
            .map_err(BuildError::Executor)
    }
}
