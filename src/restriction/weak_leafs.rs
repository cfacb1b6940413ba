use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use indexmap::{IndexMap, IndexSet};

use super::{RestrictableNode, TaskExecutionRestrictionStrategy, TaskExecutionRestrictionStrategyFactory};
use crate::event::lock;
use crate::graph::DependencyDag;
use crate::key::NodeKey;

type QueueSorter = Arc<dyn Fn(&mut Vec<NodeKey>) + Send + Sync>;

/// Limits how many leaf nodes are kept alive at once.
///
/// Nodes with dependencies are released immediately, they cannot start
/// before their inputs anyway. Leaf nodes, which could all start right
/// away, are released per end node: releasing an end node releases every
/// leaf it needs. A released leaf is *retained* until all end nodes needing
/// it are done, and end nodes keep being released only while fewer leaves
/// than the limit are retained. End nodes sharing leaves with the ones
/// already released are preferred, so retained leaves are let go sooner.
///
/// The limit is soft: at least one end node is always in progress, even if
/// it alone needs more leaves than the limit.
#[derive(Clone)]
pub struct WeakLeafsOfEndNodeRestrictingStrategy {
    max_retained_leafs: NonZeroUsize,
    queue_sorter: Option<QueueSorter>,
}

impl WeakLeafsOfEndNodeRestrictingStrategy {
    pub fn new(max_retained_leafs: NonZeroUsize) -> Self {
        Self {
            max_retained_leafs,
            queue_sorter: None,
        }
    }

    /// Reorders the end nodes before any of them is released. Without a
    /// sorter, end nodes are released in the order their leaves are found.
    pub fn with_queue_sorter<F>(mut self, sorter: F) -> Self
    where
        F: Fn(&mut Vec<NodeKey>) + Send + Sync + 'static,
    {
        self.queue_sorter = Some(Arc::new(sorter));
        self
    }
}

impl fmt::Debug for WeakLeafsOfEndNodeRestrictingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakLeafsOfEndNodeRestrictingStrategy")
            .field("max_retained_leafs", &self.max_retained_leafs)
            .field("sorted", &self.queue_sorter.is_some())
            .finish()
    }
}

impl TaskExecutionRestrictionStrategyFactory for WeakLeafsOfEndNodeRestrictingStrategy {
    fn build_strategy(
        &self,
        graph: &DependencyDag<NodeKey>,
        nodes: Vec<RestrictableNode>,
    ) -> Box<dyn TaskExecutionRestrictionStrategy> {
        let dependency_graph = graph.dependency_graph();

        let mut leaf_releases = HashMap::new();
        let mut end_nodes = IndexSet::new();
        for node in nodes {
            if graph.is_end_node(node.key()) {
                end_nodes.insert(node.key().clone());
            }
            if dependency_graph.has_children(node.key()) {
                node.release();
            } else {
                leaf_releases.insert(node.key().clone(), node);
            }
        }

        let sorted_leafs = dependency_graph.sort_recursively(&end_nodes, |key| leaf_releases.contains_key(key));
        let end_nodes_to_leafs = graph.forward_graph().get_all_leaf_to_root_nodes(&sorted_leafs);
        let leafs_to_end_nodes = dependency_graph.get_all_leaf_to_root_nodes(&end_nodes);

        let mut queue: Vec<_> = end_nodes_to_leafs.keys().cloned().collect();
        if let Some(sorter) = &self.queue_sorter {
            sorter(&mut queue);
        }

        tracing::debug!(
            end_nodes = queue.len(),
            leafs = leaf_releases.len(),
            max_retained_leafs = self.max_retained_leafs.get(),
            "Restricting leaf nodes of end nodes"
        );

        let strategy = LeafRestriction {
            max_retained_leafs: self.max_retained_leafs.get(),
            end_nodes_to_leafs,
            leafs_to_end_nodes,
            state: Mutex::new(State {
                leaf_releases,
                queue: EndNodeQueue::from_iter(queue),
                retaining: EndNodeQueue::default(),
                computed: HashSet::new(),
                released_not_computed: HashSet::new(),
                scheduled_leafs: HashMap::new(),
            }),
        };

        let mut releases = Vec::new();
        strategy.schedule(&mut lock(&strategy.state), &mut releases);
        releases.iter().for_each(RestrictableNode::release);

        Box::new(strategy)
    }
}

/// Insertion ordered set of end nodes supporting cheap removal from the
/// front and from the middle. Removed keys are dropped from the order
/// lazily. A removed key pushed again is queued at the back.
#[derive(Default)]
struct EndNodeQueue {
    order: VecDeque<(u64, NodeKey)>,
    /// Queued keys with the sequence number of their live entry in `order`.
    queued: HashMap<NodeKey, u64>,
    next_seq: u64,
}

impl EndNodeQueue {
    fn push(&mut self, key: &NodeKey) {
        if self.queued.contains_key(key) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued.insert(key.clone(), seq);
        self.order.push_back((seq, key.clone()));
    }

    fn remove(&mut self, key: &NodeKey) {
        self.queued.remove(key);
    }

    fn poll(&mut self) -> Option<NodeKey> {
        while let Some((seq, key)) = self.order.pop_front() {
            if self.queued.get(&key) == Some(&seq) {
                self.queued.remove(&key);
                return Some(key);
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

impl FromIterator<NodeKey> for EndNodeQueue {
    fn from_iter<T: IntoIterator<Item = NodeKey>>(iter: T) -> Self {
        let mut queue = Self::default();
        for key in iter {
            queue.push(&key);
        }
        queue
    }
}

struct State {
    /// Leaves not released yet.
    leaf_releases: HashMap<NodeKey, RestrictableNode>,
    /// End nodes whose leaves were not released yet.
    queue: EndNodeQueue,
    /// Not yet released end nodes sharing a leaf with a released one.
    retaining: EndNodeQueue,
    computed: HashSet<NodeKey>,
    released_not_computed: HashSet<NodeKey>,
    /// Released leaves with the unfinished end nodes still needing them.
    scheduled_leafs: HashMap<NodeKey, HashSet<NodeKey>>,
}

impl State {
    fn poll_next_end_node(&mut self) -> Option<NodeKey> {
        match self.retaining.poll() {
            Some(end_node) => {
                self.queue.remove(&end_node);
                Some(end_node)
            }
            None => self.queue.poll(),
        }
    }
}

struct LeafRestriction {
    max_retained_leafs: usize,
    end_nodes_to_leafs: IndexMap<NodeKey, IndexSet<NodeKey>>,
    leafs_to_end_nodes: IndexMap<NodeKey, IndexSet<NodeKey>>,
    state: Mutex<State>,
}

impl LeafRestriction {
    fn schedule(&self, state: &mut State, releases: &mut Vec<RestrictableNode>) {
        // Nothing could ever finish otherwise.
        if state.released_not_computed.is_empty() {
            self.schedule_one(state, releases);
        }

        while !state.queue.is_empty() && state.scheduled_leafs.len() < self.max_retained_leafs {
            self.schedule_one(state, releases);
        }
    }

    fn schedule_one(&self, state: &mut State, releases: &mut Vec<RestrictableNode>) {
        let Some(end_node) = state.poll_next_end_node() else {
            return;
        };
        if !state.computed.contains(&end_node) {
            state.released_not_computed.insert(end_node.clone());
        }

        let Some(leafs) = self.end_nodes_to_leafs.get(&end_node) else {
            return;
        };
        for leaf in leafs {
            self.add_scheduled_leaf(state, leaf);
            if let Some(release) = state.leaf_releases.remove(leaf) {
                releases.push(release);
            }
        }
    }

    fn add_scheduled_leaf(&self, state: &mut State, leaf: &NodeKey) {
        let mut retaining = state.scheduled_leafs.remove(leaf).unwrap_or_default();

        for end_node in self.leafs_to_end_nodes.get(leaf).into_iter().flatten() {
            if state.computed.contains(end_node) {
                continue;
            }
            if !state.released_not_computed.contains(end_node) {
                state.retaining.push(end_node);
            }
            retaining.insert(end_node.clone());
        }

        if !retaining.is_empty() {
            state.scheduled_leafs.insert(leaf.clone(), retaining);
        }
    }
}

impl TaskExecutionRestrictionStrategy for LeafRestriction {
    fn set_node_computed(&self, key: &NodeKey) {
        let Some(leafs) = self.end_nodes_to_leafs.get(key) else {
            return;
        };

        let mut releases = Vec::new();
        {
            let mut state = lock(&self.state);
            state.computed.insert(key.clone());
            state.released_not_computed.remove(key);
            state.retaining.remove(key);

            for leaf in leafs {
                if let Some(retaining) = state.scheduled_leafs.get_mut(leaf) {
                    retaining.remove(key);
                    if retaining.is_empty() {
                        state.scheduled_leafs.remove(leaf);
                    }
                }
            }

            self.schedule(&mut state, &mut releases);
        }

        releases.iter().for_each(RestrictableNode::release);
    }
}
