//! Strategies deciding when nodes may start computing.
//!
//! Executing a graph eagerly can keep a lot of intermediate results alive at
//! once. A [`TaskExecutionRestrictionStrategy`] holds nodes back until it
//! releases them, letting the restrictable executor bound how much work is
//! in flight.

mod weak_leafs;

use std::fmt;
use std::sync::Arc;

use crate::event::RunOnce;
use crate::graph::DependencyDag;
use crate::key::NodeKey;

pub use weak_leafs::WeakLeafsOfEndNodeRestrictingStrategy;

/// Creates the strategy for one execution.
pub trait TaskExecutionRestrictionStrategyFactory: Send + Sync {
    /// `nodes` holds every node of `graph`. None of them may start before
    /// it is released, and every node must eventually be released.
    fn build_strategy(
        &self,
        graph: &DependencyDag<NodeKey>,
        nodes: Vec<RestrictableNode>,
    ) -> Box<dyn TaskExecutionRestrictionStrategy>;
}

pub trait TaskExecutionRestrictionStrategy: Send + Sync {
    /// Called once for every node when it finishes, whether it produced a
    /// result or not.
    fn set_node_computed(&self, key: &NodeKey);
}

/// A node held back until [`release`](Self::release) is called.
#[derive(Clone)]
pub struct RestrictableNode {
    key: NodeKey,
    release: Arc<RunOnce>,
}

impl RestrictableNode {
    pub fn new(key: NodeKey, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            key,
            release: Arc::new(RunOnce::new(release)),
        }
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// Allows the node to start. Calls after the first have no effect.
    pub fn release(&self) {
        self.release.run();
    }
}

impl fmt::Debug for RestrictableNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestrictableNode")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Releases every node right away.
#[derive(Debug, Clone, Copy, Default)]
pub struct EagerRestrictionStrategy;

impl TaskExecutionRestrictionStrategyFactory for EagerRestrictionStrategy {
    fn build_strategy(
        &self,
        _graph: &DependencyDag<NodeKey>,
        nodes: Vec<RestrictableNode>,
    ) -> Box<dyn TaskExecutionRestrictionStrategy> {
        nodes.iter().for_each(RestrictableNode::release);
        Box::new(EagerRestrictionStrategy)
    }
}

impl TaskExecutionRestrictionStrategy for EagerRestrictionStrategy {
    fn set_node_computed(&self, _key: &NodeKey) {}
}
