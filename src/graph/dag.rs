use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::error::CycleError;
use crate::graph::DirectedGraph;

/// A dependency graph known to be acyclic, together with its forward
/// graph (the same edges pointing from a dependency to its dependents).
#[derive(Debug)]
pub struct DependencyDag<N> {
    dependency_graph: Arc<DirectedGraph<N>>,
    forward_graph: Arc<DirectedGraph<N>>,
}

impl<N> Clone for DependencyDag<N> {
    fn clone(&self) -> Self {
        Self {
            dependency_graph: Arc::clone(&self.dependency_graph),
            forward_graph: Arc::clone(&self.forward_graph),
        }
    }
}

impl<N> DependencyDag<N>
where
    N: Clone + Eq + Hash + Debug,
{
    pub fn new(dependency_graph: DirectedGraph<N>) -> Result<Self, CycleError<N>> {
        dependency_graph.check_not_cyclic()?;
        let forward_graph = dependency_graph.reverse_graph();
        Ok(Self {
            dependency_graph: Arc::new(dependency_graph),
            forward_graph: Arc::new(forward_graph),
        })
    }

    /// Node to the nodes it depends on.
    pub fn dependency_graph(&self) -> &DirectedGraph<N> {
        &self.dependency_graph
    }

    /// Node to the nodes depending on it.
    pub fn forward_graph(&self) -> &DirectedGraph<N> {
        &self.forward_graph
    }

    /// The same dag with the role of the two graphs swapped.
    pub fn reverse(&self) -> Self {
        Self {
            dependency_graph: Arc::clone(&self.forward_graph),
            forward_graph: Arc::clone(&self.dependency_graph),
        }
    }

    /// Whether nothing depends on `node`.
    pub fn is_end_node(&self, node: &N) -> bool {
        !self.forward_graph.has_children(node)
    }

    pub fn get_all_leaf_to_root_nodes<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a N>,
    ) -> IndexMap<N, IndexSet<N>>
    where
        N: 'a,
    {
        self.dependency_graph.get_all_leaf_to_root_nodes(roots)
    }
}
