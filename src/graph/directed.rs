use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::CycleError;

/// An immutable directed graph mapping each node to its children.
///
/// Only nodes that have children, or are the child of some node, are part
/// of the graph. Any other node is treated as a node without children, so
/// queries never fail on unknown nodes. Children are kept in the order in
/// which they were added to the builder.
#[derive(Debug, Clone)]
pub struct DirectedGraph<N> {
    graph: DiGraph<N, ()>,
    indices: HashMap<N, NodeIndex>,
    parents: Vec<NodeIndex>,
}

impl<N> DirectedGraph<N>
where
    N: Clone + Eq + Hash,
{
    pub fn builder() -> DirectedGraphBuilder<N> {
        DirectedGraphBuilder::new()
    }

    pub fn empty() -> Self {
        Self {
            graph: DiGraph::new(),
            indices: HashMap::new(),
            parents: Vec::new(),
        }
    }

    pub fn contains(&self, node: &N) -> bool {
        self.indices.contains_key(node)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Nodes having at least one child, in insertion order.
    pub fn nodes_with_children(&self) -> impl Iterator<Item = &N> {
        self.parents.iter().map(|&i| &self.graph[i])
    }

    pub fn has_children(&self, node: &N) -> bool {
        self.indices.get(node).is_some_and(|&i| {
            self.graph
                .neighbors_directed(i, Direction::Outgoing)
                .next()
                .is_some()
        })
    }

    pub fn children(&self, node: &N) -> Vec<&N> {
        match self.indices.get(node) {
            Some(&i) => self
                .child_indices(i)
                .into_iter()
                .map(|c| &self.graph[c])
                .collect(),
            None => Vec::new(),
        }
    }

    // petgraph yields the most recently added edge first.
    fn child_indices(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut children: Vec<_> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        children.reverse();
        children
    }

    /// Builds the graph in which every edge points the other way.
    pub fn reverse_graph(&self) -> Self {
        let mut builder = DirectedGraphBuilder::new();
        for &parent in &self.parents {
            for child in self.child_indices(parent) {
                builder
                    .add_node(self.graph[child].clone())
                    .add_child(self.graph[parent].clone());
            }
        }
        builder.build()
    }

    /// Fails with the first cycle found, listed from the repeated node back
    /// to itself.
    pub fn check_not_cyclic(&self) -> Result<(), CycleError<N>>
    where
        N: Debug,
    {
        let mut done = vec![false; self.graph.node_count()];
        let mut on_path = vec![false; self.graph.node_count()];

        for &start in &self.parents {
            if done[start.index()] {
                continue;
            }

            let mut path = vec![start];
            let mut stack = vec![(start, self.child_indices(start), 0usize)];
            on_path[start.index()] = true;

            while let Some((node, children, next)) = stack.last_mut() {
                let Some(&child) = children.get(*next) else {
                    on_path[node.index()] = false;
                    done[node.index()] = true;
                    path.pop();
                    stack.pop();
                    continue;
                };
                *next += 1;

                if on_path[child.index()] {
                    let from = path.iter().position(|&n| n == child).unwrap_or(0);
                    let cycle = path[from..]
                        .iter()
                        .chain(std::iter::once(&child))
                        .map(|&n| self.graph[n].clone())
                        .collect();
                    return Err(CycleError { cycle });
                }
                if done[child.index()] {
                    continue;
                }

                on_path[child.index()] = true;
                path.push(child);
                stack.push((child, self.child_indices(child), 0));
            }
        }

        Ok(())
    }

    /// For every root, finds the leaves (nodes without children) reachable
    /// from it and records the root under each of those leaves. A root
    /// without children is its own leaf.
    pub fn get_all_leaf_to_root_nodes<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a N>,
    ) -> IndexMap<N, IndexSet<N>>
    where
        N: 'a,
    {
        let mut result: IndexMap<N, IndexSet<N>> = IndexMap::new();

        for root in roots {
            let Some(&start) = self.indices.get(root) else {
                result.entry(root.clone()).or_default().insert(root.clone());
                continue;
            };

            let mut visited = HashSet::new();
            let mut stack = vec![start];
            while let Some(node) = stack.pop() {
                if !visited.insert(node) {
                    continue;
                }
                let children = self.child_indices(node);
                if children.is_empty() {
                    result
                        .entry(self.graph[node].clone())
                        .or_default()
                        .insert(root.clone());
                } else {
                    stack.extend(children.into_iter().rev());
                }
            }
        }

        result
    }

    /// Every node reachable from the given roots, roots included, in
    /// depth-first pre-order.
    pub fn reachable_nodes<'a>(&self, roots: impl IntoIterator<Item = &'a N>) -> IndexSet<N>
    where
        N: 'a,
    {
        let mut result = IndexSet::new();
        let mut stack = Vec::new();

        for root in roots {
            let Some(&start) = self.indices.get(root) else {
                result.insert(root.clone());
                continue;
            };
            stack.push(start);
            while let Some(node) = stack.pop() {
                if result.insert(self.graph[node].clone()) {
                    stack.extend(self.child_indices(node).into_iter().rev());
                }
            }
        }

        result
    }

    /// Orders the nodes accepted by `to_sort` in depth-first post-order
    /// starting from `roots`: every node comes before its ancestors and the
    /// nodes below one child stay grouped together.
    pub fn sort_recursively<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a N>,
        to_sort: impl Fn(&N) -> bool,
    ) -> Vec<N>
    where
        N: 'a,
    {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut detached = HashSet::new();

        for root in roots {
            let Some(&start) = self.indices.get(root) else {
                if to_sort(root) && detached.insert(root) {
                    result.push(root.clone());
                }
                continue;
            };

            let mut stack = vec![(start, false)];
            while let Some((node, expanded)) = stack.pop() {
                if expanded {
                    if to_sort(&self.graph[node]) {
                        result.push(self.graph[node].clone());
                    }
                    continue;
                }
                if !visited.insert(node) {
                    continue;
                }
                stack.push((node, true));
                for child in self.child_indices(node).into_iter().rev() {
                    if !visited.contains(&child) {
                        stack.push((child, false));
                    }
                }
            }
        }

        result
    }
}

/// Collects edges for a [`DirectedGraph`].
#[derive(Debug, Clone)]
pub struct DirectedGraphBuilder<N> {
    children: IndexMap<N, IndexSet<N>>,
}

impl<N> DirectedGraphBuilder<N>
where
    N: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            children: IndexMap::new(),
        }
    }

    pub fn add_node(&mut self, node: N) -> ChildrenBuilder<'_, N> {
        ChildrenBuilder {
            children: self.children.entry(node).or_default(),
        }
    }

    pub fn add_node_with_children(&mut self, node: N, children: impl IntoIterator<Item = N>) {
        self.children.entry(node).or_default().extend(children);
    }

    /// Nodes added so far, children excluded, in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.children.keys()
    }

    pub fn build(&self) -> DirectedGraph<N> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        let mut parents = Vec::new();

        let mut index_of = |graph: &mut DiGraph<N, ()>, node: &N| {
            *indices
                .entry(node.clone())
                .or_insert_with(|| graph.add_node(node.clone()))
        };

        for (node, children) in &self.children {
            if children.is_empty() {
                continue;
            }
            let parent = index_of(&mut graph, node);
            parents.push(parent);
            for child in children {
                let child = index_of(&mut graph, child);
                graph.add_edge(parent, child, ());
            }
        }

        DirectedGraph {
            graph,
            indices,
            parents,
        }
    }
}

impl<N> Default for DirectedGraphBuilder<N>
where
    N: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Adds children to a single node of a [`DirectedGraphBuilder`].
pub struct ChildrenBuilder<'a, N> {
    children: &'a mut IndexSet<N>,
}

impl<N> ChildrenBuilder<'_, N>
where
    N: Clone + Eq + Hash,
{
    pub fn add_child(&mut self, child: N) -> &mut Self {
        self.children.insert(child);
        self
    }

    pub fn add_children(&mut self, children: impl IntoIterator<Item = N>) -> &mut Self {
        self.children.extend(children);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&'static str, &[&'static str])]) -> DirectedGraph<&'static str> {
        let mut builder = DirectedGraph::builder();
        for (node, children) in edges {
            builder.add_node_with_children(*node, children.iter().copied());
        }
        builder.build()
    }

    fn assert_valid_cycle(graph: &DirectedGraph<&'static str>, cycle: &[&'static str]) {
        assert!(cycle.len() >= 2, "cycle too short: {cycle:?}");
        assert_eq!(cycle.first(), cycle.last());
        for pair in cycle.windows(2) {
            assert!(
                graph.children(&pair[0]).contains(&&pair[1]),
                "{} -> {} is not an edge",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_empty_children_are_not_stored() {
        let g = graph(&[("a", &[]), ("b", &["c"])]);
        assert!(!g.contains(&"a"));
        assert!(g.contains(&"c"));
        assert!(g.has_children(&"b"));
        assert!(!g.has_children(&"c"));
        assert!(g.children(&"a").is_empty());
    }

    #[test]
    fn test_children_keep_insertion_order() {
        let mut builder = DirectedGraph::builder();
        builder.add_node("root").add_child("x").add_child("a").add_children(["m", "b"]);
        let g = builder.build();
        assert_eq!(g.children(&"root"), vec![&"x", &"a", &"m", &"b"]);
    }

    #[test]
    fn test_acyclic_passes() {
        let g = graph(&[
            ("a", &["b", "c"]),
            ("b", &["d"]),
            ("c", &["d"]),
            ("d", &["e"]),
        ]);
        assert_eq!(g.check_not_cyclic(), Ok(()));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let g = graph(&[("a", &["a"])]);
        let err = g.check_not_cyclic().unwrap_err();
        assert_eq!(err.cycle, vec!["a", "a"]);
    }

    #[test]
    fn test_reports_cycle_path() {
        let g = graph(&[
            ("root", &["x"]),
            ("x", &["y"]),
            ("y", &["z"]),
            ("z", &["x", "w"]),
        ]);
        let err = g.check_not_cyclic().unwrap_err();
        assert_valid_cycle(&g, &err.cycle);
        assert_eq!(err.cycle.len(), 4);
        assert!(!err.cycle.contains(&"root"));
    }

    #[test]
    fn test_cycle_in_second_component() {
        let g = graph(&[("a", &["b"]), ("p", &["q"]), ("q", &["r"]), ("r", &["p"])]);
        let err = g.check_not_cyclic().unwrap_err();
        assert_valid_cycle(&g, &err.cycle);
    }

    #[test]
    fn test_long_chain_does_not_recurse() {
        let names: Vec<String> = (0..100_000).map(|i| i.to_string()).collect();
        let mut builder = DirectedGraph::builder();
        for pair in names.windows(2) {
            builder.add_node_with_children(pair[0].clone(), [pair[1].clone()]);
        }
        assert!(builder.build().check_not_cyclic().is_ok());

        builder.add_node_with_children(names[names.len() - 1].clone(), [names[0].clone()]);
        let err = builder.build().check_not_cyclic().unwrap_err();
        assert_eq!(err.cycle.len(), names.len() + 1);
    }

    #[test]
    fn test_reverse_graph() {
        let g = graph(&[("a", &["b", "c"]), ("b", &["c"])]);
        let r = g.reverse_graph();
        assert_eq!(r.children(&"c"), vec![&"a", &"b"]);
        assert_eq!(r.children(&"b"), vec![&"a"]);
        assert!(!r.has_children(&"a"));
    }

    #[test]
    fn test_leaf_to_root_nodes() {
        let g = graph(&[
            ("root1", &["a", "b"]),
            ("root2", &["b", "c"]),
            ("a", &["leaf1"]),
            ("b", &["leaf1", "leaf2"]),
        ]);
        let map = g.get_all_leaf_to_root_nodes(&["root1", "root2", "alone"]);

        let roots = |leaf: &str| -> Vec<&str> { map[leaf].iter().copied().collect() };
        assert_eq!(roots("leaf1"), vec!["root1", "root2"]);
        assert_eq!(roots("leaf2"), vec!["root1", "root2"]);
        assert_eq!(roots("c"), vec!["root2"]);
        assert_eq!(roots("alone"), vec!["alone"]);
        assert!(!map.contains_key("a"));
    }

    #[test]
    fn test_reachable_nodes() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("x", &["y"])]);
        let reached: Vec<_> = g.reachable_nodes(&["a"]).into_iter().collect();
        assert_eq!(reached, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sort_recursively_groups_subtrees() {
        let g = graph(&[
            ("root", &["child1", "child2"]),
            ("child1", &["leaf1", "leaf2"]),
            ("child2", &["leaf3", "leaf4"]),
        ]);
        let sorted = g.sort_recursively(&["root"], |_| true);
        assert_eq!(
            sorted,
            vec!["leaf1", "leaf2", "child1", "leaf3", "leaf4", "child2", "root"]
        );

        let leafs = g.sort_recursively(&["root"], |n| n.starts_with("leaf"));
        assert_eq!(leafs, vec!["leaf1", "leaf2", "leaf3", "leaf4"]);
    }

    #[test]
    fn test_sort_recursively_shared_nodes_once() {
        let g = graph(&[("r1", &["shared", "x"]), ("r2", &["shared", "y"])]);
        let sorted = g.sort_recursively(&["r1", "r2"], |_| true);
        assert_eq!(sorted, vec!["shared", "x", "r1", "y", "r2"]);
    }
}
