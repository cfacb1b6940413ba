//! Dependency structure of a task graph.

mod dag;
mod directed;

pub use dag::DependencyDag;
pub use directed::{ChildrenBuilder, DirectedGraph, DirectedGraphBuilder};
