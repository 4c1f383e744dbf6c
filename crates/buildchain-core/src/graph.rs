//! Directed dependency graph with cycle detection and topological ordering.
//!
//! Edges are stored in both directions: `children` are the nodes a node
//! depends on, `parents` are the nodes that depend on it. Cycles are not
//! rejected while edges are added; call [`DependencyGraph::topological_sort`]
//! or [`DependencyGraph::has_cycle`] once the graph is complete.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

/// Index of a node inside a [`DependencyGraph`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("node#{_0}")]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Graph construction errors. Both are configuration bugs and never retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("dependency cycle detected at {0}")]
    Cycle(NodeId),
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    children: Vec<Vec<NodeId>>,
    parents: Vec<Vec<NodeId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with no edges.
    pub fn add_node(&mut self) -> NodeId {
        let id = NodeId(self.children.len());
        self.children.push(Vec::new());
        self.parents.push(Vec::new());
        id
    }

    /// Record that `from` depends on `to`. Adding the same edge twice is a no-op.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> GraphResult<()> {
        self.check(from)?;
        self.check(to)?;

        if self.children[from.0].contains(&to) {
            return Ok(());
        }
        self.children[from.0].push(to);
        self.parents[to.0].push(from);
        Ok(())
    }

    /// Nodes that `id` depends on.
    pub fn children(&self, id: NodeId) -> GraphResult<&[NodeId]> {
        self.check(id)?;
        Ok(&self.children[id.0])
    }

    /// Nodes that depend on `id`.
    pub fn parents(&self, id: NodeId) -> GraphResult<&[NodeId]> {
        self.check(id)?;
        Ok(&self.parents[id.0])
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.0 < self.children.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.children.len()).map(NodeId)
    }

    /// Order all nodes so that every node comes after everything it depends on.
    ///
    /// Kahn's algorithm over a scratch count of unresolved dependencies; the
    /// graph itself is left untouched. Ordering among nodes that become ready
    /// at the same time is not part of the contract.
    pub fn topological_sort(&self) -> GraphResult<Vec<NodeId>> {
        let mut unresolved: Vec<usize> = self.children.iter().map(Vec::len).collect();
        let mut ready: VecDeque<NodeId> = self
            .nodes()
            .filter(|node| unresolved[node.0] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = ready.pop_front() {
            order.push(node);
            for parent in &self.parents[node.0] {
                unresolved[parent.0] -= 1;
                if unresolved[parent.0] == 0 {
                    ready.push_back(*parent);
                }
            }
        }

        match self.nodes().find(|node| unresolved[node.0] > 0) {
            Some(stuck) => Err(GraphError::Cycle(self.node_on_cycle(stuck, &unresolved))),
            None => Ok(order),
        }
    }

    /// True if the graph contains at least one cycle.
    pub fn has_cycle(&self) -> bool {
        matches!(self.topological_sort(), Err(GraphError::Cycle(_)))
    }

    fn check(&self, id: NodeId) -> GraphResult<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(GraphError::UnknownNode(id))
        }
    }

    /// Every node left unresolved by Kahn's pass has at least one unresolved
    /// child, so following them must eventually revisit a node on a cycle.
    fn node_on_cycle(&self, start: NodeId, unresolved: &[usize]) -> NodeId {
        let mut seen = HashSet::new();
        let mut current = start;
        while seen.insert(current) {
            match self.children[current.0]
                .iter()
                .find(|child| unresolved[child.0] > 0)
            {
                Some(next) => current = *next,
                None => break,
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[NodeId], node: NodeId) -> usize {
        order.iter().position(|n| *n == node).unwrap()
    }

    #[test]
    fn test_add_edge_unknown_node() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node();
        let missing = NodeId(7);

        assert_eq!(
            graph.add_edge(a, missing),
            Err(GraphError::UnknownNode(missing))
        );
        assert_eq!(
            graph.add_edge(missing, a),
            Err(GraphError::UnknownNode(missing))
        );
    }

    #[test]
    fn test_adjacency() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node();
        let b = graph.add_node();
        graph.add_edge(a, b).unwrap();
        graph.add_edge(a, b).unwrap();

        assert_eq!(graph.children(a).unwrap(), &[b]);
        assert_eq!(graph.parents(b).unwrap(), &[a]);
        assert!(graph.children(b).unwrap().is_empty());
        assert!(graph.parents(a).unwrap().is_empty());
    }

    #[test]
    fn test_topological_sort_dependencies_first() {
        // deploy -> build, deploy -> test, test -> build, lint has no edges
        let mut graph = DependencyGraph::new();
        let build = graph.add_node();
        let test = graph.add_node();
        let deploy = graph.add_node();
        let lint = graph.add_node();
        graph.add_edge(deploy, test).unwrap();
        graph.add_edge(deploy, build).unwrap();
        graph.add_edge(test, build).unwrap();

        let order = graph.topological_sort().unwrap();
        assert_eq!(order.len(), 4);
        assert!(order.contains(&lint));
        for node in graph.nodes() {
            for dep in graph.children(node).unwrap() {
                assert!(position(&order, *dep) < position(&order, node));
            }
        }
    }

    #[test]
    fn test_cycle_rejected() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node();
        let b = graph.add_node();
        let c = graph.add_node();
        let downstream = graph.add_node();
        graph.add_edge(a, b).unwrap();
        graph.add_edge(b, c).unwrap();
        graph.add_edge(c, a).unwrap();
        graph.add_edge(downstream, a).unwrap();

        assert!(graph.has_cycle());
        match graph.topological_sort() {
            Err(GraphError::Cycle(node)) => assert!([a, b, c].contains(&node)),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_names_a_stuck_node() {
        // node 0 resolves fine, only 1 and 2 are stuck
        let mut graph = DependencyGraph::new();
        let leaf = graph.add_node();
        let x = graph.add_node();
        let y = graph.add_node();
        graph.add_edge(x, y).unwrap();
        graph.add_edge(y, x).unwrap();
        graph.add_edge(x, leaf).unwrap();

        match graph.topological_sort() {
            Err(GraphError::Cycle(node)) => assert!(node == x || node == y),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node();
        graph.add_edge(a, a).unwrap();
        assert_eq!(graph.topological_sort(), Err(GraphError::Cycle(a)));
    }

    #[test]
    fn test_sort_does_not_mutate() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node();
        let b = graph.add_node();
        graph.add_edge(a, b).unwrap();

        let _ = graph.topological_sort().unwrap();
        assert_eq!(graph.children(a).unwrap(), &[b]);
        assert_eq!(graph.parents(b).unwrap(), &[a]);
        assert!(!graph.has_cycle());
    }

    #[test]
    fn test_empty_graph() {
        let graph = DependencyGraph::new();
        assert!(graph.topological_sort().unwrap().is_empty());
        assert!(!graph.has_cycle());
    }
}
