//! Immutable graph structure
//!
//! A [`Graph`] is built once from nodes, edges and a start node, validated,
//! and then shared read-only (behind an `Arc`) by the engine. Adjacency is
//! precomputed so that routing a node's output never scans the edge list.
//!
//! ```text
//!            ┌─────────┐
//!            │  start  │
//!            └────┬────┘
//!         ┌───────┴───────┐        fan-out
//!         ▼               ▼
//!    ┌─────────┐     ┌─────────┐
//!    │    a    │     │    b    │   same superstep, concurrent
//!    └────┬────┘     └────┬────┘
//!         └───────┬───────┘        fan-in
//!                 ▼
//!            ┌─────────┐
//!            │  join   │
//!            └─────────┘
//! ```
//!
//! Cycles are legal; loops terminate when a node's outgoing conditions stop
//! matching or when the engine's iteration cap is reached.
//!
//! ```rust
//! use superstep_core::graph::{Edge, Graph, Node};
//!
//! let echo = |id: &str| Node::from_fn(id, |input| async move { Ok(input) });
//! let graph = Graph::new(
//!     "pipeline",
//!     vec![echo("fetch"), echo("parse")],
//!     vec![Edge::new("fetch", "parse")],
//!     "fetch",
//! )
//! .unwrap();
//!
//! assert!(graph.is_terminal("parse"));
//! assert_eq!(graph.successors("fetch"), vec!["parse"]);
//! ```

mod edge;
mod node;

pub use edge::{Edge, EdgeCondition};
pub use node::{BlockingExecutor, ExecutorFuture, FnExecutor, Node, NodeConfig, NodeExecutor};

use crate::error::{GraphError, Result};
use std::collections::{HashMap, HashSet};

/// Node identifier
pub type NodeId = String;

/// Validated, read-only computation graph
#[derive(Debug, Clone)]
pub struct Graph {
    graph_id: String,
    nodes: HashMap<NodeId, Node>,
    /// Node ids in construction order
    order: Vec<NodeId>,
    edges: Vec<Edge>,
    start_node_id: NodeId,
    /// Edge indices by source, in edge-list order
    outgoing: HashMap<NodeId, Vec<usize>>,
    /// Edge indices by target, in edge-list order
    incoming: HashMap<NodeId, Vec<usize>>,
}

impl Graph {
    /// Validate and index a graph.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Validation`] naming the offending id when the
    /// graph id is empty, a node id is empty or duplicated, the start node is
    /// unknown, or an edge references an unknown node.
    pub fn new(
        graph_id: impl Into<String>,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        start_node_id: impl Into<NodeId>,
    ) -> Result<Self> {
        let graph_id = graph_id.into();
        let start_node_id = start_node_id.into();

        if graph_id.trim().is_empty() {
            return Err(GraphError::Validation("graph id must not be empty".to_string()));
        }

        let mut order = Vec::with_capacity(nodes.len());
        let mut node_map = HashMap::with_capacity(nodes.len());
        for node in nodes {
            if node.id().trim().is_empty() {
                return Err(GraphError::Validation(format!(
                    "graph '{graph_id}' contains a node with an empty id"
                )));
            }
            let id = node.id().to_string();
            if node_map.insert(id.clone(), node).is_some() {
                return Err(GraphError::Validation(format!("duplicate node id '{id}'")));
            }
            order.push(id);
        }

        if !node_map.contains_key(&start_node_id) {
            return Err(GraphError::Validation(format!(
                "start node '{start_node_id}' does not exist"
            )));
        }

        let mut outgoing: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<NodeId, Vec<usize>> = HashMap::new();
        for (index, edge) in edges.iter().enumerate() {
            for endpoint in [&edge.source, &edge.target] {
                if !node_map.contains_key(endpoint) {
                    return Err(GraphError::Validation(format!(
                        "edge '{}' -> '{}' references unknown node '{}'",
                        edge.source, edge.target, endpoint
                    )));
                }
            }
            outgoing.entry(edge.source.clone()).or_default().push(index);
            incoming.entry(edge.target.clone()).or_default().push(index);
        }

        tracing::debug!(
            graph_id = %graph_id,
            nodes = order.len(),
            edges = edges.len(),
            start = %start_node_id,
            "Graph validated"
        );

        Ok(Self {
            graph_id,
            nodes: node_map,
            order,
            edges,
            start_node_id,
            outgoing,
            incoming,
        })
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn start_node_id(&self) -> &str {
        &self.start_node_id
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Node ids in construction order
    pub fn node_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Edges leaving `id`, in the order they were declared
    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &Edge> + '_ {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&index| &self.edges[index])
    }

    /// Edges entering `id`, in the order they were declared
    pub fn incoming(&self, id: &str) -> impl Iterator<Item = &Edge> + '_ {
        self.incoming
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&index| &self.edges[index])
    }

    /// Distinct targets of edges leaving `id`
    pub fn successors(&self, id: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.outgoing(id)
            .map(|edge| edge.target.as_str())
            .filter(|target| seen.insert(*target))
            .collect()
    }

    /// Distinct sources of edges entering `id`
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.incoming(id)
            .map(|edge| edge.source.as_str())
            .filter(|source| seen.insert(*source))
            .collect()
    }

    /// A node with no outgoing edges
    pub fn is_terminal(&self, id: &str) -> bool {
        self.outgoing.get(id).map_or(true, Vec::is_empty)
    }

    /// Whether any cycle exists, ignoring edge conditions
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        self.order
            .iter()
            .any(|id| !visited.contains(id.as_str()) && self.cycle_from(id, &mut visited, &mut on_stack))
    }

    fn cycle_from<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> bool {
        visited.insert(id);
        on_stack.insert(id);

        for edge in self.outgoing(id) {
            let next = edge.target.as_str();
            if on_stack.contains(next) {
                return true;
            }
            if !visited.contains(next) && self.cycle_from(next, visited, on_stack) {
                return true;
            }
        }

        on_stack.remove(id);
        false
    }

    /// Reverse DFS post-order over every node.
    ///
    /// The start node leads, and unreachable nodes follow in construction
    /// order unless an edge forces them earlier. For cyclic graphs the order
    /// is best-effort; back edges are ignored.
    pub fn topological_order(&self) -> Vec<&str> {
        let mut visited = HashSet::new();
        let mut post_order = Vec::with_capacity(self.order.len());

        // The root visited last comes first once the order is reversed.
        let roots = self
            .order
            .iter()
            .rev()
            .map(String::as_str)
            .filter(|id| *id != self.start_node_id)
            .chain(std::iter::once(self.start_node_id.as_str()));
        for id in roots {
            self.post_order(id, &mut visited, &mut post_order);
        }

        post_order.reverse();
        post_order
    }

    fn post_order<'a>(&'a self, id: &'a str, visited: &mut HashSet<&'a str>, out: &mut Vec<&'a str>) {
        if !visited.insert(id) {
            return;
        }
        for edge in self.outgoing(id) {
            self.post_order(&edge.target, visited, out);
        }
        out.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(id: &str) -> Node {
        Node::from_fn(id, |input| async move { Ok(input) })
    }

    fn diamond() -> Graph {
        Graph::new(
            "diamond",
            vec![echo("start"), echo("a"), echo("b"), echo("join")],
            vec![
                Edge::new("start", "a"),
                Edge::new("start", "b"),
                Edge::new("a", "join"),
                Edge::new("b", "join"),
            ],
            "start",
        )
        .unwrap()
    }

    #[test]
    fn test_adjacency() {
        let graph = diamond();
        assert_eq!(graph.successors("start"), vec!["a", "b"]);
        assert_eq!(graph.predecessors("join"), vec!["a", "b"]);
        assert_eq!(graph.outgoing("a").count(), 1);
        assert_eq!(graph.incoming("start").count(), 0);
        assert!(graph.is_terminal("join"));
        assert!(!graph.is_terminal("start"));
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.node_ids().collect::<Vec<_>>(), vec!["start", "a", "b", "join"]);
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let err = Graph::new("g", vec![echo("a"), echo("a")], vec![], "a").unwrap_err();
        assert!(matches!(err, GraphError::Validation(ref msg) if msg.contains("'a'")));
    }

    #[test]
    fn test_empty_ids_rejected() {
        assert!(Graph::new("", vec![echo("a")], vec![], "a").is_err());
        assert!(Graph::new("g", vec![echo("")], vec![], "").is_err());
    }

    #[test]
    fn test_unknown_start_rejected() {
        let err = Graph::new("g", vec![echo("a")], vec![], "missing").unwrap_err();
        assert!(err.to_string().contains("'missing'"));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let err = Graph::new("g", vec![echo("a")], vec![Edge::new("a", "ghost")], "a").unwrap_err();
        assert!(err.to_string().contains("'ghost'"));
    }

    #[test]
    fn test_cycle_detection() {
        assert!(!diamond().has_cycle());

        let looped = Graph::new(
            "loop",
            vec![echo("a"), echo("b")],
            vec![Edge::new("a", "b"), Edge::new("b", "a")],
            "a",
        )
        .unwrap();
        assert!(looped.has_cycle());

        let self_loop = Graph::new("self", vec![echo("a")], vec![Edge::new("a", "a")], "a").unwrap();
        assert!(self_loop.has_cycle());
    }

    #[test]
    fn test_topological_order() {
        let graph = diamond();
        let order = graph.topological_order();
        let pos = |id: &str| order.iter().position(|n| *n == id).unwrap();

        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "start");
        assert!(pos("a") < pos("join"));
        assert!(pos("b") < pos("join"));
    }

    #[test]
    fn test_topological_order_includes_unreachable() {
        let graph = Graph::new(
            "g",
            vec![echo("a"), echo("b"), echo("island")],
            vec![Edge::new("a", "b")],
            "a",
        )
        .unwrap();
        assert_eq!(graph.topological_order(), vec!["a", "b", "island"]);
    }

    #[test]
    fn test_topological_order_places_unreachable_feeder_before_target() {
        let graph = Graph::new(
            "g",
            vec![echo("start"), echo("x"), echo("feeder")],
            vec![Edge::new("start", "x"), Edge::new("feeder", "x")],
            "start",
        )
        .unwrap();
        assert_eq!(graph.topological_order(), vec!["start", "feeder", "x"]);
    }
}
