use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::node::{NodeCompute, NodeId, NodeOptions, TaskNode};

/// An explicit, owned graph of named computation steps.
///
/// Nodes are stored in insertion order, which every traversal and tie-break
/// in the engine uses for determinism. Edges live in two mirrored adjacency
/// maps: `dependents` (from -> nodes that consume its output) and
/// `dependencies` (to -> nodes it waits on).
///
/// `depends_on` targets may be added later (or never — `validate_topology`
/// reports dangling references); `connect` requires both endpoints to exist.
#[derive(Default)]
pub struct TaskGraph {
    nodes: HashMap<NodeId, TaskNode>,
    order: Vec<NodeId>,
    dependents: HashMap<NodeId, Vec<NodeId>>,
    dependencies: HashMap<NodeId, Vec<NodeId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with no options. Fails if the id already exists.
    pub fn add_node(
        &mut self,
        id: impl Into<NodeId>,
        compute: Arc<dyn NodeCompute>,
    ) -> Result<()> {
        self.add_node_with(id, compute, NodeOptions::default())
    }

    /// Add a node with dependencies, timeout, and retry options.
    pub fn add_node_with(
        &mut self,
        id: impl Into<NodeId>,
        compute: Arc<dyn NodeCompute>,
        options: NodeOptions,
    ) -> Result<()> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(EngineError::DuplicateNode(id));
        }

        let node = TaskNode::new(id.clone(), compute, options);
        for dep in node.depends_on.clone() {
            self.record_edge(dep, id.clone());
        }
        self.order.push(id.clone());
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Add an explicit edge `from -> to` (`to` depends on `from`'s output).
    /// Both endpoints must already exist.
    pub fn connect(&mut self, from: impl AsRef<str>, to: impl AsRef<str>) -> Result<()> {
        let from = from.as_ref();
        let to = to.as_ref();
        if !self.nodes.contains_key(from) {
            return Err(EngineError::UnknownNode(from.to_string()));
        }
        if !self.nodes.contains_key(to) {
            return Err(EngineError::UnknownNode(to.to_string()));
        }
        self.record_edge(from.to_string(), to.to_string());
        Ok(())
    }

    /// Duplicate edges collapse; both adjacency maps stay mirrored.
    fn record_edge(&mut self, from: NodeId, to: NodeId) {
        let dependents = self.dependents.entry(from.clone()).or_default();
        if !dependents.contains(&to) {
            dependents.push(to.clone());
        }
        let dependencies = self.dependencies.entry(to).or_default();
        if !dependencies.contains(&from) {
            dependencies.push(from);
        }
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Node ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.order.iter()
    }

    /// Nodes that consume `id`'s output.
    pub fn dependents_of(&self, id: &str) -> &[NodeId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes `id` waits on (may include dangling references until
    /// `validate_topology` is consulted).
    pub fn dependencies_of(&self, id: &str) -> &[NodeId] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes with no dependencies, in insertion order.
    pub fn roots(&self) -> Vec<&NodeId> {
        self.order
            .iter()
            .filter(|id| self.dependencies_of(id).is_empty())
            .collect()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("nodes", &self.order)
            .field("dependents", &self.dependents)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::compute_fn;
    use serde_json::Value;

    fn noop() -> Arc<dyn NodeCompute> {
        compute_fn(|_, _| async { Ok(Value::Null) })
    }

    #[test]
    fn test_add_node_duplicate_id_fails() {
        let mut graph = TaskGraph::new();
        graph.add_node("a", noop()).unwrap();

        let err = graph.add_node("a", noop()).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateNode(id) if id == "a"));
    }

    #[test]
    fn test_connect_unknown_node_fails() {
        let mut graph = TaskGraph::new();
        graph.add_node("a", noop()).unwrap();

        let err = graph.connect("a", "missing").unwrap_err();
        assert!(matches!(err, EngineError::UnknownNode(id) if id == "missing"));

        let err = graph.connect("missing", "a").unwrap_err();
        assert!(matches!(err, EngineError::UnknownNode(id) if id == "missing"));
    }

    #[test]
    fn test_connect_records_both_directions() {
        let mut graph = TaskGraph::new();
        graph.add_node("a", noop()).unwrap();
        graph.add_node("b", noop()).unwrap();
        graph.connect("a", "b").unwrap();

        assert_eq!(graph.dependents_of("a"), ["b".to_string()]);
        assert_eq!(graph.dependencies_of("b"), ["a".to_string()]);
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let mut graph = TaskGraph::new();
        graph.add_node("a", noop()).unwrap();
        graph
            .add_node_with("b", noop(), NodeOptions::new().depends_on(["a"]))
            .unwrap();
        graph.connect("a", "b").unwrap();

        assert_eq!(graph.dependents_of("a").len(), 1);
        assert_eq!(graph.dependencies_of("b").len(), 1);
    }

    #[test]
    fn test_depends_on_may_reference_later_node() {
        let mut graph = TaskGraph::new();
        graph
            .add_node_with("b", noop(), NodeOptions::new().depends_on(["a"]))
            .unwrap();
        graph.add_node("a", noop()).unwrap();

        assert_eq!(graph.dependencies_of("b"), ["a".to_string()]);
        assert_eq!(graph.dependents_of("a"), ["b".to_string()]);
    }

    #[test]
    fn test_roots_in_insertion_order() {
        let mut graph = TaskGraph::new();
        graph.add_node("c", noop()).unwrap();
        graph.add_node("a", noop()).unwrap();
        graph
            .add_node_with("b", noop(), NodeOptions::new().depends_on(["a"]))
            .unwrap();

        let roots: Vec<_> = graph.roots().into_iter().cloned().collect();
        assert_eq!(roots, vec!["c".to_string(), "a".to_string()]);
    }
}
