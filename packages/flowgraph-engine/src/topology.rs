use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::error::{EngineError, Result};
use crate::graph::TaskGraph;
use crate::node::NodeId;

/// A structural problem found by [`TaskGraph::validate_topology`].
///
/// Duplicate ids cannot be represented here: `add_node` rejects them at
/// build time, so the only lingering structural defect is a dangling
/// `depends_on` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralIssue {
    UnknownReference { node_id: NodeId, missing: NodeId },
}

impl StructuralIssue {
    /// The node the issue is anchored to.
    pub fn node_id(&self) -> &NodeId {
        match self {
            StructuralIssue::UnknownReference { node_id, .. } => node_id,
        }
    }
}

impl std::fmt::Display for StructuralIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StructuralIssue::UnknownReference { node_id, missing } => {
                write!(f, "node '{}' depends on unknown node '{}'", node_id, missing)
            }
        }
    }
}

/// Traversal colors for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl TaskGraph {
    /// Report structural errors (dangling dependency references) without
    /// mutating the graph. Empty means structurally sound.
    pub fn validate_topology(&self) -> Vec<StructuralIssue> {
        let mut issues = Vec::new();
        for id in self.ids() {
            for dep in self.dependencies_of(id) {
                if !self.contains(dep) {
                    issues.push(StructuralIssue::UnknownReference {
                        node_id: id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }
        issues
    }

    /// Three-color DFS over nodes in insertion order.
    ///
    /// Returns the first discovered cycle as an ordered node list
    /// (`[a]` for a self-loop, `[a, b, c]` for `a -> b -> c -> a`);
    /// empty means acyclic.
    pub fn detect_cycles(&self) -> Vec<NodeId> {
        let mut color: HashMap<&NodeId, Color> =
            self.ids().map(|id| (id, Color::White)).collect();

        for start in self.ids() {
            if color[start] != Color::White {
                continue;
            }

            // The stack doubles as the gray path from `start`.
            let mut stack: Vec<(&NodeId, usize)> = vec![(start, 0)];
            color.insert(start, Color::Gray);

            while !stack.is_empty() {
                let (node, child_idx) = {
                    let Some(top) = stack.last_mut() else { break };
                    let frame = (top.0, top.1);
                    top.1 += 1;
                    frame
                };
                let successors = self.dependents_of(node);

                if child_idx < successors.len() {
                    let succ = &successors[child_idx];
                    if !self.contains(succ) {
                        continue;
                    }
                    match color[succ] {
                        Color::White => {
                            color.insert(succ, Color::Gray);
                            stack.push((succ, 0));
                        }
                        Color::Gray => {
                            let pos = stack
                                .iter()
                                .position(|(n, _)| *n == succ)
                                .unwrap_or(0);
                            return stack[pos..].iter().map(|(n, _)| (*n).clone()).collect();
                        }
                        Color::Black => {}
                    }
                } else {
                    color.insert(node, Color::Black);
                    stack.pop();
                }
            }
        }

        Vec::new()
    }

    /// Kahn's algorithm. Ties among simultaneously-ready nodes are broken
    /// by insertion order, so single-threaded consumers observe a stable
    /// order. Unknown dependency references are ignored here; they are
    /// `validate_topology`'s concern.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let index: HashMap<&NodeId, usize> =
            self.ids().enumerate().map(|(i, id)| (id, i)).collect();
        let order: Vec<&NodeId> = self.ids().collect();

        let mut in_degree: HashMap<&NodeId, usize> = self
            .ids()
            .map(|id| {
                let known = self
                    .dependencies_of(id)
                    .iter()
                    .filter(|dep| self.contains(dep))
                    .count();
                (id, known)
            })
            .collect();

        let mut heap: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| Reverse(index[*id]))
            .collect();

        let mut sorted = Vec::with_capacity(self.len());
        while let Some(Reverse(i)) = heap.pop() {
            let id = order[i];
            sorted.push(id.clone());

            for dependent in self.dependents_of(id) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        heap.push(Reverse(index[dependent]));
                    }
                }
            }
        }

        if sorted.len() != self.len() {
            return Err(EngineError::CycleDetected(self.detect_cycles()));
        }
        Ok(sorted)
    }

    /// Topological order grouped into parallel phases: each level contains
    /// nodes whose dependencies all sit in earlier levels.
    pub fn topological_levels(&self) -> Result<Vec<Vec<NodeId>>> {
        let mut in_degree: HashMap<&NodeId, usize> = self
            .ids()
            .map(|id| {
                let known = self
                    .dependencies_of(id)
                    .iter()
                    .filter(|dep| self.contains(dep))
                    .count();
                (id, known)
            })
            .collect();

        let mut levels = Vec::new();
        let mut processed = 0usize;

        while processed < self.len() {
            let ready: Vec<NodeId> = self
                .ids()
                .filter(|id| in_degree.get(*id) == Some(&0))
                .cloned()
                .collect();

            if ready.is_empty() {
                return Err(EngineError::CycleDetected(self.detect_cycles()));
            }

            for id in &ready {
                processed += 1;
                in_degree.remove(id);
                for dependent in self.dependents_of(id) {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                    }
                }
            }

            levels.push(ready);
        }

        Ok(levels)
    }

    /// Human-readable execution plan (for logging).
    pub fn execution_plan(&self) -> Result<String> {
        let levels = self.topological_levels()?;
        Ok(levels
            .iter()
            .enumerate()
            .map(|(i, group)| {
                if group.len() > 1 {
                    format!("Phase {}: {} (parallel)", i + 1, group.join(" ∥ "))
                } else {
                    format!("Phase {}: {}", i + 1, group[0])
                }
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}
