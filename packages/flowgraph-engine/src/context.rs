use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{EngineError, NodeError, Result};
use crate::graph::TaskGraph;
use crate::node::NodeId;

/// Lifecycle state of a node within a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(NodeStatus::Pending),
            "ready" => Ok(NodeStatus::Ready),
            "running" => Ok(NodeStatus::Running),
            "completed" => Ok(NodeStatus::Completed),
            "failed" => Ok(NodeStatus::Failed),
            "skipped" => Ok(NodeStatus::Skipped),
            "cancelled" => Ok(NodeStatus::Cancelled),
            _ => Err(EngineError::parse(format!("Invalid node status: {}", s))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed
                | NodeStatus::Failed
                | NodeStatus::Skipped
                | NodeStatus::Cancelled
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-run mutable state: status table, write-once outputs, errors, and
/// pending-dependency counters.
///
/// Only the scheduler loop writes here (single-writer model), so no
/// internal locking is needed; completion callbacks funnel through that
/// loop rather than touching this state concurrently.
#[derive(Debug)]
pub struct ExecutionContext {
    run_id: String,
    order: Vec<NodeId>,
    statuses: HashMap<NodeId, NodeStatus>,
    outputs: HashMap<NodeId, Value>,
    errors: Vec<NodeError>,
    pending: HashMap<NodeId, usize>,
}

impl ExecutionContext {
    /// Seed state for a run: every node `Pending`, pending counters set to
    /// the number of (known) dependencies.
    pub fn new(run_id: impl Into<String>, graph: &TaskGraph) -> Self {
        let order: Vec<NodeId> = graph.ids().cloned().collect();
        let statuses = order
            .iter()
            .map(|id| (id.clone(), NodeStatus::Pending))
            .collect();
        let pending = order
            .iter()
            .map(|id| {
                let known = graph
                    .dependencies_of(id)
                    .iter()
                    .filter(|dep| graph.contains(dep))
                    .count();
                (id.clone(), known)
            })
            .collect();

        Self {
            run_id: run_id.into(),
            order,
            statuses,
            outputs: HashMap::new(),
            errors: Vec::new(),
            pending,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn status(&self, id: &str) -> Option<NodeStatus> {
        self.statuses.get(id).copied()
    }

    pub fn set_status(&mut self, id: &str, status: NodeStatus) {
        if let Some(current) = self.statuses.get_mut(id) {
            *current = status;
        }
    }

    pub fn pending_dependencies(&self, id: &str) -> usize {
        self.pending.get(id).copied().unwrap_or(0)
    }

    /// Decrement a node's pending-dependency counter, returning the new
    /// count (0 means the node is ready to run).
    pub fn decrement_pending(&mut self, id: &str) -> usize {
        match self.pending.get_mut(id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        }
    }

    /// Outputs are write-once per node per run; a second write is an
    /// engine bug and is dropped (first value wins).
    pub fn record_output(&mut self, id: &str, output: Value) {
        if self.outputs.contains_key(id) {
            warn!(
                "Run {}: duplicate output write for node '{}' ignored",
                self.run_id, id
            );
            debug_assert!(false, "duplicate output write for node '{}'", id);
            return;
        }
        self.outputs.insert(id.to_string(), output);
    }

    pub fn output(&self, id: &str) -> Option<&Value> {
        self.outputs.get(id)
    }

    pub fn record_error(&mut self, error: NodeError) {
        self.errors.push(error);
    }

    pub fn errors(&self) -> &[NodeError] {
        &self.errors
    }

    pub fn count_with_status(&self, status: NodeStatus) -> usize {
        self.statuses.values().filter(|s| **s == status).count()
    }

    /// Node ids with the given status, in insertion order.
    pub fn ids_with_status(&self, status: NodeStatus) -> Vec<NodeId> {
        self.order
            .iter()
            .filter(|id| self.statuses.get(*id) == Some(&status))
            .cloned()
            .collect()
    }

    /// Mark every node that never started (`Pending`/`Ready`) as `Skipped`.
    pub fn mark_unstarted_skipped(&mut self) {
        for status in self.statuses.values_mut() {
            if matches!(status, NodeStatus::Pending | NodeStatus::Ready) {
                *status = NodeStatus::Skipped;
            }
        }
    }

    pub fn into_parts(self) -> (HashMap<NodeId, Value>, Vec<NodeError>) {
        (self.outputs, self.errors)
    }
}
