/*
 * Flowgraph Engine - DAG Execution Core
 *
 * Dependency-aware execution of named computation steps with opaque
 * inputs/outputs. The engine knows nothing about what the steps do.
 *
 * Architecture:
 * - Task Graph (explicit, owned, insertion-ordered)
 * - Topology Validation (three-color DFS cycles, Kahn ordering)
 * - Event-driven Scheduler (concurrent tokio tasks, bounded concurrency)
 * - Timeout & Cooperative Cancellation (per-node and run-wide)
 * - Checkpoint/Resume (pluggable store, idempotent records)
 * - Failure Policy (fail-fast or continue on independent branches)
 */

// Public modules
pub mod checkpoint;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod listener;
pub mod node;
pub mod topology;

// Re-exports
pub use checkpoint::{
    CheckpointRecord, CheckpointStore, JsonFileCheckpointStore, MemoryCheckpointStore,
};
pub use context::{ExecutionContext, NodeStatus};
pub use error::{EngineError, ErrorKind, NodeError, Result};
pub use executor::{ExecuteOptions, ExecutionResult, Executor, RunStatus};
pub use graph::TaskGraph;
pub use listener::{NoopListener, RunListener, TracingListener};
pub use node::{
    compute_fn, NodeCompute, NodeContext, NodeId, NodeInput, NodeOptions, TaskNode,
};
pub use topology::StructuralIssue;
