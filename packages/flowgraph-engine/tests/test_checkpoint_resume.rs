//! Checkpoint/resume integration tests: completed nodes replay from the
//! store instead of re-running, failed nodes get a fresh attempt.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flowgraph_engine::{
    compute_fn, CheckpointStore, ExecuteOptions, Executor, JsonFileCheckpointStore,
    MemoryCheckpointStore, NodeInput, NodeOptions, NodeStatus, RunStatus, TaskGraph,
};
use serde_json::{json, Value};
use uuid::Uuid;

/// Graph where `a` counts its invocations and `b` consumes `a`'s output.
/// `b_fails` controls whether `b` errors (first run) or succeeds (resume).
fn build_graph(a_invocations: Arc<AtomicUsize>, b_fails: bool) -> TaskGraph {
    let mut graph = TaskGraph::new();
    graph
        .add_node(
            "a",
            compute_fn(move |_, _| {
                let counter = a_invocations.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("x"))
                }
            }),
        )
        .unwrap();
    graph
        .add_node_with(
            "b",
            compute_fn(move |input: NodeInput, _| async move {
                if b_fails {
                    anyhow::bail!("b not ready yet");
                }
                Ok(json!({ "got": input.dependency("a").cloned() }))
            }),
            NodeOptions::new().depends_on(["a"]),
        )
        .unwrap();
    graph
}

#[tokio::test]
async fn test_resume_does_not_reinvoke_completed_node() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let a_invocations = Arc::new(AtomicUsize::new(0));
    let executor = Executor::new();

    // First run: a completes, b fails — the run stops short.
    let first = executor
        .execute(
            &build_graph(a_invocations.clone(), true),
            Value::Null,
            ExecuteOptions::new()
                .with_run_id("r1")
                .with_checkpoint_store(store.clone()),
        )
        .await;

    assert_eq!(first.status, RunStatus::Failed);
    assert_eq!(a_invocations.load(Ordering::SeqCst), 1);

    // The store holds a completed record for `a` and a failed one for `b`.
    let records = store.load("r1").await.unwrap();
    assert_eq!(records["a"].status, NodeStatus::Completed);
    assert_eq!(records["a"].output, Some(json!("x")));
    assert_eq!(records["b"].status, NodeStatus::Failed);

    // Resume with the same run id: a replays from the checkpoint, b gets a
    // fresh attempt and receives a's recorded output.
    let second = executor
        .execute(
            &build_graph(a_invocations.clone(), false),
            Value::Null,
            ExecuteOptions::new()
                .with_run_id("r1")
                .with_checkpoint_store(store.clone()),
        )
        .await;

    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(a_invocations.load(Ordering::SeqCst), 1);
    assert_eq!(second.output("a"), Some(&json!("x")));
    assert_eq!(second.output("b"), Some(&json!({ "got": "x" })));

    // b's failed record was overwritten by the successful resume.
    let records = store.load("r1").await.unwrap();
    assert_eq!(records["b"].status, NodeStatus::Completed);
}

#[tokio::test]
async fn test_distinct_run_ids_do_not_share_checkpoints() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let a_invocations = Arc::new(AtomicUsize::new(0));
    let executor = Executor::new();

    executor
        .execute(
            &build_graph(a_invocations.clone(), false),
            Value::Null,
            ExecuteOptions::new()
                .with_run_id("r1")
                .with_checkpoint_store(store.clone()),
        )
        .await;
    executor
        .execute(
            &build_graph(a_invocations.clone(), false),
            Value::Null,
            ExecuteOptions::new()
                .with_run_id("r2")
                .with_checkpoint_store(store.clone()),
        )
        .await;

    // Each run id executed `a` once.
    assert_eq!(a_invocations.load(Ordering::SeqCst), 2);
    assert_eq!(store.completed_nodes("r1").len(), 2);
    assert_eq!(store.completed_nodes("r2").len(), 2);
}

#[tokio::test]
async fn test_generated_run_ids_are_unique() {
    let graph = TaskGraph::new();
    let executor = Executor::new();

    let first = executor
        .execute(&graph, Value::Null, ExecuteOptions::new())
        .await;
    let second = executor
        .execute(&graph, Value::Null, ExecuteOptions::new())
        .await;

    assert!(!first.run_id.is_empty());
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn test_resume_with_file_store() {
    let dir = std::env::temp_dir().join(format!("flowgraph-resume-{}", Uuid::new_v4()));
    let store = Arc::new(JsonFileCheckpointStore::new(&dir));
    let a_invocations = Arc::new(AtomicUsize::new(0));
    let executor = Executor::new();

    let first = executor
        .execute(
            &build_graph(a_invocations.clone(), true),
            Value::Null,
            ExecuteOptions::new()
                .with_run_id("file-run")
                .with_checkpoint_store(store.clone()),
        )
        .await;
    assert_eq!(first.status, RunStatus::Failed);

    // Fresh store instance over the same directory: survives "restart".
    let reopened = Arc::new(JsonFileCheckpointStore::new(&dir));
    let second = executor
        .execute(
            &build_graph(a_invocations.clone(), false),
            Value::Null,
            ExecuteOptions::new()
                .with_run_id("file-run")
                .with_checkpoint_store(reopened),
        )
        .await;

    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(a_invocations.load(Ordering::SeqCst), 1);
    assert_eq!(second.output("b"), Some(&json!({ "got": "x" })));

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_fully_checkpointed_run_executes_nothing() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let a_invocations = Arc::new(AtomicUsize::new(0));
    let executor = Executor::new();

    executor
        .execute(
            &build_graph(a_invocations.clone(), false),
            Value::Null,
            ExecuteOptions::new()
                .with_run_id("done")
                .with_checkpoint_store(store.clone()),
        )
        .await;
    assert_eq!(a_invocations.load(Ordering::SeqCst), 1);

    // Re-running a finished run replays everything.
    let replay = executor
        .execute(
            &build_graph(a_invocations.clone(), false),
            Value::Null,
            ExecuteOptions::new()
                .with_run_id("done")
                .with_checkpoint_store(store.clone()),
        )
        .await;

    assert_eq!(replay.status, RunStatus::Completed);
    assert_eq!(a_invocations.load(Ordering::SeqCst), 1);
    assert_eq!(replay.outputs.len(), 2);
}
