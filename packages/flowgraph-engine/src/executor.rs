use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::context::{ExecutionContext, NodeStatus};
use crate::error::{ErrorKind, NodeError};
use crate::graph::TaskGraph;
use crate::listener::{NoopListener, RunListener};
use crate::node::{NodeCompute, NodeContext, NodeId, NodeInput};

/// Options for a single run. Collaborators (checkpoint store, listener,
/// cancellation token) are injected here; the engine keeps no global state.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Run-wide deadline; also the default per-node deadline for nodes
    /// without their own `timeout_ms`.
    pub global_timeout_ms: Option<u64>,
    /// Keep independent branches running after a failure.
    pub continue_on_error: bool,
    /// Maximum simultaneous node executions (unbounded if unset).
    pub concurrency: Option<usize>,
    /// Stable id for checkpoint/resume; generated per run if unset.
    pub run_id: Option<String>,
    pub checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    pub listener: Option<Arc<dyn RunListener>>,
    /// External cancellation signal for the whole run.
    pub cancellation: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global_timeout_ms(mut self, ms: u64) -> Self {
        self.global_timeout_ms = Some(ms);
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    /// Bound concurrency to 75% of available cores.
    pub fn auto_concurrency(self) -> Self {
        let workers = (num_cpus::get() * 3 / 4).max(1);
        self.with_concurrency(workers)
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every node completed.
    Completed,
    /// Validation failed, fail-fast tripped, the run was cancelled, or
    /// nothing succeeded.
    Failed,
    /// Under `continue_on_error`: some nodes failed, others completed.
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregated result of `execute`. Runtime node failures land in `errors`;
/// `execute` itself never fails for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: String,
    pub status: RunStatus,
    pub outputs: HashMap<NodeId, Value>,
    pub errors: Vec<NodeError>,
    pub skipped: Vec<NodeId>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

enum AttemptOutcome {
    Completed { output: Value, elapsed_ms: u64 },
    Failed { kind: ErrorKind, message: String },
    Cancelled,
}

struct NodeOutcome {
    node_id: NodeId,
    outcome: AttemptOutcome,
}

/// Exponential backoff between retry attempts: 50ms, 100ms, 200ms, ...
/// capped at 5s.
fn retry_backoff(attempt: u32) -> Duration {
    let ms = 50u64.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(ms.min(5_000))
}

/// One node's full execution: timeout enforcement, cooperative
/// cancellation, and the retry loop. Runs as a spawned task; the scheduler
/// loop interprets the returned outcome.
async fn run_node(
    node_id: NodeId,
    compute: Arc<dyn NodeCompute>,
    input: NodeInput,
    run_id: String,
    timeout_ms: Option<u64>,
    retries: u32,
    run_token: CancellationToken,
) -> NodeOutcome {
    let mut attempt: u32 = 0;

    loop {
        if run_token.is_cancelled() {
            return NodeOutcome {
                node_id,
                outcome: AttemptOutcome::Cancelled,
            };
        }

        // Child token: cancelled on this attempt's deadline so the compute
        // can observe it, without tearing down the whole run.
        let attempt_token = run_token.child_token();
        let ctx = NodeContext {
            run_id: run_id.clone(),
            node_id: node_id.clone(),
            attempt,
            cancellation: attempt_token.clone(),
        };
        let started = Instant::now();
        let fut = compute.run(input.clone(), ctx);

        let attempt_result: Result<Value, (ErrorKind, String)> = match timeout_ms {
            Some(ms) => {
                tokio::select! {
                    _ = run_token.cancelled() => {
                        return NodeOutcome {
                            node_id,
                            outcome: AttemptOutcome::Cancelled,
                        };
                    }
                    result = tokio::time::timeout(Duration::from_millis(ms), fut) => {
                        match result {
                            Ok(inner) => inner.map_err(|e| (ErrorKind::Execution, format!("{e:#}"))),
                            Err(_) => {
                                attempt_token.cancel();
                                Err((
                                    ErrorKind::Timeout,
                                    format!(
                                        "node '{}' timed out after {}ms",
                                        node_id,
                                        started.elapsed().as_millis()
                                    ),
                                ))
                            }
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = run_token.cancelled() => {
                        return NodeOutcome {
                            node_id,
                            outcome: AttemptOutcome::Cancelled,
                        };
                    }
                    result = fut => result.map_err(|e| (ErrorKind::Execution, format!("{e:#}"))),
                }
            }
        };

        match attempt_result {
            Ok(output) => {
                return NodeOutcome {
                    node_id,
                    outcome: AttemptOutcome::Completed {
                        output,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    },
                };
            }
            Err((kind, message)) => {
                if kind.is_retryable() && attempt < retries {
                    let backoff = retry_backoff(attempt);
                    warn!(
                        "Run {}: node '{}' attempt {} failed ({}), retrying in {:?}",
                        run_id,
                        node_id,
                        attempt + 1,
                        message,
                        backoff
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = run_token.cancelled() => {
                            return NodeOutcome {
                                node_id,
                                outcome: AttemptOutcome::Cancelled,
                            };
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    continue;
                }
                return NodeOutcome {
                    node_id,
                    outcome: AttemptOutcome::Failed { kind, message },
                };
            }
        }
    }
}

/// The scheduling core: runs a validated graph to completion.
///
/// Event-driven single-writer loop — node tasks run concurrently on tokio,
/// but every status/output/counter mutation happens here, on completion
/// events, never behind a shared lock.
pub struct Executor {
    worker_id: String,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Execute the graph. Never fails for runtime node errors; inspect
    /// `status` and `errors` on the returned result.
    pub async fn execute(
        &self,
        graph: &TaskGraph,
        initial_input: Value,
        options: ExecuteOptions,
    ) -> ExecutionResult {
        let started = Instant::now();
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let listener: Arc<dyn RunListener> = options
            .listener
            .clone()
            .unwrap_or_else(|| Arc::new(NoopListener));

        info!(
            "Run {}: starting on {} ({} nodes)",
            run_id,
            self.worker_id,
            graph.len()
        );

        // Fail fast before any side effect: structure first, then cycles.
        let mut validation_errors: Vec<NodeError> = graph
            .validate_topology()
            .into_iter()
            .map(|issue| NodeError::new(issue.node_id().clone(), ErrorKind::Validation, issue.to_string()))
            .collect();
        let cycle = graph.detect_cycles();
        if !cycle.is_empty() {
            validation_errors.push(NodeError::new(
                cycle[0].clone(),
                ErrorKind::Validation,
                format!("dependency cycle detected: {}", cycle.join(" -> ")),
            ));
        }
        if !validation_errors.is_empty() {
            error!(
                "Run {}: validation failed with {} problem(s), no node executed",
                run_id,
                validation_errors.len()
            );
            let result = ExecutionResult {
                run_id,
                status: RunStatus::Failed,
                outputs: HashMap::new(),
                errors: validation_errors,
                skipped: Vec::new(),
                duration_ms: started.elapsed().as_millis() as u64,
            };
            listener.on_run_completed(&result);
            return result;
        }

        if let Ok(plan) = graph.execution_plan() {
            info!("Run {}: execution plan:\n{}", run_id, plan);
        }

        let mut ctx = ExecutionContext::new(run_id.clone(), graph);

        // Checkpoint replay: completed nodes are seeded, not re-invoked.
        if let Some(store) = &options.checkpoint_store {
            match store.load(&run_id).await {
                Ok(records) => {
                    let mut replayed: Vec<NodeId> = Vec::new();
                    for (node_id, record) in records {
                        if record.status == NodeStatus::Completed && graph.contains(&node_id) {
                            ctx.set_status(&node_id, NodeStatus::Completed);
                            ctx.record_output(&node_id, record.output.unwrap_or(Value::Null));
                            replayed.push(node_id);
                        }
                    }
                    for node_id in &replayed {
                        for dependent in graph.dependents_of(node_id) {
                            ctx.decrement_pending(dependent);
                        }
                    }
                    if !replayed.is_empty() {
                        info!(
                            "Run {}: resuming from checkpoint, {} node(s) already completed",
                            run_id,
                            replayed.len()
                        );
                    }
                }
                Err(e) => {
                    warn!("Run {}: failed to load checkpoints: {}", run_id, e);
                }
            }
        }

        let index: HashMap<NodeId, usize> = graph
            .ids()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        // Ready set, ordered by insertion index for deterministic admission.
        let mut ready: BinaryHeap<Reverse<(usize, NodeId)>> = BinaryHeap::new();
        for id in graph.ids() {
            if ctx.status(id) == Some(NodeStatus::Pending) && ctx.pending_dependencies(id) == 0 {
                ctx.set_status(id, NodeStatus::Ready);
                ready.push(Reverse((index[id], id.clone())));
            }
        }

        let run_token = options.cancellation.clone().unwrap_or_default();
        let concurrency = options.concurrency.unwrap_or(usize::MAX).max(1);
        let mut join_set: JoinSet<NodeOutcome> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, NodeId> = HashMap::new();
        let mut admitting = true;
        let mut cancelled_kind: Option<ErrorKind> = None;
        let mut global_fired = false;

        let global_sleep = async {
            match options.global_timeout_ms {
                Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(global_sleep);

        loop {
            if admitting {
                while join_set.len() < concurrency {
                    let Some(Reverse((_, node_id))) = ready.pop() else {
                        break;
                    };
                    if ctx.status(&node_id) != Some(NodeStatus::Ready) {
                        continue;
                    }
                    let Some(node) = graph.node(&node_id) else {
                        continue;
                    };

                    let mut upstream = HashMap::new();
                    for dep in graph.dependencies_of(&node_id) {
                        if let Some(output) = ctx.output(dep) {
                            upstream.insert(dep.clone(), output.clone());
                        }
                    }
                    let input = NodeInput {
                        initial: initial_input.clone(),
                        upstream,
                    };

                    ctx.set_status(&node_id, NodeStatus::Running);
                    listener.on_node_started(&node_id);
                    info!("Run {}: node '{}' started", run_id, node_id);

                    let handle = join_set.spawn(run_node(
                        node_id.clone(),
                        node.compute.clone(),
                        input,
                        run_id.clone(),
                        node.timeout_ms.or(options.global_timeout_ms),
                        node.retries,
                        run_token.clone(),
                    ));
                    in_flight.insert(handle.id(), node_id);
                }
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                joined = join_set.join_next_with_id() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Ok((task_id, outcome)) => {
                            in_flight.remove(&task_id);
                            self.handle_outcome(
                                graph,
                                &mut ctx,
                                &mut ready,
                                &index,
                                &options,
                                &listener,
                                &run_id,
                                cancelled_kind,
                                &mut admitting,
                                outcome,
                            )
                            .await;
                        }
                        Err(join_err) => {
                            let node_id = in_flight.remove(&join_err.id());
                            let Some(node_id) = node_id else { continue };
                            if join_err.is_cancelled() {
                                // Force-cancelled by the run deadline.
                                let kind = cancelled_kind.unwrap_or(ErrorKind::Cancelled);
                                ctx.set_status(&node_id, NodeStatus::Cancelled);
                                let err = NodeError::new(
                                    node_id.clone(),
                                    kind,
                                    format!("node '{}' cancelled while in flight", node_id),
                                );
                                listener.on_node_failed(&node_id, &err);
                                ctx.record_error(err);
                            } else {
                                ctx.set_status(&node_id, NodeStatus::Failed);
                                let err = NodeError::new(
                                    node_id.clone(),
                                    ErrorKind::Execution,
                                    format!("node '{}' panicked: {}", node_id, join_err),
                                );
                                error!("Run {}: {}", run_id, err);
                                listener.on_node_failed(&node_id, &err);
                                ctx.record_error(err);
                                if !options.continue_on_error {
                                    admitting = false;
                                } else {
                                    skip_transitive_dependents(graph, &mut ctx, &node_id);
                                }
                            }
                        }
                    }
                }
                _ = &mut global_sleep, if !global_fired => {
                    global_fired = true;
                    cancelled_kind = Some(ErrorKind::GlobalTimeout);
                    admitting = false;
                    warn!(
                        "Run {}: global timeout of {}ms exceeded, cancelling {} in-flight node(s)",
                        run_id,
                        options.global_timeout_ms.unwrap_or(0),
                        in_flight.len()
                    );
                    run_token.cancel();
                    join_set.abort_all();
                }
                _ = run_token.cancelled(), if cancelled_kind.is_none() => {
                    cancelled_kind = Some(ErrorKind::Cancelled);
                    admitting = false;
                    warn!(
                        "Run {}: cancellation requested, no further nodes will be admitted",
                        run_id
                    );
                }
            }
        }

        // Whatever never started was skipped, by policy or by cancellation.
        ctx.mark_unstarted_skipped();
        let skipped = ctx.ids_with_status(NodeStatus::Skipped);
        let completed = ctx.count_with_status(NodeStatus::Completed);
        let failed = ctx.count_with_status(NodeStatus::Failed);

        let status = if completed == graph.len() {
            RunStatus::Completed
        } else if options.continue_on_error
            && cancelled_kind.is_none()
            && failed > 0
            && completed > 0
        {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let (outputs, errors) = ctx.into_parts();
        let result = ExecutionResult {
            run_id,
            status,
            outputs,
            errors,
            skipped,
            duration_ms,
        };

        info!(
            "Run {}: finished with status {} in {}ms ({} outputs, {} errors, {} skipped)",
            result.run_id,
            result.status,
            result.duration_ms,
            result.outputs.len(),
            result.errors.len(),
            result.skipped.len()
        );
        listener.on_run_completed(&result);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_outcome(
        &self,
        graph: &TaskGraph,
        ctx: &mut ExecutionContext,
        ready: &mut BinaryHeap<Reverse<(usize, NodeId)>>,
        index: &HashMap<NodeId, usize>,
        options: &ExecuteOptions,
        listener: &Arc<dyn RunListener>,
        run_id: &str,
        cancelled_kind: Option<ErrorKind>,
        admitting: &mut bool,
        outcome: NodeOutcome,
    ) {
        let node_id = outcome.node_id;
        match outcome.outcome {
            AttemptOutcome::Completed { output, elapsed_ms } => {
                ctx.set_status(&node_id, NodeStatus::Completed);
                listener.on_node_completed(&node_id, &output);
                info!(
                    "Run {}: node '{}' completed in {}ms",
                    run_id, node_id, elapsed_ms
                );

                if let Some(store) = &options.checkpoint_store {
                    let record =
                        CheckpointRecord::completed(run_id, node_id.clone(), output.clone());
                    if let Err(e) = store.save(&record).await {
                        warn!(
                            "Run {}: checkpoint save failed for node '{}': {}",
                            run_id, node_id, e
                        );
                    }
                }

                ctx.record_output(&node_id, output);

                for dependent in graph.dependents_of(&node_id) {
                    if ctx.status(dependent) == Some(NodeStatus::Pending)
                        && ctx.decrement_pending(dependent) == 0
                    {
                        ctx.set_status(dependent, NodeStatus::Ready);
                        ready.push(Reverse((index[dependent], dependent.clone())));
                    }
                }
            }
            AttemptOutcome::Failed { kind, message } => {
                ctx.set_status(&node_id, NodeStatus::Failed);
                let err = NodeError::new(node_id.clone(), kind, message);
                error!("Run {}: node '{}' failed: {}", run_id, node_id, err.message);
                listener.on_node_failed(&node_id, &err);

                if let Some(store) = &options.checkpoint_store {
                    let record = CheckpointRecord::failed(run_id, node_id.clone());
                    if let Err(e) = store.save(&record).await {
                        warn!(
                            "Run {}: checkpoint save failed for node '{}': {}",
                            run_id, node_id, e
                        );
                    }
                }

                ctx.record_error(err);

                if options.continue_on_error {
                    let skipped = skip_transitive_dependents(graph, ctx, &node_id);
                    if skipped > 0 {
                        info!(
                            "Run {}: skipped {} transitive dependent(s) of failed node '{}'",
                            run_id, skipped, node_id
                        );
                    }
                } else {
                    // Fail fast: stop admitting, let in-flight nodes drain.
                    *admitting = false;
                }
            }
            AttemptOutcome::Cancelled => {
                ctx.set_status(&node_id, NodeStatus::Cancelled);
                let kind = cancelled_kind.unwrap_or(ErrorKind::Cancelled);
                let err = NodeError::new(
                    node_id.clone(),
                    kind,
                    format!("node '{}' cancelled before completion", node_id),
                );
                listener.on_node_failed(&node_id, &err);
                ctx.record_error(err);
            }
        }
    }
}

/// Mark every transitive dependent of a failed node as skipped. Returns
/// the number of nodes newly skipped.
fn skip_transitive_dependents(
    graph: &TaskGraph,
    ctx: &mut ExecutionContext,
    failed: &str,
) -> usize {
    let mut skipped = 0usize;
    let mut queue: VecDeque<NodeId> = graph.dependents_of(failed).iter().cloned().collect();

    while let Some(node_id) = queue.pop_front() {
        // Dependents of a non-completed node can only be Pending: readiness
        // requires every dependency to have completed.
        if ctx.status(&node_id) == Some(NodeStatus::Pending) {
            ctx.set_status(&node_id, NodeStatus::Skipped);
            skipped += 1;
            queue.extend(graph.dependents_of(&node_id).iter().cloned());
        }
    }
    skipped
}
