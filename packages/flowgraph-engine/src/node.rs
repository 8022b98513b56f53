use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Node identifier, unique within a graph.
pub type NodeId = String;

/// Input handed to a node's compute: the run's initial input plus the
/// outputs of every declared dependency that completed.
#[derive(Debug, Clone, Default)]
pub struct NodeInput {
    pub initial: Value,
    pub upstream: HashMap<NodeId, Value>,
}

impl NodeInput {
    pub fn root(initial: Value) -> Self {
        Self {
            initial,
            upstream: HashMap::new(),
        }
    }

    /// Output of the named dependency, if it completed.
    pub fn dependency(&self, id: &str) -> Option<&Value> {
        self.upstream.get(id)
    }
}

/// Per-attempt execution context threaded into a node's compute.
///
/// `cancellation` is a child of the run-wide token: computes that run long
/// should check it (or `select!` against `cancelled()`) to wind down
/// promptly on timeout or run cancellation.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: String,
    pub node_id: NodeId,
    /// 0 for the first invocation, incremented per retry.
    pub attempt: u32,
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// A node's unit of computation.
///
/// Errors are opaque to the engine; anything `anyhow`-compatible works.
/// Implementations must be cancellation-aware if they run unbounded.
#[async_trait]
pub trait NodeCompute: Send + Sync {
    async fn run(&self, input: NodeInput, ctx: NodeContext) -> anyhow::Result<Value>;
}

struct FnCompute {
    f: Box<dyn Fn(NodeInput, NodeContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>,
}

#[async_trait]
impl NodeCompute for FnCompute {
    async fn run(&self, input: NodeInput, ctx: NodeContext) -> anyhow::Result<Value> {
        (self.f)(input, ctx).await
    }
}

/// Adapt a plain async closure into a [`NodeCompute`].
pub fn compute_fn<F, Fut>(f: F) -> Arc<dyn NodeCompute>
where
    F: Fn(NodeInput, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnCompute {
        f: Box::new(move |input, ctx| f(input, ctx).boxed()),
    })
}

/// Build-time options for a node.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub depends_on: Vec<NodeId>,
    pub timeout_ms: Option<u64>,
    pub retries: u32,
}

impl NodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// A named computation step. Immutable once added to a graph.
#[derive(Clone)]
pub struct TaskNode {
    pub id: NodeId,
    pub compute: Arc<dyn NodeCompute>,
    /// Dependencies declared at build time. The graph's adjacency maps are
    /// the authoritative edge set (`connect` adds edges not listed here).
    pub depends_on: Vec<NodeId>,
    pub timeout_ms: Option<u64>,
    pub retries: u32,
}

impl TaskNode {
    pub(crate) fn new(id: NodeId, compute: Arc<dyn NodeCompute>, options: NodeOptions) -> Self {
        Self {
            id,
            compute,
            depends_on: options.depends_on,
            timeout_ms: options.timeout_ms,
            retries: options.retries,
        }
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("depends_on", &self.depends_on)
            .field("timeout_ms", &self.timeout_ms)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_ctx() -> NodeContext {
        NodeContext {
            run_id: "run-1".to_string(),
            node_id: "n".to_string(),
            attempt: 0,
            cancellation: CancellationToken::new(),
        }
    }

    #[test]
    fn test_compute_fn_runs_closure() {
        let compute = compute_fn(|input: NodeInput, _ctx| async move {
            Ok(json!({ "echo": input.initial }))
        });

        let output = tokio_test::block_on(compute.run(NodeInput::root(json!(42)), test_ctx()))
            .unwrap();
        assert_eq!(output, json!({ "echo": 42 }));
    }

    #[test]
    fn test_node_input_dependency_lookup() {
        let mut input = NodeInput::root(Value::Null);
        input.upstream.insert("load".to_string(), json!("docs"));

        assert_eq!(input.dependency("load"), Some(&json!("docs")));
        assert_eq!(input.dependency("missing"), None);
    }

    #[test]
    fn test_node_options_builder() {
        let opts = NodeOptions::new()
            .depends_on(["a", "b"])
            .timeout_ms(500)
            .retries(2);

        assert_eq!(opts.depends_on, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(opts.timeout_ms, Some(500));
        assert_eq!(opts.retries, 2);
    }

    #[test]
    fn test_task_node_debug_omits_compute() {
        let node = TaskNode::new(
            "embed".to_string(),
            compute_fn(|_, _| async { Ok(Value::Null) }),
            NodeOptions::new().retries(1),
        );

        let rendered = format!("{:?}", node);
        assert!(rendered.contains("embed"));
        assert!(!rendered.contains("compute"));
    }
}
