use serde_json::Value;
use tracing::{error, info};

use crate::error::NodeError;
use crate::executor::ExecutionResult;

/// Observer of run lifecycle events, injected via `ExecuteOptions`.
///
/// Callbacks are invoked synchronously from the scheduler loop, so they
/// must be cheap; anything slow belongs on a channel of the listener's own.
pub trait RunListener: Send + Sync {
    fn on_node_started(&self, _node_id: &str) {}

    fn on_node_completed(&self, _node_id: &str, _output: &Value) {}

    fn on_node_failed(&self, _node_id: &str, _error: &NodeError) {}

    fn on_run_completed(&self, _result: &ExecutionResult) {}
}

/// Listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl RunListener for NoopListener {}

/// Listener that forwards lifecycle events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl RunListener for TracingListener {
    fn on_node_started(&self, node_id: &str) {
        info!("Node '{}' started", node_id);
    }

    fn on_node_completed(&self, node_id: &str, _output: &Value) {
        info!("Node '{}' completed", node_id);
    }

    fn on_node_failed(&self, node_id: &str, error: &NodeError) {
        error!("Node '{}' failed: {}", node_id, error);
    }

    fn on_run_completed(&self, result: &ExecutionResult) {
        info!(
            "Run {} finished with status {} ({} outputs, {} errors, {} skipped)",
            result.run_id,
            result.status,
            result.outputs.len(),
            result.errors.len(),
            result.skipped.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_noop_listener_accepts_events() {
        let listener = NoopListener;
        listener.on_node_started("a");
        listener.on_node_failed("a", &NodeError::new("a", ErrorKind::Execution, "boom"));
    }
}
