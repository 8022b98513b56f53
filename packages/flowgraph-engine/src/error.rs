use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::node::NodeId;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Unknown node id: {0}")]
    UnknownNode(NodeId),

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<NodeId>),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn checkpoint<E: std::fmt::Display>(e: E) -> Self {
        Self::Checkpoint(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }
}

/// Runtime error taxonomy recorded in execution results.
///
/// `Validation` is only ever produced before any node runs; the remaining
/// kinds describe how a node (or the whole run) went wrong at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Cycle or unknown reference, detected pre-execution.
    Validation,
    /// The node's compute returned an error.
    Execution,
    /// The node exceeded its effective deadline.
    Timeout,
    /// The run-wide deadline expired while the node was in flight.
    GlobalTimeout,
    /// The run was cancelled before the node could complete.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::GlobalTimeout => "global_timeout",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "validation" => Ok(ErrorKind::Validation),
            "execution" => Ok(ErrorKind::Execution),
            "timeout" => Ok(ErrorKind::Timeout),
            "global_timeout" => Ok(ErrorKind::GlobalTimeout),
            "cancelled" => Ok(ErrorKind::Cancelled),
            _ => Err(EngineError::parse(format!("Invalid error kind: {}", s))),
        }
    }

    /// Kinds eligible for the per-node retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Execution | ErrorKind::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single node's terminal failure, as reported in `ExecutionResult::errors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub node_id: NodeId,
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(node_id: impl Into<NodeId>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.node_id, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_roundtrip() {
        for kind in &[
            ErrorKind::Validation,
            ErrorKind::Execution,
            ErrorKind::Timeout,
            ErrorKind::GlobalTimeout,
            ErrorKind::Cancelled,
        ] {
            let s = kind.as_str();
            let parsed = ErrorKind::from_str(s).unwrap();
            assert_eq!(*kind, parsed);
        }
    }

    #[test]
    fn test_error_kind_invalid() {
        assert!(ErrorKind::from_str("invalid").is_err());
    }

    #[test]
    fn test_error_kind_retryable() {
        assert!(ErrorKind::Execution.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::GlobalTimeout.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_node_error_display() {
        let err = NodeError::new("embed", ErrorKind::Timeout, "timed out after 50ms");
        assert_eq!(err.to_string(), "[timeout] embed: timed out after 50ms");
    }

    #[test]
    fn test_cycle_error_display() {
        let err = EngineError::CycleDetected(vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
        ]);
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> c");
    }

    #[test]
    fn test_node_error_serde_roundtrip() {
        let err = NodeError::new("load", ErrorKind::Execution, "boom");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"execution\""));
        let back: NodeError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
