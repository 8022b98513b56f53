use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::context::NodeStatus;
use crate::error::{EngineError, Result};
use crate::node::NodeId;

/// A persisted record of one node's terminal outcome within a run.
///
/// Written once per completion (success or terminal failure) and
/// overwritten on retry of the same `(run_id, node_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_id: String,
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub output: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn completed(run_id: impl Into<String>, node_id: impl Into<NodeId>, output: Value) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            status: NodeStatus::Completed,
            output: Some(output),
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(run_id: impl Into<String>, node_id: impl Into<NodeId>) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            status: NodeStatus::Failed,
            output: None,
            recorded_at: Utc::now(),
        }
    }
}

/// Persistence backend for resumable runs. Injected into `execute`; the
/// scheduler treats it as a black box.
///
/// `save` must be idempotent per `(run_id, node_id)` — it may be called
/// again for the same node after a retry or a crash, and the last record
/// must win without corrupting earlier ones.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, record: &CheckpointRecord) -> Result<()>;

    /// All records for a run, keyed by node id.
    async fn load(&self, run_id: &str) -> Result<HashMap<NodeId, CheckpointRecord>>;
}

/// In-memory store for tests and single-process runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    runs: DashMap<String, HashMap<NodeId, CheckpointRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes recorded as completed for a run.
    pub fn completed_nodes(&self, run_id: &str) -> HashSet<NodeId> {
        self.runs
            .get(run_id)
            .map(|records| {
                records
                    .values()
                    .filter(|r| r.status == NodeStatus::Completed)
                    .map(|r| r.node_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop all records for a run (cleanup after completion).
    pub fn delete_run(&self, run_id: &str) {
        self.runs.remove(run_id);
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<()> {
        self.runs
            .entry(record.run_id.clone())
            .or_default()
            .insert(record.node_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<HashMap<NodeId, CheckpointRecord>> {
        Ok(self
            .runs
            .get(run_id)
            .map(|records| records.clone())
            .unwrap_or_default())
    }
}

/// Durable store: one JSON-lines file per run under a directory.
///
/// `save` appends a whole record per line; `load` replays the file with
/// last-record-wins per node, so repeated saves are idempotent overwrites.
/// A torn trailing line (crash mid-write) fails to parse and is skipped,
/// so readers never observe a partial record.
pub struct JsonFileCheckpointStore {
    dir: PathBuf,
}

impl JsonFileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        // Run ids are caller-supplied; keep them filesystem-safe.
        let safe: String = run_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.jsonl", safe))
    }
}

#[async_trait]
impl CheckpointStore for JsonFileCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut line = serde_json::to_string(record).map_err(EngineError::serialization)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_path(&record.run_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<HashMap<NodeId, CheckpointRecord>> {
        let path = self.run_path(run_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<CheckpointRecord>(line) {
                Ok(record) => {
                    records.insert(record.node_id.clone(), record);
                }
                Err(e) => {
                    warn!(
                        "Skipping corrupt checkpoint line in {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }
        Ok(records)
    }
}
