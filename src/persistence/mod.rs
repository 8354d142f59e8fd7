pub mod engine;
pub mod validator;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use engine::{PersistenceEngine, StateReadOutcome};
pub use validator::{RecoveryOption, SnapshotValidation, generate_checksum, validate_snapshot};

/// Layer 1: the single live state record for a task. Overwritten atomically
/// on every update; `checksum` covers the serialized content excluding the
/// checksum field itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub status: String,
    pub data: Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub checksum: String,
}

impl TaskState {
    pub fn new(task_id: impl Into<String>, status: impl Into<String>, data: Value) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status: status.into(),
            data,
            metadata: HashMap::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            checksum: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Layer 2: one append-only structured entry, stored as a JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub operation: String,
    pub version: u64,
    pub data: Value,
}

impl LogEntry {
    pub fn new(level: LogLevel, operation: impl Into<String>, version: u64, data: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            operation: operation.into(),
            version,
            data,
        }
    }
}

/// Read-side filter for the Layer 2 log.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub level: Option<LogLevel>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Layer 3: one human-readable decision record, rendered as a markdown block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub task_id: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub decision: String,
    pub reasoning: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    pub outcome: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Full,
    Incremental,
}

/// Layer 4: manifest describing one immutable checkpoint directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub checkpoint_id: String,
    pub task_id: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: CheckpointKind,
    pub files: Vec<String>,
    pub size_bytes: u64,
    pub compressed: bool,
    #[serde(default)]
    pub description: String,
}
