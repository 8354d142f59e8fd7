//! Stateless conflict detection over versions and declared operations.
//!
//! These checks are heuristics for cooperating agents: the time-window scan
//! flags writes that landed close together, it does not prove a causal race.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A declared intent to operate on a task, tracked per agent and compared
/// pairwise against other agents' intents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub agent_id: String,
    pub task_id: String,
    /// Free-form operation kind, e.g. "FILE_WRITE" or "read_config".
    pub kind: String,
    /// The resource the operation touches; identical targets collide.
    pub target: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Operation {
    pub fn new(
        agent_id: impl Into<String>,
        task_id: impl Into<String>,
        kind: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_id: task_id.into(),
            kind: kind.into(),
            target: target.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the operation kind denotes a write.
    pub fn is_write(&self) -> bool {
        self.kind.to_lowercase().contains("write")
    }

    /// Whether the operation kind denotes a read.
    pub fn is_read(&self) -> bool {
        self.kind.to_lowercase().contains("read")
    }

    /// Declared dependency target, if the operation carries one.
    pub fn dependency(&self) -> Option<&str> {
        self.metadata.get("dependency").map(String::as_str)
    }
}

/// Produced when a check fails; consumed immediately by the caller, never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// Agent on the other side of the conflict.
    pub conflict_with: String,
    pub expected_version: u64,
    pub actual_version: u64,
    /// Tag describing which check failed.
    pub operation: String,
}

/// Returns a conflict iff the versions differ.
pub fn detect_version_conflict(
    conflict_with: &str,
    expected: u64,
    actual: u64,
) -> Option<ConflictInfo> {
    if expected == actual {
        return None;
    }
    Some(ConflictInfo {
        conflict_with: conflict_with.to_string(),
        expected_version: expected,
        actual_version: actual,
        operation: "version_mismatch".to_string(),
    })
}

/// Flag adjacent operations on the same task whose timestamps fall within
/// `window_ms` of each other as concurrent writes.
pub fn detect_collaborative_conflicts(operations: &[Operation], window_ms: i64) -> Vec<ConflictInfo> {
    let mut by_task: HashMap<&str, Vec<&Operation>> = HashMap::new();
    for op in operations {
        by_task.entry(op.task_id.as_str()).or_default().push(op);
    }

    let mut conflicts = Vec::new();
    for ops in by_task.values_mut() {
        ops.sort_by_key(|op| op.timestamp);
        for pair in ops.windows(2) {
            let (earlier, later) = (pair[0], pair[1]);
            let gap = later
                .timestamp
                .signed_duration_since(earlier.timestamp)
                .num_milliseconds();
            if gap <= window_ms {
                conflicts.push(ConflictInfo {
                    conflict_with: earlier.agent_id.clone(),
                    expected_version: 0,
                    actual_version: 0,
                    operation: "concurrent_write".to_string(),
                });
            }
        }
    }

    conflicts
}

/// Map a conflict's operation tag to a human-readable remediation.
pub fn suggest_resolution(conflict: &ConflictInfo) -> String {
    match conflict.operation.as_str() {
        "version_mismatch" => format!(
            "Reload the task at version {} and retry with the current version",
            conflict.actual_version
        ),
        "concurrent_write" => format!(
            "Serialize writes with {} or switch both agents to collaborative locking",
            conflict.conflict_with
        ),
        "acquire_exclusive" => format!(
            "Wait for {}'s lease to expire or request a release",
            conflict.conflict_with
        ),
        "release" | "renew" => format!(
            "Only the holder ({}) may release or renew this lock",
            conflict.conflict_with
        ),
        _ => "Coordinate with the conflicting agent before retrying".to_string(),
    }
}
