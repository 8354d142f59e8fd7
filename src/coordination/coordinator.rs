//! Multi-agent coordination: registration, pairwise conflict detection over
//! declared operations, resolution strategies, and result merging.
//!
//! The coordinator owns its registries exclusively. Agents declare intended
//! operations before acting; an operation is only admitted into the agent's
//! pending set when no other agent on the same task targets the same
//! resource.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoordinationConfig;
use crate::error::{CoordError, Result};
use crate::lock::Operation;

/// Marker artifact written into each registered agent's workspace.
const AGENT_MARKER: &str = ".taskweave-agent";

#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub task_id: String,
    pub workspace: PathBuf,
    pub registered_at: DateTime<Utc>,
    pub active: bool,
    pub operation_count: u64,
    pub conflict_count: u64,
    pending: Vec<Operation>,
    resources: HashSet<String>,
}

/// Public snapshot of an agent's coordination state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub task_id: String,
    pub active: bool,
    pub operation_count: u64,
    pub conflict_count: u64,
    pub pending_operations: usize,
    pub resources_held: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    FileWrite,
    Dependency,
    ResourceLock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConflict {
    pub conflict_id: String,
    pub task_id: String,
    pub kind: ConflictKind,
    /// The already-admitted operation.
    pub first: Operation,
    /// The proposed operation that was not admitted.
    pub second: Operation,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    Wait,
    Merge,
    Skip,
    Abort,
    RetryLater,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub conflict_id: String,
    pub strategy: ResolutionStrategy,
    pub success: bool,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedConflict {
    pub conflict: AgentConflict,
    pub outcome: ResolutionOutcome,
    pub resolved_at: DateTime<Utc>,
}

/// Per-agent execution result fed into `merge_results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    pub success: bool,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedResult {
    pub task_id: String,
    pub files_modified: Vec<String>,
    pub outputs: HashMap<String, serde_json::Value>,
    /// One entry per output-key collision; the first writer's value is kept.
    pub merge_conflicts: Vec<String>,
    pub success_count: usize,
    pub failure_count: usize,
}

pub struct ParallelCoordinator {
    agents: DashMap<String, AgentRegistration>,
    active_conflicts: DashMap<String, AgentConflict>,
    conflict_history: Mutex<Vec<ResolvedConflict>>,
    /// resource name -> holding agent id
    resources: DashMap<String, String>,
    config: CoordinationConfig,
}

impl ParallelCoordinator {
    pub fn new(config: CoordinationConfig) -> Self {
        Self {
            agents: DashMap::new(),
            active_conflicts: DashMap::new(),
            conflict_history: Mutex::new(Vec::new()),
            resources: DashMap::new(),
            config,
        }
    }

    /// Register an agent and stamp its workspace with an isolation marker.
    ///
    /// Idempotent: re-registration updates the workspace and timestamp
    /// instead of erroring.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        task_id: &str,
        workspace: &Path,
    ) -> Result<()> {
        fs::create_dir_all(workspace).await?;

        let marker = serde_json::json!({
            "agent_id": agent_id,
            "task_id": task_id,
            "registered_at": Utc::now(),
        });
        fs::write(
            workspace.join(AGENT_MARKER),
            serde_json::to_string_pretty(&marker)?,
        )
        .await?;

        match self.agents.entry(agent_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let reg = occupied.get_mut();
                reg.task_id = task_id.to_string();
                reg.workspace = workspace.to_path_buf();
                reg.registered_at = Utc::now();
                reg.active = true;
                debug!(agent_id, task_id, "Agent re-registered");
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(AgentRegistration {
                    agent_id: agent_id.to_string(),
                    task_id: task_id.to_string(),
                    workspace: workspace.to_path_buf(),
                    registered_at: Utc::now(),
                    active: true,
                    operation_count: 0,
                    conflict_count: 0,
                    pending: Vec::new(),
                    resources: HashSet::new(),
                });
                info!(agent_id, task_id, workspace = %workspace.display(), "Agent registered");
            }
        }

        Ok(())
    }

    /// Compare a proposed operation against every other agent's pending
    /// operations on the same task. On conflict the operation is NOT
    /// admitted; otherwise it joins the declaring agent's pending set.
    pub fn detect_conflict(
        &self,
        agent_id: &str,
        operation: Operation,
    ) -> Result<Option<AgentConflict>> {
        if !self.agents.contains_key(agent_id) {
            return Err(CoordError::AgentNotRegistered(agent_id.to_string()));
        }

        let mut found: Option<(String, Operation)> = None;
        for entry in self.agents.iter() {
            if entry.key() == agent_id || entry.task_id != operation.task_id {
                continue;
            }
            if let Some(other) = entry
                .pending
                .iter()
                .find(|op| op.target == operation.target)
            {
                found = Some((entry.key().clone(), other.clone()));
                break;
            }
        }

        let Some((other_agent, other_op)) = found else {
            if let Some(mut reg) = self.agents.get_mut(agent_id) {
                reg.pending.push(operation);
                reg.operation_count += 1;
            }
            return Ok(None);
        };

        let kind = classify_conflict(&other_op, &operation);
        let conflict = AgentConflict {
            conflict_id: Uuid::new_v4().to_string(),
            task_id: operation.task_id.clone(),
            kind,
            first: other_op,
            second: operation,
            detected_at: Utc::now(),
        };

        self.active_conflicts
            .insert(conflict.conflict_id.clone(), conflict.clone());
        if let Some(mut reg) = self.agents.get_mut(agent_id) {
            reg.conflict_count += 1;
        }
        if let Some(mut reg) = self.agents.get_mut(&other_agent) {
            reg.conflict_count += 1;
        }

        warn!(
            conflict_id = %conflict.conflict_id,
            task_id = %conflict.task_id,
            kind = ?kind,
            first = %conflict.first.agent_id,
            second = %conflict.second.agent_id,
            target = %conflict.second.target,
            "Operation conflict detected"
        );

        Ok(Some(conflict))
    }

    /// Execute a resolution strategy. Resolution is terminal: the conflict
    /// moves from the active table to history and cannot be resolved twice.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<ResolutionOutcome> {
        let Some((_, conflict)) = self.active_conflicts.remove(conflict_id) else {
            return Err(CoordError::ConflictNotFound(conflict_id.to_string()));
        };

        let outcome = match strategy {
            ResolutionStrategy::Wait => {
                // Cooperative backoff, not a re-check: the caller is expected
                // to re-declare the operation afterwards.
                let delay = Duration::from_millis(self.config.wait_resolution_delay_ms);
                tokio::time::sleep(delay).await;
                ResolutionOutcome {
                    conflict_id: conflict_id.to_string(),
                    strategy,
                    success: true,
                    detail: format!("waited {}ms", delay.as_millis()),
                }
            }
            ResolutionStrategy::Merge => {
                let mergeable = conflict.first.is_read() || conflict.second.is_read();
                ResolutionOutcome {
                    conflict_id: conflict_id.to_string(),
                    strategy,
                    success: mergeable,
                    detail: if mergeable {
                        "merged: at least one side is a read".to_string()
                    } else {
                        "cannot merge two writes".to_string()
                    },
                }
            }
            ResolutionStrategy::Abort => {
                // Drop the second (non-admitted side's earlier twin may also
                // exist; abort targets the losing agent's pending entry).
                if let Some(mut reg) = self.agents.get_mut(&conflict.second.agent_id) {
                    reg.pending.retain(|op| op.target != conflict.second.target);
                }
                ResolutionOutcome {
                    conflict_id: conflict_id.to_string(),
                    strategy,
                    success: true,
                    detail: format!("aborted {}'s operation", conflict.second.agent_id),
                }
            }
            ResolutionStrategy::Skip | ResolutionStrategy::RetryLater => ResolutionOutcome {
                conflict_id: conflict_id.to_string(),
                strategy,
                success: true,
                detail: "advisory: no coordinator state changed".to_string(),
            },
        };

        debug!(
            conflict_id,
            strategy = ?strategy,
            success = outcome.success,
            "Conflict resolved"
        );

        self.conflict_history.lock().push(ResolvedConflict {
            conflict,
            outcome: outcome.clone(),
            resolved_at: Utc::now(),
        });

        Ok(outcome)
    }

    /// Claim a named resource. Fails if held by a different agent;
    /// re-acquisition by the current holder succeeds.
    pub fn acquire_resource(&self, resource: &str, agent_id: &str) -> bool {
        match self.resources.entry(resource.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.get() == agent_id,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(agent_id.to_string());
                if let Some(mut reg) = self.agents.get_mut(agent_id) {
                    reg.resources.insert(resource.to_string());
                }
                debug!(resource, agent_id, "Resource acquired");
                true
            }
        }
    }

    pub fn release_resource(&self, resource: &str, agent_id: &str) -> bool {
        let removed = self
            .resources
            .remove_if(resource, |_, holder| holder == agent_id)
            .is_some();
        if removed && let Some(mut reg) = self.agents.get_mut(agent_id) {
            reg.resources.remove(resource);
        }
        removed
    }

    /// Merge per-agent results: files are unioned, outputs are first-writer-
    /// wins with every collision recorded rather than silently overwritten.
    pub fn merge_results(&self, task_id: &str, results: &[AgentResult]) -> MergedResult {
        let mut files_modified = Vec::new();
        let mut seen_files = HashSet::new();
        let mut outputs: HashMap<String, serde_json::Value> = HashMap::new();
        let mut first_writer: HashMap<String, String> = HashMap::new();
        let mut merge_conflicts = Vec::new();
        let mut success_count = 0;
        let mut failure_count = 0;

        for result in results {
            if result.success {
                success_count += 1;
            } else {
                failure_count += 1;
            }

            for file in &result.files_modified {
                if seen_files.insert(file.clone()) {
                    files_modified.push(file.clone());
                }
            }

            for (key, value) in &result.outputs {
                if let Some(winner) = first_writer.get(key) {
                    merge_conflicts.push(format!(
                        "output '{}': kept {}'s value, discarded {}'s",
                        key, winner, result.agent_id
                    ));
                } else {
                    first_writer.insert(key.clone(), result.agent_id.clone());
                    outputs.insert(key.clone(), value.clone());
                }
            }
        }

        if !merge_conflicts.is_empty() {
            warn!(
                task_id,
                conflicts = merge_conflicts.len(),
                "Output collisions during result merge"
            );
        }

        MergedResult {
            task_id: task_id.to_string(),
            files_modified,
            outputs,
            merge_conflicts,
            success_count,
            failure_count,
        }
    }

    pub fn get_agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.agents.get(agent_id).map(|reg| AgentStatus {
            agent_id: reg.agent_id.clone(),
            task_id: reg.task_id.clone(),
            active: reg.active,
            operation_count: reg.operation_count,
            conflict_count: reg.conflict_count,
            pending_operations: reg.pending.len(),
            resources_held: reg.resources.iter().cloned().collect(),
        })
    }

    /// Release everything the agent holds and drop it from the registry.
    pub fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        let Some((_, mut reg)) = self.agents.remove(agent_id) else {
            return Err(CoordError::AgentNotRegistered(agent_id.to_string()));
        };
        reg.active = false;

        self.resources
            .retain(|_, holder| holder.as_str() != agent_id);

        info!(
            agent_id,
            task_id = %reg.task_id,
            released = reg.resources.len(),
            "Agent unregistered"
        );
        Ok(())
    }

    pub fn active_conflicts(&self) -> Vec<AgentConflict> {
        self.active_conflicts
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn conflict_history(&self) -> Vec<ResolvedConflict> {
        self.conflict_history.lock().clone()
    }
}

/// Classification precedence: a write to a shared target trumps dependency
/// edges, which trump generic resource contention.
fn classify_conflict(first: &Operation, second: &Operation) -> ConflictKind {
    if first.is_write() || second.is_write() {
        ConflictKind::FileWrite
    } else if first.dependency() == Some(second.target.as_str())
        || second.dependency() == Some(first.target.as_str())
    {
        ConflictKind::Dependency
    } else {
        ConflictKind::ResourceLock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, ParallelCoordinator) {
        let dir = TempDir::new().unwrap();
        let coordinator = ParallelCoordinator::new(CoordinationConfig {
            wait_resolution_delay_ms: 10,
            ..Default::default()
        });
        coordinator
            .register_agent("agent-1", "task-1", &dir.path().join("ws1"))
            .await
            .unwrap();
        coordinator
            .register_agent("agent-2", "task-1", &dir.path().join("ws2"))
            .await
            .unwrap();
        (dir, coordinator)
    }

    #[tokio::test]
    async fn test_register_writes_marker() {
        let dir = TempDir::new().unwrap();
        let coordinator = ParallelCoordinator::new(CoordinationConfig::default());
        let workspace = dir.path().join("ws");
        coordinator
            .register_agent("agent-1", "task-1", &workspace)
            .await
            .unwrap();

        let marker = std::fs::read_to_string(workspace.join(AGENT_MARKER)).unwrap();
        assert!(marker.contains("agent-1"));
    }

    #[tokio::test]
    async fn test_reregistration_is_idempotent() {
        let (dir, coordinator) = setup().await;
        coordinator
            .register_agent("agent-1", "task-2", &dir.path().join("ws1b"))
            .await
            .unwrap();

        let status = coordinator.get_agent_status("agent-1").unwrap();
        assert_eq!(status.task_id, "task-2");
    }

    #[tokio::test]
    async fn test_write_conflict_not_admitted() {
        let (_dir, coordinator) = setup().await;

        let admitted = coordinator
            .detect_conflict(
                "agent-1",
                Operation::new("agent-1", "task-1", "FILE_WRITE", "file.txt"),
            )
            .unwrap();
        assert!(admitted.is_none());

        let conflict = coordinator
            .detect_conflict(
                "agent-2",
                Operation::new("agent-2", "task-1", "FILE_WRITE", "file.txt"),
            )
            .unwrap()
            .expect("conflict expected");
        assert_eq!(conflict.kind, ConflictKind::FileWrite);

        // The losing operation must not join agent-2's pending set.
        let status = coordinator.get_agent_status("agent-2").unwrap();
        assert_eq!(status.pending_operations, 0);
        assert_eq!(status.conflict_count, 1);
    }

    #[tokio::test]
    async fn test_dependency_classification() {
        let (_dir, coordinator) = setup().await;

        coordinator
            .detect_conflict(
                "agent-1",
                Operation::new("agent-1", "task-1", "analyze", "module-a"),
            )
            .unwrap();

        let conflict = coordinator
            .detect_conflict(
                "agent-2",
                Operation::new("agent-2", "task-1", "refactor", "module-a")
                    .with_metadata("dependency", "module-a"),
            )
            .unwrap()
            .expect("conflict expected");
        assert_eq!(conflict.kind, ConflictKind::Dependency);
    }

    #[tokio::test]
    async fn test_different_tasks_do_not_conflict() {
        let (dir, coordinator) = setup().await;
        coordinator
            .register_agent("agent-3", "task-2", &dir.path().join("ws3"))
            .await
            .unwrap();

        coordinator
            .detect_conflict(
                "agent-1",
                Operation::new("agent-1", "task-1", "FILE_WRITE", "shared.txt"),
            )
            .unwrap();

        let conflict = coordinator
            .detect_conflict(
                "agent-3",
                Operation::new("agent-3", "task-2", "FILE_WRITE", "shared.txt"),
            )
            .unwrap();
        assert!(conflict.is_none());
    }

    #[tokio::test]
    async fn test_resolution_is_terminal() {
        let (_dir, coordinator) = setup().await;
        coordinator
            .detect_conflict(
                "agent-1",
                Operation::new("agent-1", "task-1", "FILE_WRITE", "f"),
            )
            .unwrap();
        let conflict = coordinator
            .detect_conflict(
                "agent-2",
                Operation::new("agent-2", "task-1", "FILE_WRITE", "f"),
            )
            .unwrap()
            .unwrap();

        let outcome = coordinator
            .resolve_conflict(&conflict.conflict_id, ResolutionStrategy::Skip)
            .await
            .unwrap();
        assert!(outcome.success);

        let again = coordinator
            .resolve_conflict(&conflict.conflict_id, ResolutionStrategy::Skip)
            .await;
        assert!(matches!(again, Err(CoordError::ConflictNotFound(_))));
        assert_eq!(coordinator.conflict_history().len(), 1);
    }

    #[tokio::test]
    async fn test_merge_requires_a_read() {
        let (_dir, coordinator) = setup().await;
        coordinator
            .detect_conflict(
                "agent-1",
                Operation::new("agent-1", "task-1", "FILE_WRITE", "f"),
            )
            .unwrap();
        let conflict = coordinator
            .detect_conflict(
                "agent-2",
                Operation::new("agent-2", "task-1", "FILE_WRITE", "f"),
            )
            .unwrap()
            .unwrap();

        let outcome = coordinator
            .resolve_conflict(&conflict.conflict_id, ResolutionStrategy::Merge)
            .await
            .unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_abort_removes_pending_operation() {
        let (_dir, coordinator) = setup().await;
        coordinator
            .detect_conflict(
                "agent-1",
                Operation::new("agent-1", "task-1", "read_config", "cfg"),
            )
            .unwrap();
        // Admit a second op for agent-2 first so abort has something to drop.
        coordinator
            .detect_conflict(
                "agent-2",
                Operation::new("agent-2", "task-1", "read_config", "other"),
            )
            .unwrap();
        let conflict = coordinator
            .detect_conflict(
                "agent-2",
                Operation::new("agent-2", "task-1", "FILE_WRITE", "cfg"),
            )
            .unwrap()
            .unwrap();

        coordinator
            .resolve_conflict(&conflict.conflict_id, ResolutionStrategy::Abort)
            .await
            .unwrap();

        let status = coordinator.get_agent_status("agent-2").unwrap();
        assert_eq!(status.pending_operations, 1);
    }

    #[tokio::test]
    async fn test_resource_table() {
        let (_dir, coordinator) = setup().await;

        assert!(coordinator.acquire_resource("db", "agent-1"));
        // Idempotent re-acquisition by the holder.
        assert!(coordinator.acquire_resource("db", "agent-1"));
        assert!(!coordinator.acquire_resource("db", "agent-2"));

        assert!(!coordinator.release_resource("db", "agent-2"));
        assert!(coordinator.release_resource("db", "agent-1"));
        assert!(coordinator.acquire_resource("db", "agent-2"));
    }

    #[tokio::test]
    async fn test_merge_results_first_writer_wins() {
        let (_dir, coordinator) = setup().await;

        let results = vec![
            AgentResult {
                agent_id: "agent-1".to_string(),
                success: true,
                files_modified: vec!["a.rs".to_string(), "b.rs".to_string()],
                outputs: HashMap::from([("a".to_string(), serde_json::json!(1))]),
            },
            AgentResult {
                agent_id: "agent-2".to_string(),
                success: false,
                files_modified: vec!["b.rs".to_string()],
                outputs: HashMap::from([("a".to_string(), serde_json::json!(2))]),
            },
        ];

        let merged = coordinator.merge_results("task-1", &results);
        assert_eq!(merged.files_modified, vec!["a.rs", "b.rs"]);
        assert_eq!(merged.outputs["a"], serde_json::json!(1));
        assert_eq!(merged.merge_conflicts.len(), 1);
        assert_eq!(merged.success_count, 1);
        assert_eq!(merged.failure_count, 1);
    }

    #[tokio::test]
    async fn test_unregister_releases_resources() {
        let (_dir, coordinator) = setup().await;
        coordinator.acquire_resource("db", "agent-1");

        coordinator.unregister_agent("agent-1").unwrap();
        assert!(coordinator.get_agent_status("agent-1").is_none());
        assert!(coordinator.acquire_resource("db", "agent-2"));
    }
}
