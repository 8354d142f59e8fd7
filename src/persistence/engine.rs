//! Four-layer durable persistence for task state.
//!
//! Layer 1 is the single live `state.json` (checksummed, replaced atomically
//! via temp-file + rename). Layer 2 is an append-only JSONL event log.
//! Layer 3 is an append-only human-readable decision log. Layer 4 holds
//! immutable point-in-time checkpoints, each a subdirectory with a manifest.
//!
//! Throughout this engine a missing file is a valid empty/initial state, not
//! an error; only genuine I/O failures and corruption are surfaced.

use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::validator::{self, RecoveryOption, SnapshotValidation};
use super::{CheckpointKind, CheckpointManifest, Decision, LogEntry, LogFilter, TaskState};
use crate::error::{CoordError, Result};

const STATE_FILE: &str = "state.json";
const BACKUP_FILE: &str = "state.json.bak";
const LOG_FILE: &str = "task_memory.jsonl";
const DECISIONS_FILE: &str = "decisions.md";
const CHECKPOINTS_DIR: &str = "checkpoints";
const MANIFEST_FILE: &str = "manifest.json";

/// Result of a raw Layer 1 read, before any recovery runs.
#[derive(Debug)]
pub enum StateReadOutcome {
    /// No state file on disk.
    Missing,
    Valid(TaskState),
    Corrupt {
        snapshot: Value,
        report: SnapshotValidation,
    },
}

pub struct PersistenceEngine {
    base_dir: PathBuf,
}

impl PersistenceEngine {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(task_id)
    }

    pub fn checkpoints_dir(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(CHECKPOINTS_DIR)
    }

    fn state_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(STATE_FILE)
    }

    fn backup_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(BACKUP_FILE)
    }

    fn log_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(LOG_FILE)
    }

    fn decisions_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(DECISIONS_FILE)
    }

    // ------------------------------------------------------------------
    // Layer 1: current state
    // ------------------------------------------------------------------

    /// Serialize, checksum, and atomically replace the live state file.
    ///
    /// The previous live state (if any) is kept as a `.bak` sidecar, which
    /// later serves as the restore-from-backup recovery source. A reader
    /// never observes a partially written file: the content lands in a temp
    /// path first and is renamed over the live path.
    pub async fn save_state(&self, state: &mut TaskState) -> Result<()> {
        let dir = self.task_dir(&state.task_id);
        fs::create_dir_all(&dir).await?;

        state.updated_at = Utc::now();
        let mut value = serde_json::to_value(&*state)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("checksum");
        }
        state.checksum = validator::generate_checksum(&value);

        let file = self.state_path(&state.task_id);
        if file.exists() {
            fs::copy(&file, self.backup_path(&state.task_id)).await?;
        }

        let temp_file = file.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&temp_file, &json).await?;
        fs::rename(&temp_file, &file).await.inspect_err(|_| {
            let _ = std::fs::remove_file(&temp_file);
        })?;

        debug!(
            task_id = %state.task_id,
            version = state.version,
            "State saved"
        );
        Ok(())
    }

    /// Raw Layer 1 read: missing, valid, or corrupt. No recovery runs here;
    /// a checksum mismatch is reported to the caller, never silently
    /// accepted.
    pub async fn read_state(&self, task_id: &str) -> Result<StateReadOutcome> {
        let content = match fs::read_to_string(self.state_path(task_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StateReadOutcome::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        let Ok(snapshot) = serde_json::from_str::<Value>(&content) else {
            let report = validator::validate_snapshot(&Value::Null);
            return Ok(StateReadOutcome::Corrupt {
                snapshot: Value::Null,
                report,
            });
        };

        let report = validator::validate_snapshot(&snapshot);
        if !report.valid {
            return Ok(StateReadOutcome::Corrupt { snapshot, report });
        }

        let state: TaskState = serde_json::from_value(snapshot)?;
        Ok(StateReadOutcome::Valid(state))
    }

    /// Load the task state, running the ordered recovery chain if the live
    /// file is corrupt. The first recovery option that succeeds wins; if all
    /// fail the task has no recoverable state.
    pub async fn load_state(&self, task_id: &str) -> Result<TaskState> {
        match self.read_state(task_id).await? {
            StateReadOutcome::Valid(state) => Ok(state),
            StateReadOutcome::Missing => Err(CoordError::TaskNotFound(task_id.to_string())),
            StateReadOutcome::Corrupt { report, .. } => {
                warn!(
                    task_id,
                    errors = ?report.errors,
                    "State corrupt, entering recovery chain"
                );
                self.recover(task_id, &report.recovery_options).await
            }
        }
    }

    async fn recover(&self, task_id: &str, options: &[RecoveryOption]) -> Result<TaskState> {
        for option in options {
            let attempt = match option {
                RecoveryOption::RestoreFromLog => self.restore_from_log(task_id).await,
                RecoveryOption::RestoreFromBackup => self.restore_from_backup(task_id).await,
                RecoveryOption::ReconstructFromLogs => self.reconstruct_from_logs(task_id).await,
                RecoveryOption::InitializeEmpty => self.initialize_empty(task_id).await,
                RecoveryOption::EmergencyReset => self.emergency_reset(task_id).await,
            };
            match attempt {
                Ok(state) => {
                    info!(task_id, option = ?option, "Recovery succeeded");
                    return Ok(state);
                }
                Err(e) => {
                    warn!(task_id, option = ?option, error = %e, "Recovery option failed");
                }
            }
        }
        Err(CoordError::NoRecoverableState(task_id.to_string()))
    }

    /// Reinstate the newest full-state payload recorded in the event log
    /// (entries carrying a `state` object in their data).
    async fn restore_from_log(&self, task_id: &str) -> Result<TaskState> {
        let entries = self.read_logs(task_id, &LogFilter::default()).await?;
        let snapshot = entries
            .iter()
            .rev()
            .find_map(|entry| entry.data.get("state").cloned())
            .ok_or_else(|| CoordError::Corruption("no state payload in log".to_string()))?;

        let mut state: TaskState = serde_json::from_value(snapshot)?;
        self.save_state(&mut state).await?;
        Ok(state)
    }

    async fn restore_from_backup(&self, task_id: &str) -> Result<TaskState> {
        let content = fs::read_to_string(self.backup_path(task_id)).await?;
        let snapshot: Value = serde_json::from_str(&content)?;
        let report = validator::validate_snapshot(&snapshot);
        if !report.valid {
            return Err(CoordError::Corruption("backup is also corrupt".to_string()));
        }
        let mut state: TaskState = serde_json::from_value(snapshot)?;
        self.save_state(&mut state).await?;
        Ok(state)
    }

    /// Fold `patch` payloads from the event log, oldest first, into a fresh
    /// state carrying the highest version seen.
    async fn reconstruct_from_logs(&self, task_id: &str) -> Result<TaskState> {
        let entries = self.read_logs(task_id, &LogFilter::default()).await?;
        if entries.is_empty() {
            return Err(CoordError::Corruption("no log entries".to_string()));
        }

        let mut state = TaskState::new(task_id, "recovered", serde_json::json!({}));
        for entry in &entries {
            if let Some(patch) = entry.data.get("patch").and_then(Value::as_object) {
                let data = state
                    .data
                    .as_object_mut()
                    .ok_or_else(|| CoordError::Corruption("state data not an object".to_string()))?;
                for (key, value) in patch {
                    data.insert(key.clone(), value.clone());
                }
            }
            state.version = state.version.max(entry.version);
        }

        self.save_state(&mut state).await?;
        Ok(state)
    }

    async fn initialize_empty(&self, task_id: &str) -> Result<TaskState> {
        let mut state = TaskState::new(task_id, "initialized", serde_json::json!({}));
        self.save_state(&mut state).await?;
        Ok(state)
    }

    /// Last resort: wipe every layer so the next observer starts clean.
    async fn emergency_reset(&self, task_id: &str) -> Result<TaskState> {
        self.cleanup(task_id).await?;
        Ok(TaskState::new(task_id, "reset", serde_json::json!({})))
    }

    // ------------------------------------------------------------------
    // Layer 2: structured event log
    // ------------------------------------------------------------------

    pub async fn append_log(&self, task_id: &str, entry: &LogEntry) -> Result<()> {
        self.append_log_batch(task_id, std::slice::from_ref(entry))
            .await
    }

    /// Append entries as independent JSONL lines.
    pub async fn append_log_batch(&self, task_id: &str, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.task_dir(task_id)).await?;

        let mut buffer = String::new();
        for entry in entries {
            buffer.push_str(&serde_json::to_string(entry)?);
            buffer.push('\n');
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(task_id))
            .await?;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;

        debug!(task_id, appended = entries.len(), "Log entries appended");
        Ok(())
    }

    /// Read log entries, filtered by level and timestamp range, then sliced
    /// by offset/limit. A missing log file reads as empty.
    pub async fn read_logs(&self, task_id: &str, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let content = match fs::read_to_string(self.log_path(task_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(task_id, error = %e, "Skipping malformed log line"),
            }
        }

        let filtered = entries
            .into_iter()
            .filter(|e| filter.level.is_none_or(|level| e.level == level))
            .filter(|e| filter.since.is_none_or(|since| e.timestamp >= since))
            .filter(|e| filter.until.is_none_or(|until| e.timestamp <= until))
            .skip(filter.offset);

        Ok(match filter.limit {
            Some(limit) => filtered.take(limit).collect(),
            None => filtered.collect(),
        })
    }

    // ------------------------------------------------------------------
    // Layer 3: decision log
    // ------------------------------------------------------------------

    /// Append one decision as a fixed text block. Fields are flattened to
    /// single lines so the block stays parseable.
    pub async fn append_decision(&self, decision: &Decision) -> Result<()> {
        fs::create_dir_all(self.task_dir(&decision.task_id)).await?;

        let block = format!(
            "## Decision v{} ({})\n\n- Decision: {}\n- Reasoning: {}\n- Alternatives: {}\n- Outcome: {}\n\n",
            decision.version,
            decision.timestamp.to_rfc3339(),
            single_line(&decision.decision),
            single_line(&decision.reasoning),
            decision
                .alternatives
                .iter()
                .map(|a| single_line(a))
                .collect::<Vec<_>>()
                .join("; "),
            single_line(&decision.outcome),
        );

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.decisions_path(&decision.task_id))
            .await?;
        file.write_all(block.as_bytes()).await?;
        file.flush().await?;

        debug!(task_id = %decision.task_id, version = decision.version, "Decision recorded");
        Ok(())
    }

    /// Parse decision blocks back out of the log. A missing file reads as
    /// no decisions.
    pub async fn read_decisions(&self, task_id: &str) -> Result<Vec<Decision>> {
        let content = match fs::read_to_string(self.decisions_path(task_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut decisions = Vec::new();
        for block in content.split("## Decision ").skip(1) {
            if let Some(decision) = parse_decision_block(task_id, block) {
                decisions.push(decision);
            } else {
                warn!(task_id, "Skipping malformed decision block");
            }
        }
        Ok(decisions)
    }

    // ------------------------------------------------------------------
    // Layer 4: checkpoints
    // ------------------------------------------------------------------

    /// Snapshot the current Layer 1 state and Layer 2 log into an immutable
    /// checkpoint directory with a manifest.
    pub async fn create_checkpoint(
        &self,
        task_id: &str,
        kind: CheckpointKind,
        description: &str,
    ) -> Result<CheckpointManifest> {
        let state = match self.read_state(task_id).await? {
            StateReadOutcome::Valid(state) => state,
            StateReadOutcome::Missing => {
                return Err(CoordError::TaskNotFound(task_id.to_string()));
            }
            StateReadOutcome::Corrupt { .. } => {
                return Err(CoordError::Corruption(format!(
                    "refusing to checkpoint corrupt state for {}",
                    task_id
                )));
            }
        };

        let timestamp = Utc::now();
        // Version plus creation time keeps ids collision-resistant without
        // a registry of issued ids.
        let checkpoint_id = format!(
            "v{}-{}",
            state.version,
            timestamp.format("%Y%m%dT%H%M%S%3fZ")
        );
        let dir = self.checkpoints_dir(task_id).join(&checkpoint_id);
        fs::create_dir_all(&dir).await?;

        let mut files = Vec::new();
        let mut size_bytes = 0u64;

        fs::copy(self.state_path(task_id), dir.join(STATE_FILE)).await?;
        size_bytes += fs::metadata(dir.join(STATE_FILE)).await?.len();
        files.push(STATE_FILE.to_string());

        if self.log_path(task_id).exists() {
            fs::copy(self.log_path(task_id), dir.join("logs.jsonl")).await?;
            size_bytes += fs::metadata(dir.join("logs.jsonl")).await?.len();
            files.push("logs.jsonl".to_string());
        }

        let manifest = CheckpointManifest {
            checkpoint_id: checkpoint_id.clone(),
            task_id: task_id.to_string(),
            version: state.version,
            timestamp,
            kind,
            files,
            size_bytes,
            compressed: false,
            description: description.to_string(),
        };
        fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )
        .await?;

        info!(task_id, checkpoint_id = %checkpoint_id, size_bytes, "Checkpoint created");
        Ok(manifest)
    }

    /// Reinstate Layer 1 from the checkpoint and additively replay the
    /// checkpoint's log entries onto the live Layer 2 log.
    pub async fn restore_checkpoint(
        &self,
        task_id: &str,
        checkpoint_id: &str,
    ) -> Result<TaskState> {
        let dir = self.checkpoints_dir(task_id).join(checkpoint_id);
        if !dir.exists() {
            return Err(CoordError::CheckpointNotFound {
                task_id: task_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
            });
        }

        let state_json = read_maybe_compressed(&dir.join(STATE_FILE)).await?;
        let mut state: TaskState = serde_json::from_str(&state_json)?;
        self.save_state(&mut state).await?;

        let logs_path = dir.join("logs.jsonl");
        match read_maybe_compressed(&logs_path).await {
            Ok(content) => {
                let mut entries = Vec::new();
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    entries.push(serde_json::from_str::<LogEntry>(line)?);
                }
                self.append_log_batch(task_id, &entries).await?;
            }
            Err(CoordError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        info!(task_id, checkpoint_id, version = state.version, "Checkpoint restored");
        Ok(state)
    }

    /// Enumerate checkpoint manifests, newest first. Unreadable manifests
    /// fail the whole listing with an aggregate error naming each offender
    /// rather than being silently dropped.
    pub async fn list_checkpoints(&self, task_id: &str) -> Result<Vec<CheckpointManifest>> {
        let dir = self.checkpoints_dir(task_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut manifests = Vec::new();
        let mut unreadable = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let manifest_path = entry.path().join(MANIFEST_FILE);
            match fs::read_to_string(&manifest_path).await {
                Ok(content) => match serde_json::from_str::<CheckpointManifest>(&content) {
                    Ok(manifest) => manifests.push(manifest),
                    Err(_) => unreadable.push(name),
                },
                Err(_) => unreadable.push(name),
            }
        }

        if !unreadable.is_empty() {
            unreadable.sort();
            return Err(CoordError::ManifestErrors(unreadable));
        }

        manifests.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(manifests)
    }

    pub async fn latest_checkpoint(&self, task_id: &str) -> Result<Option<CheckpointManifest>> {
        Ok(self.list_checkpoints(task_id).await?.into_iter().next())
    }

    /// Remove every layer for a task. Calling it on an already-clean task is
    /// a no-op, never an error.
    pub async fn cleanup(&self, task_id: &str) -> Result<()> {
        match fs::remove_dir_all(self.task_dir(task_id)).await {
            Ok(()) => {
                info!(task_id, "Task data removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn single_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

fn parse_decision_block(task_id: &str, block: &str) -> Option<Decision> {
    let mut lines = block.lines();
    let header = lines.next()?;
    let version: u64 = header
        .strip_prefix('v')?
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    let timestamp = header
        .split('(')
        .nth(1)?
        .trim_end_matches(')')
        .parse()
        .ok()?;

    let mut decision = None;
    let mut reasoning = None;
    let mut alternatives = Vec::new();
    let mut outcome = None;
    for line in lines {
        if let Some(rest) = line.strip_prefix("- Decision: ") {
            decision = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("- Reasoning: ") {
            reasoning = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("- Alternatives: ") {
            alternatives = rest
                .split("; ")
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        } else if let Some(rest) = line.strip_prefix("- Outcome: ") {
            outcome = Some(rest.to_string());
        }
    }

    Some(Decision {
        task_id: task_id.to_string(),
        version,
        timestamp,
        decision: decision?,
        reasoning: reasoning?,
        alternatives,
        outcome: outcome?,
    })
}

/// Read a checkpoint file that the optimizer may have gzipped in place.
async fn read_maybe_compressed(path: &Path) -> Result<String> {
    if path.exists() {
        return Ok(fs::read_to_string(path).await?);
    }

    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    let bytes = fs::read(&gz_path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CoordError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} (plain or .gz)", path.display()),
            ))
        } else {
            e.into()
        }
    })?;

    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut content = String::new();
    decoder
        .read_to_string(&mut content)
        .map_err(|e| CoordError::Corruption(format!("gzip decode failed: {}", e)))?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::LogLevel;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PersistenceEngine) {
        let dir = TempDir::new().unwrap();
        let engine = PersistenceEngine::new(dir.path());
        (dir, engine)
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let (_dir, engine) = setup();
        let mut state = TaskState::new("task-1", "running", json!({"step": 1}));
        state.version = 3;
        engine.save_state(&mut state).await.unwrap();

        let loaded = engine.load_state("task-1").await.unwrap();
        assert_eq!(loaded.data, json!({"step": 1}));
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.checksum, state.checksum);
    }

    #[tokio::test]
    async fn test_missing_state_is_not_found() {
        let (_dir, engine) = setup();
        let result = engine.load_state("ghost").await;
        assert!(matches!(result, Err(CoordError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_corrupt_state_recovers_from_backup() {
        let (dir, engine) = setup();
        let mut state = TaskState::new("task-1", "running", json!({"step": 1}));
        engine.save_state(&mut state).await.unwrap();
        // Second save creates the .bak sidecar from the first.
        state.data = json!({"step": 2});
        engine.save_state(&mut state).await.unwrap();

        // Corrupt the live file.
        std::fs::write(dir.path().join("task-1").join("state.json"), "{broken").unwrap();

        let recovered = engine.load_state("task-1").await.unwrap();
        assert_eq!(recovered.data, json!({"step": 1}));
    }

    #[tokio::test]
    async fn test_corrupt_state_recovers_from_log_payload() {
        let (dir, engine) = setup();
        let mut state = TaskState::new("task-1", "running", json!({"step": 7}));
        engine.save_state(&mut state).await.unwrap();

        engine
            .append_log(
                "task-1",
                &LogEntry::new(
                    LogLevel::Info,
                    "snapshot",
                    1,
                    json!({"state": serde_json::to_value(&state).unwrap()}),
                ),
            )
            .await
            .unwrap();

        std::fs::write(dir.path().join("task-1").join("state.json"), "not json").unwrap();

        let recovered = engine.load_state("task-1").await.unwrap();
        assert_eq!(recovered.data, json!({"step": 7}));
    }

    #[tokio::test]
    async fn test_corrupt_state_falls_back_to_empty() {
        let (dir, engine) = setup();
        let task_dir = dir.path().join("task-1");
        std::fs::create_dir_all(&task_dir).unwrap();
        std::fs::write(task_dir.join("state.json"), "garbage").unwrap();

        // No log, no backup: the chain lands on initialize-empty.
        let recovered = engine.load_state("task-1").await.unwrap();
        assert_eq!(recovered.status, "initialized");
        assert_eq!(recovered.data, json!({}));
    }

    #[tokio::test]
    async fn test_log_filtering_and_slicing() {
        let (_dir, engine) = setup();
        let entries: Vec<LogEntry> = (0..10)
            .map(|i| {
                LogEntry::new(
                    if i % 2 == 0 { LogLevel::Info } else { LogLevel::Warn },
                    format!("op-{}", i),
                    i,
                    json!({}),
                )
            })
            .collect();
        engine.append_log_batch("task-1", &entries).await.unwrap();

        let warns = engine
            .read_logs(
                "task-1",
                &LogFilter {
                    level: Some(LogLevel::Warn),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(warns.len(), 5);

        let page = engine
            .read_logs(
                "task-1",
                &LogFilter {
                    offset: 2,
                    limit: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].operation, "op-2");
    }

    #[tokio::test]
    async fn test_empty_log_reads_empty() {
        let (_dir, engine) = setup();
        let entries = engine
            .read_logs("task-1", &LogFilter::default())
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_decision_round_trip() {
        let (_dir, engine) = setup();
        let decision = Decision {
            task_id: "task-1".to_string(),
            version: 2,
            timestamp: Utc::now(),
            decision: "switch to incremental checkpoints".to_string(),
            reasoning: "full snapshots exceeded the storage cap".to_string(),
            alternatives: vec!["raise the cap".to_string(), "prune logs".to_string()],
            outcome: "accepted".to_string(),
        };
        engine.append_decision(&decision).await.unwrap();
        engine.append_decision(&decision).await.unwrap();

        let decisions = engine.read_decisions("task-1").await.unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].decision, decision.decision);
        assert_eq!(decisions[0].alternatives, decision.alternatives);
        assert_eq!(decisions[0].version, 2);
    }

    #[tokio::test]
    async fn test_checkpoint_restore_rewinds_state() {
        let (_dir, engine) = setup();
        let mut state = TaskState::new("task-1", "running", json!({"step": 1}));
        engine.save_state(&mut state).await.unwrap();

        let manifest = engine
            .create_checkpoint("task-1", CheckpointKind::Full, "before step 2")
            .await
            .unwrap();

        state.data = json!({"step": 2});
        engine.save_state(&mut state).await.unwrap();

        let restored = engine
            .restore_checkpoint("task-1", &manifest.checkpoint_id)
            .await
            .unwrap();
        assert_eq!(restored.data, json!({"step": 1}));

        let loaded = engine.load_state("task-1").await.unwrap();
        assert_eq!(loaded.data["step"], json!(1));
    }

    #[tokio::test]
    async fn test_restore_replays_logs_additively() {
        let (_dir, engine) = setup();
        let mut state = TaskState::new("task-1", "running", json!({}));
        engine.save_state(&mut state).await.unwrap();
        engine
            .append_log("task-1", &LogEntry::new(LogLevel::Info, "before", 1, json!({})))
            .await
            .unwrap();

        let manifest = engine
            .create_checkpoint("task-1", CheckpointKind::Full, "")
            .await
            .unwrap();

        engine
            .append_log("task-1", &LogEntry::new(LogLevel::Info, "after", 2, json!({})))
            .await
            .unwrap();
        engine
            .restore_checkpoint("task-1", &manifest.checkpoint_id)
            .await
            .unwrap();

        // Live log keeps both entries plus the replayed snapshot copy.
        let entries = engine
            .read_logs("task-1", &LogFilter::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn test_list_checkpoints_fails_loudly_on_bad_manifest() {
        let (dir, engine) = setup();
        let mut state = TaskState::new("task-1", "running", json!({}));
        engine.save_state(&mut state).await.unwrap();
        engine
            .create_checkpoint("task-1", CheckpointKind::Full, "")
            .await
            .unwrap();

        let bad_dir = dir
            .path()
            .join("task-1")
            .join("checkpoints")
            .join("bogus-checkpoint");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join("manifest.json"), "{nope").unwrap();

        let result = engine.list_checkpoints("task-1").await;
        match result {
            Err(CoordError::ManifestErrors(names)) => {
                assert_eq!(names, vec!["bogus-checkpoint".to_string()]);
            }
            other => panic!("expected ManifestErrors, got {:?}", other.map(|v| v.len())),
        }
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (_dir, engine) = setup();
        let mut state = TaskState::new("task-1", "running", json!({}));
        engine.save_state(&mut state).await.unwrap();

        engine.cleanup("task-1").await.unwrap();
        engine.cleanup("task-1").await.unwrap();
        assert!(matches!(
            engine.load_state("task-1").await,
            Err(CoordError::TaskNotFound(_))
        ));
    }
}
