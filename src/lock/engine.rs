//! Optimistic per-task locking with lease expiry and version fencing.
//!
//! Every task has a single authoritative record holding its monotonic version
//! and the set of live holders. All check-then-act sequences run inside one
//! `DashMap` entry guard for the task id, so two agents racing on the same
//! task are serialized while different tasks proceed in parallel.
//!
//! Leases expire lazily: an expired lock is evicted the next time any
//! operation observes the task record, never by a background timer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::conflict::ConflictInfo;
use crate::config::LockConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Only one holder at a time; any other live holder denies acquisition.
    Exclusive,
    /// Any number of holders; each acquisition bumps the task version, which
    /// acts as a fencing token rather than a single-writer gate.
    Collaborative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub task_id: String,
    pub agent_id: String,
    pub mode: LockMode,
    pub version: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_renewed_at: DateTime<Utc>,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Acquired,
    Renewed,
    Released,
    Conflict,
    Timeout,
    NotFound,
}

/// Structured result of an acquisition attempt. Callers branch on `status`;
/// `conflict` carries holder and version context when the attempt was denied.
#[derive(Debug, Clone)]
pub struct AcquireOutcome {
    pub success: bool,
    pub status: LockStatus,
    pub lock: Option<Lock>,
    pub conflict: Option<ConflictInfo>,
}

impl AcquireOutcome {
    fn granted(status: LockStatus, lock: Lock) -> Self {
        Self {
            success: true,
            status,
            lock: Some(lock),
            conflict: None,
        }
    }

    fn denied(status: LockStatus, conflict: Option<ConflictInfo>) -> Self {
        Self {
            success: false,
            status,
            lock: None,
            conflict,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseOutcome {
    pub status: LockStatus,
    pub conflict: Option<ConflictInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct LockStats {
    pub tasks_tracked: usize,
    pub active_locks: usize,
    pub exclusive_locks: usize,
    pub collaborative_locks: usize,
}

/// Authoritative per-task record. The version survives releases so a later
/// acquisition continues the fencing sequence instead of restarting it.
#[derive(Debug, Default)]
struct TaskLockState {
    version: u64,
    holders: Vec<Lock>,
}

impl TaskLockState {
    fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.holders.len();
        self.holders.retain(|l| !l.is_expired(now));
        before - self.holders.len()
    }
}

pub struct LockEngine {
    tasks: DashMap<String, TaskLockState>,
    config: LockConfig,
}

impl LockEngine {
    pub fn new(config: LockConfig) -> Self {
        Self {
            tasks: DashMap::new(),
            config,
        }
    }

    /// Acquire a lock, retrying transient failures with linear backoff.
    ///
    /// A conflict is terminal and returned immediately without retry; only
    /// non-conflict failures consume the retry budget. Exhausting the budget
    /// yields `LockStatus::Timeout`.
    pub async fn acquire(
        &self,
        task_id: &str,
        agent_id: &str,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> AcquireOutcome {
        let lease_ms = timeout
            .map(|d| d.as_millis() as u64)
            .unwrap_or(self.config.default_timeout_ms);

        for attempt in 1..=self.config.max_attempts {
            let outcome = self.try_acquire(task_id, agent_id, mode, lease_ms);
            if outcome.success || outcome.status == LockStatus::Conflict {
                return outcome;
            }

            if attempt < self.config.max_attempts {
                let backoff = Duration::from_millis(self.config.backoff_ms * attempt as u64);
                debug!(
                    task_id,
                    agent_id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Lock acquisition failed, backing off"
                );
                tokio::time::sleep(backoff).await;
            }
        }

        AcquireOutcome::denied(LockStatus::Timeout, None)
    }

    /// Single acquisition attempt. Runs entirely within the task's entry
    /// guard: expiry eviction and the subsequent grant are one critical
    /// section, so two readers cannot both observe "expired" and both create
    /// a fresh lock.
    pub fn try_acquire(
        &self,
        task_id: &str,
        agent_id: &str,
        mode: LockMode,
        lease_ms: u64,
    ) -> AcquireOutcome {
        let now = Utc::now();
        let mut entry = self.tasks.entry(task_id.to_string()).or_default();
        let state = entry.value_mut();
        state.evict_expired(now);

        // Same agent already holding: renew in place, version unchanged.
        if let Some(existing) = state.holders.iter_mut().find(|l| l.agent_id == agent_id) {
            existing.expires_at = now + chrono::Duration::milliseconds(lease_ms as i64);
            existing.last_renewed_at = now;
            debug!(task_id, agent_id, version = existing.version, "Lock renewed in place");
            return AcquireOutcome::granted(LockStatus::Renewed, existing.clone());
        }

        // Exclusive requests are denied by any other live holder.
        if mode == LockMode::Exclusive
            && let Some(holder) = state.holders.first()
        {
            debug!(
                task_id,
                agent_id,
                holder = %holder.agent_id,
                "Exclusive acquisition denied"
            );
            return AcquireOutcome::denied(
                LockStatus::Conflict,
                Some(ConflictInfo {
                    conflict_with: holder.agent_id.clone(),
                    expected_version: holder.version,
                    actual_version: state.version,
                    operation: "acquire_exclusive".to_string(),
                }),
            );
        }

        // Fresh grant: exclusive on an unheld task, or an additional
        // collaborative holder. Both bump the fencing version.
        state.version += 1;
        let lock = Lock {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            mode,
            version: state.version,
            acquired_at: now,
            expires_at: now + chrono::Duration::milliseconds(lease_ms as i64),
            last_renewed_at: now,
        };
        state.holders.push(lock.clone());

        debug!(task_id, agent_id, version = lock.version, mode = ?mode, "Lock acquired");
        AcquireOutcome::granted(LockStatus::Acquired, lock)
    }

    /// Release the caller's lock, guarded by the fencing version.
    ///
    /// A task with no lock to release reports `NotFound`; `Conflict` is
    /// reserved for contention with another holder or a stale token.
    pub fn release(&self, task_id: &str, agent_id: &str, expected_version: u64) -> ReleaseOutcome {
        let now = Utc::now();
        let Some(mut entry) = self.tasks.get_mut(task_id) else {
            return ReleaseOutcome {
                status: LockStatus::NotFound,
                conflict: None,
            };
        };
        let state = entry.value_mut();
        state.evict_expired(now);

        let Some(pos) = state.holders.iter().position(|l| l.agent_id == agent_id) else {
            let Some(holder) = state.holders.first() else {
                return ReleaseOutcome {
                    status: LockStatus::NotFound,
                    conflict: None,
                };
            };
            return ReleaseOutcome {
                status: LockStatus::Conflict,
                conflict: Some(ConflictInfo {
                    conflict_with: holder.agent_id.clone(),
                    expected_version,
                    actual_version: state.version,
                    operation: "release".to_string(),
                }),
            };
        };

        // Stale fencing token: refuse and keep the lock.
        if state.version != expected_version {
            return ReleaseOutcome {
                status: LockStatus::Conflict,
                conflict: Some(ConflictInfo {
                    conflict_with: agent_id.to_string(),
                    expected_version,
                    actual_version: state.version,
                    operation: "release".to_string(),
                }),
            };
        }

        state.holders.remove(pos);
        debug!(task_id, agent_id, version = expected_version, "Lock released");
        ReleaseOutcome {
            status: LockStatus::Released,
            conflict: None,
        }
    }

    /// Extend the current holder's lease.
    ///
    /// Renewing a task with no live lock reports `NotFound`; renewing a task
    /// held by someone else is a conflict naming the holder.
    pub fn renew(&self, task_id: &str, agent_id: &str, additional: Duration) -> AcquireOutcome {
        let now = Utc::now();
        let Some(mut entry) = self.tasks.get_mut(task_id) else {
            return AcquireOutcome::denied(LockStatus::NotFound, None);
        };
        let state = entry.value_mut();
        state.evict_expired(now);

        let version = state.version;
        let Some(lock) = state.holders.iter_mut().find(|l| l.agent_id == agent_id) else {
            let Some(holder) = state.holders.first() else {
                return AcquireOutcome::denied(LockStatus::NotFound, None);
            };
            return AcquireOutcome::denied(
                LockStatus::Conflict,
                Some(ConflictInfo {
                    conflict_with: holder.agent_id.clone(),
                    expected_version: version,
                    actual_version: version,
                    operation: "renew".to_string(),
                }),
            );
        };

        lock.expires_at = lock.expires_at + chrono::Duration::milliseconds(additional.as_millis() as i64);
        lock.last_renewed_at = now;
        debug!(task_id, agent_id, version = lock.version, "Lease extended");
        AcquireOutcome::granted(LockStatus::Renewed, lock.clone())
    }

    /// Read-only check; evicts expired leases before answering.
    pub fn is_locked(&self, task_id: &str) -> bool {
        self.get_lock(task_id).is_some()
    }

    /// Current live lock for the task, preferring the exclusive holder.
    pub fn get_lock(&self, task_id: &str) -> Option<Lock> {
        let now = Utc::now();
        let mut entry = self.tasks.get_mut(task_id)?;
        let state = entry.value_mut();
        state.evict_expired(now);
        state
            .holders
            .iter()
            .find(|l| l.mode == LockMode::Exclusive)
            .or_else(|| state.holders.first())
            .cloned()
    }

    /// Current fencing version for the task, 0 if never locked.
    pub fn current_version(&self, task_id: &str) -> u64 {
        self.tasks.get(task_id).map(|s| s.version).unwrap_or(0)
    }

    /// Sweep all tasks, evicting expired leases. Returns the count removed.
    pub fn cleanup_expired_locks(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for mut entry in self.tasks.iter_mut() {
            removed += entry.value_mut().evict_expired(now);
        }
        if removed > 0 {
            debug!(removed, "Evicted expired locks");
        }
        removed
    }

    pub fn get_stats(&self) -> LockStats {
        let now = Utc::now();
        let mut stats = LockStats {
            tasks_tracked: self.tasks.len(),
            ..Default::default()
        };
        for entry in self.tasks.iter() {
            for lock in entry.holders.iter().filter(|l| !l.is_expired(now)) {
                stats.active_locks += 1;
                match lock.mode {
                    LockMode::Exclusive => stats.exclusive_locks += 1,
                    LockMode::Collaborative => stats.collaborative_locks += 1,
                }
            }
        }
        stats
    }
}
