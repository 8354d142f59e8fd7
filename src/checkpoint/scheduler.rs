//! Risk-adaptive checkpoint scheduling.
//!
//! Each monitored task gets one recurring timer whose period is derived from
//! a weighted risk score over the task's operational metrics. Ticks create,
//! compress, and prune checkpoints; a failed tick is logged and the timer
//! keeps running. Stopping delivers a stop signal through a watch channel,
//! so an in-flight tick is allowed to complete before the loop exits.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::optimizer::CheckpointOptimizer;
use crate::config::SchedulerConfig;
use crate::error::{CoordError, Result};
use crate::persistence::{CheckpointKind, CheckpointManifest, PersistenceEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Operational metrics a task's risk is scored from. Derived by the caller,
/// never stored beyond the latest level per task.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskContext {
    pub operation_count: u64,
    pub files_changed: u64,
    pub elapsed_minutes: u64,
    pub failure_count: u64,
    pub complexity: Option<f64>,
}

/// Weighted-threshold scoring: each metric contributes 0/2/3/4 points at its
/// medium/high/critical threshold, complexity above the bonus threshold adds
/// a flat 2. Score at 12 is CRITICAL, 8 HIGH, 4 MEDIUM.
pub fn score_risk(ctx: &RiskContext, config: &SchedulerConfig) -> u32 {
    let mut score = metric_points(ctx.operation_count, &config.operation_thresholds)
        + metric_points(ctx.files_changed, &config.files_changed_thresholds)
        + metric_points(ctx.elapsed_minutes, &config.duration_minute_thresholds)
        + metric_points(ctx.failure_count, &config.failure_thresholds);
    if ctx
        .complexity
        .is_some_and(|c| c > config.complexity_bonus_threshold)
    {
        score += 2;
    }
    score
}

pub fn assess_risk(ctx: &RiskContext, config: &SchedulerConfig) -> RiskLevel {
    match score_risk(ctx, config) {
        s if s >= 12 => RiskLevel::Critical,
        s if s >= 8 => RiskLevel::High,
        s if s >= 4 => RiskLevel::Medium,
        _ => RiskLevel::Low,
    }
}

fn metric_points(value: u64, thresholds: &[u64; 3]) -> u32 {
    if value >= thresholds[2] {
        4
    } else if value >= thresholds[1] {
        3
    } else if value >= thresholds[0] {
        2
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Scheduled,
    Forced,
    RiskChange,
    Completion,
}

/// Append-only history record of checkpoint activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEvent {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub risk_level: RiskLevel,
    pub reason: CheckpointReason,
    /// Absent for risk transitions, which reschedule without snapshotting.
    pub checkpoint_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringStatus {
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub risk_level: RiskLevel,
    pub interval_ms: u64,
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub checkpoint_count: u64,
}

struct MonitorState {
    started_at: DateTime<Utc>,
    risk: RiskLevel,
    interval: Duration,
    last_checkpoint: Option<DateTime<Utc>>,
    checkpoint_count: u64,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct SchedulerInner {
    engine: Arc<PersistenceEngine>,
    optimizer: Arc<CheckpointOptimizer>,
    config: SchedulerConfig,
    monitors: DashMap<String, MonitorState>,
    history: Mutex<Vec<CheckpointEvent>>,
}

#[derive(Clone)]
pub struct CheckpointScheduler {
    inner: Arc<SchedulerInner>,
}

impl CheckpointScheduler {
    pub fn new(
        engine: Arc<PersistenceEngine>,
        optimizer: Arc<CheckpointOptimizer>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                engine,
                optimizer,
                config,
                monitors: DashMap::new(),
                history: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn interval_for(&self, risk: RiskLevel) -> Duration {
        let secs = match risk {
            RiskLevel::Low => self.inner.config.low_interval_secs,
            RiskLevel::Medium => self.inner.config.medium_interval_secs,
            RiskLevel::High => self.inner.config.high_interval_secs,
            RiskLevel::Critical => self.inner.config.critical_interval_secs,
        };
        Duration::from_secs(secs)
    }

    /// Begin monitoring a task, assessing initial risk from a zeroed context
    /// and installing the recurring timer at the derived interval. An
    /// existing schedule for the task is cancelled first; no two timers may
    /// run concurrently for one task.
    pub fn start_monitoring(&self, task_id: &str) -> RiskLevel {
        let risk = assess_risk(&RiskContext::default(), &self.inner.config);
        self.schedule(task_id, risk);
        info!(task_id, risk = ?risk, "Monitoring started");
        risk
    }

    fn schedule(&self, task_id: &str, risk: RiskLevel) {
        // Cancel any prior timer before installing the new one.
        if let Some((_, old)) = self.inner.monitors.remove(task_id) {
            let _ = old.stop_tx.send(true);
            debug!(task_id, "Prior schedule cancelled");
        }

        let interval = self.interval_for(risk);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = task_id.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick of a tokio interval completes immediately;
            // consume it so the first checkpoint waits a full period.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // A failed tick must not stop future attempts.
                        if let Err(e) = inner.run_tick(&task).await {
                            warn!(task_id = %task, error = %e, "Scheduled checkpoint failed");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(task_id = %task, "Monitoring loop stopped");
        });

        self.inner.monitors.insert(
            task_id.to_string(),
            MonitorState {
                started_at: Utc::now(),
                risk,
                interval,
                last_checkpoint: None,
                checkpoint_count: 0,
                stop_tx,
                handle,
            },
        );
    }

    /// Recompute risk from fresh metrics. Only a changed level reschedules;
    /// an unchanged level is a no-op.
    pub fn update_risk_level(&self, task_id: &str, ctx: &RiskContext) -> Result<RiskLevel> {
        let new_risk = assess_risk(ctx, &self.inner.config);
        let Some(monitor) = self.inner.monitors.get(task_id) else {
            return Err(CoordError::Scheduler(format!(
                "task not monitored: {}",
                task_id
            )));
        };
        let old_risk = monitor.risk;
        drop(monitor);

        if new_risk == old_risk {
            return Ok(new_risk);
        }

        info!(task_id, from = ?old_risk, to = ?new_risk, "Risk level changed, rescheduling");
        let (started_at, last_checkpoint, checkpoint_count) = self
            .inner
            .monitors
            .get(task_id)
            .map(|m| (m.started_at, m.last_checkpoint, m.checkpoint_count))
            .unwrap_or((Utc::now(), None, 0));

        self.schedule(task_id, new_risk);
        if let Some(mut monitor) = self.inner.monitors.get_mut(task_id) {
            monitor.started_at = started_at;
            monitor.last_checkpoint = last_checkpoint;
            monitor.checkpoint_count = checkpoint_count;
        }

        self.inner.history.lock().push(CheckpointEvent {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            risk_level: new_risk,
            reason: CheckpointReason::RiskChange,
            checkpoint_id: None,
        });

        Ok(new_risk)
    }

    /// Create and compress a checkpoint outside the schedule. Does not reset
    /// the recurring timer. `reason` distinguishes a plain forced snapshot
    /// from an end-of-task one.
    pub async fn force_checkpoint(
        &self,
        task_id: &str,
        reason: CheckpointReason,
    ) -> Result<CheckpointManifest> {
        let description = match reason {
            CheckpointReason::Completion => "completion checkpoint",
            _ => "forced checkpoint",
        };
        let created = self
            .inner
            .engine
            .create_checkpoint(task_id, CheckpointKind::Full, description)
            .await?;
        let manifest = self
            .inner
            .optimizer
            .compress_checkpoint(task_id, &created.checkpoint_id)
            .await?;

        let risk = self
            .inner
            .monitors
            .get(task_id)
            .map(|m| m.risk)
            .unwrap_or(RiskLevel::Low);
        self.inner
            .record_checkpoint(task_id, risk, reason, &manifest.checkpoint_id);

        info!(task_id, checkpoint_id = %manifest.checkpoint_id, reason = ?reason, "Forced checkpoint");
        Ok(manifest)
    }

    /// Cancel the task's timer and drop its monitoring state. Idempotent.
    pub fn stop_monitoring(&self, task_id: &str) -> bool {
        match self.inner.monitors.remove(task_id) {
            Some((_, state)) => {
                let _ = state.stop_tx.send(true);
                // The loop observes the signal after any in-flight tick
                // completes; no need to await the handle here.
                drop(state.handle);
                info!(task_id, "Monitoring stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all_monitoring(&self) -> usize {
        let task_ids: Vec<String> = self
            .inner
            .monitors
            .iter()
            .map(|e| e.key().clone())
            .collect();
        let mut stopped = 0;
        for task_id in task_ids {
            if self.stop_monitoring(&task_id) {
                stopped += 1;
            }
        }
        stopped
    }

    pub fn get_monitoring_status(&self, task_id: &str) -> Option<MonitoringStatus> {
        self.inner.monitors.get(task_id).map(|m| MonitoringStatus {
            task_id: task_id.to_string(),
            started_at: m.started_at,
            risk_level: m.risk,
            interval_ms: m.interval.as_millis() as u64,
            last_checkpoint: m.last_checkpoint,
            checkpoint_count: m.checkpoint_count,
        })
    }

    pub fn get_checkpoint_history(&self, task_id: &str) -> Vec<CheckpointEvent> {
        self.inner
            .history
            .lock()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }
}

impl SchedulerInner {
    /// One scheduled tick: snapshot, compress, prune, record.
    async fn run_tick(&self, task_id: &str) -> Result<()> {
        let manifest = self
            .engine
            .create_checkpoint(task_id, CheckpointKind::Incremental, "scheduled checkpoint")
            .await?;
        self.optimizer
            .compress_checkpoint(task_id, &manifest.checkpoint_id)
            .await?;
        self.optimizer.enforce_storage_limit().await?;

        let risk = self
            .monitors
            .get(task_id)
            .map(|m| m.risk)
            .unwrap_or(RiskLevel::Low);
        self.record_checkpoint(
            task_id,
            risk,
            CheckpointReason::Scheduled,
            &manifest.checkpoint_id,
        );

        debug!(task_id, checkpoint_id = %manifest.checkpoint_id, "Scheduled checkpoint complete");
        Ok(())
    }

    fn record_checkpoint(
        &self,
        task_id: &str,
        risk: RiskLevel,
        reason: CheckpointReason,
        checkpoint_id: &str,
    ) {
        if let Some(mut monitor) = self.monitors.get_mut(task_id) {
            monitor.last_checkpoint = Some(Utc::now());
            monitor.checkpoint_count += 1;
        }
        self.history.lock().push(CheckpointEvent {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            risk_level: risk,
            reason,
            checkpoint_id: Some(checkpoint_id.to_string()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[test]
    fn test_zeroed_context_is_low() {
        assert_eq!(assess_risk(&RiskContext::default(), &config()), RiskLevel::Low);
    }

    #[test]
    fn test_single_critical_metric_is_medium() {
        let ctx = RiskContext {
            operation_count: 50,
            ..Default::default()
        };
        assert_eq!(assess_risk(&ctx, &config()), RiskLevel::Medium);
    }

    #[test]
    fn test_all_critical_metrics_are_critical() {
        let ctx = RiskContext {
            operation_count: 50,
            files_changed: 30,
            elapsed_minutes: 120,
            failure_count: 5,
            complexity: Some(0.9),
        };
        assert_eq!(score_risk(&ctx, &config()), 18);
        assert_eq!(assess_risk(&ctx, &config()), RiskLevel::Critical);
    }

    #[test]
    fn test_complexity_bonus_applies_above_threshold() {
        let base = RiskContext {
            operation_count: 25,
            files_changed: 15,
            ..Default::default()
        };
        let with_complexity = RiskContext {
            complexity: Some(0.8),
            ..base
        };
        assert_eq!(score_risk(&base, &config()), 6);
        assert_eq!(score_risk(&with_complexity, &config()), 8);
        assert_eq!(assess_risk(&with_complexity, &config()), RiskLevel::High);
    }

    #[test]
    fn test_risk_is_monotonic_in_each_metric() {
        let base = RiskContext {
            operation_count: 9,
            files_changed: 4,
            elapsed_minutes: 29,
            failure_count: 0,
            complexity: None,
        };
        let base_level = assess_risk(&base, &config());

        for bump in [
            RiskContext { operation_count: 100, ..base },
            RiskContext { files_changed: 100, ..base },
            RiskContext { elapsed_minutes: 500, ..base },
            RiskContext { failure_count: 10, ..base },
        ] {
            assert!(assess_risk(&bump, &config()) >= base_level);
        }
    }
}
