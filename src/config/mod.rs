use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{CoordError, Result};

/// Top-level configuration for the coordination engine.
///
/// All sections fall back to defaults when absent from `config.toml`, so a
/// partial file is always valid input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    pub lock: LockConfig,
    pub coordination: CoordinationConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
}

impl CoordConfig {
    pub async fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.toml");
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = dir.join("config.toml");
        let content = toml::to_string_pretty(self).map_err(|e| CoordError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.lock.default_timeout_ms == 0 {
            errors.push("lock.default_timeout_ms must be greater than 0");
        }
        if self.lock.max_attempts == 0 {
            errors.push("lock.max_attempts must be greater than 0");
        }

        if self.coordination.concurrent_write_window_ms == 0 {
            errors.push("coordination.concurrent_write_window_ms must be greater than 0");
        }

        if self.scheduler.low_interval_secs == 0
            || self.scheduler.medium_interval_secs == 0
            || self.scheduler.high_interval_secs == 0
            || self.scheduler.critical_interval_secs == 0
        {
            errors.push("scheduler intervals must all be greater than 0");
        }

        if self.storage.max_total_gb <= 0.0 {
            errors.push("storage.max_total_gb must be greater than 0");
        }
        if self.storage.keep_last == 0 {
            errors.push("storage.keep_last must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoordError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Default lease duration when the caller supplies no timeout.
    pub default_timeout_ms: u64,
    /// Retry budget for non-conflict acquisition failures.
    pub max_attempts: u32,
    /// Linear backoff base: attempt N sleeps `backoff_ms * N`.
    pub backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_attempts: 3,
            backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Fixed cooperative backoff applied by the WAIT resolution strategy.
    pub wait_resolution_delay_ms: u64,
    /// Two operations on the same task closer than this are flagged as
    /// concurrent writes.
    pub concurrent_write_window_ms: i64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            wait_resolution_delay_ms: 1_000,
            concurrent_write_window_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub low_interval_secs: u64,
    pub medium_interval_secs: u64,
    pub high_interval_secs: u64,
    pub critical_interval_secs: u64,

    /// Per-metric thresholds for risk scoring: [medium, high, critical].
    pub operation_thresholds: [u64; 3],
    pub files_changed_thresholds: [u64; 3],
    pub duration_minute_thresholds: [u64; 3],
    pub failure_thresholds: [u64; 3],
    /// Complexity scores above this add a flat bonus to the risk score.
    pub complexity_bonus_threshold: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            low_interval_secs: 30 * 60,
            medium_interval_secs: 15 * 60,
            high_interval_secs: 5 * 60,
            critical_interval_secs: 60,
            operation_thresholds: [10, 25, 50],
            files_changed_thresholds: [5, 15, 30],
            duration_minute_thresholds: [30, 60, 120],
            failure_thresholds: [1, 3, 5],
            complexity_bonus_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Global cap on checkpoint storage across all tasks.
    pub max_total_gb: f64,
    pub keep_last: usize,
    pub keep_daily: usize,
    pub keep_weekly: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_total_gb: 5.0,
            keep_last: 5,
            keep_daily: 7,
            keep_weekly: 4,
        }
    }
}
