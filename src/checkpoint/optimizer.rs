//! Checkpoint storage accounting, compression, and retention.
//!
//! The optimizer never creates checkpoints; it shrinks and prunes what the
//! persistence engine wrote, enforcing a global byte cap with a
//! keep-last / keep-daily / keep-weekly retention policy.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::Compression;
use chrono::Datelike;
use flate2::write::GzEncoder;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{CoordError, Result};
use crate::persistence::CheckpointManifest;

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub total_bytes: u64,
    pub total_gb: f64,
    pub checkpoint_count: usize,
}

pub struct CheckpointOptimizer {
    base_dir: PathBuf,
    policy: StorageConfig,
}

impl CheckpointOptimizer {
    pub fn new(base_dir: impl Into<PathBuf>, policy: StorageConfig) -> Self {
        Self {
            base_dir: base_dir.into(),
            policy,
        }
    }

    fn checkpoint_dir(&self, task_id: &str, checkpoint_id: &str) -> PathBuf {
        self.base_dir
            .join(task_id)
            .join("checkpoints")
            .join(checkpoint_id)
    }

    /// On-disk footprint of one checkpoint directory.
    pub async fn checkpoint_size(&self, task_id: &str, checkpoint_id: &str) -> Result<u64> {
        dir_size(&self.checkpoint_dir(task_id, checkpoint_id)).await
    }

    /// Aggregate storage statistics across every task's checkpoints.
    pub async fn storage_stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats::default();
        for (dir, _) in self.collect_manifests().await? {
            stats.total_bytes += dir_size(&dir).await?;
            stats.checkpoint_count += 1;
        }
        stats.total_gb = stats.total_bytes as f64 / 1_073_741_824.0;
        Ok(stats)
    }

    /// Losslessly gzip the checkpoint's payload files in place and mark the
    /// manifest compressed. Compressing an already-compressed checkpoint is
    /// a no-op.
    pub async fn compress_checkpoint(
        &self,
        task_id: &str,
        checkpoint_id: &str,
    ) -> Result<CheckpointManifest> {
        let dir = self.checkpoint_dir(task_id, checkpoint_id);
        let mut manifest = read_manifest(&dir).await?;
        if manifest.compressed {
            return Ok(manifest);
        }

        let before = dir_size(&dir).await?;
        let mut compressed_files = Vec::with_capacity(manifest.files.len());
        for file in &manifest.files {
            let source = dir.join(file);
            let target = dir.join(format!("{}.gz", file));
            gzip_file(&source, &target)?;
            fs::remove_file(&source).await?;
            compressed_files.push(format!("{}.gz", file));
        }

        manifest.files = compressed_files;
        manifest.compressed = true;
        manifest.size_bytes = dir_size(&dir).await? - fs::metadata(dir.join(MANIFEST_FILE)).await?.len();
        fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )
        .await?;

        let after = dir_size(&dir).await?;
        debug!(
            task_id,
            checkpoint_id,
            before,
            after,
            "Checkpoint compressed"
        );
        Ok(manifest)
    }

    /// Apply the retention policy once total usage exceeds the cap: keep the
    /// newest N overall, the newest per day for N days, and the newest per
    /// ISO week for N weeks; delete everything else oldest-first until back
    /// under the cap. Returns deleted checkpoint ids.
    pub async fn enforce_storage_limit(&self) -> Result<Vec<String>> {
        let cap_bytes = (self.policy.max_total_gb * 1_073_741_824.0) as u64;
        let all = self.collect_manifests().await?;
        let mut total = 0u64;
        let mut sizes = Vec::with_capacity(all.len());
        for (dir, _) in &all {
            let size = dir_size(dir).await?;
            total += size;
            sizes.push(size);
        }

        if total <= cap_bytes {
            return Ok(Vec::new());
        }

        // Newest first for bucket assignment.
        let mut indexed: Vec<usize> = (0..all.len()).collect();
        indexed.sort_by(|&a, &b| all[b].1.timestamp.cmp(&all[a].1.timestamp));

        let mut retained: HashSet<String> = HashSet::new();
        for &i in indexed.iter().take(self.policy.keep_last) {
            retained.insert(all[i].1.checkpoint_id.clone());
        }

        let mut days_seen = HashSet::new();
        for &i in &indexed {
            let day = all[i].1.timestamp.date_naive();
            if days_seen.len() >= self.policy.keep_daily && !days_seen.contains(&day) {
                continue;
            }
            if days_seen.insert(day) {
                retained.insert(all[i].1.checkpoint_id.clone());
            }
        }

        let mut weeks_seen = HashSet::new();
        for &i in &indexed {
            let week = all[i].1.timestamp.date_naive().iso_week();
            let key = (week.year(), week.week());
            if weeks_seen.len() >= self.policy.keep_weekly && !weeks_seen.contains(&key) {
                continue;
            }
            if weeks_seen.insert(key) {
                retained.insert(all[i].1.checkpoint_id.clone());
            }
        }

        // Oldest first among the non-retained.
        let mut candidates: Vec<usize> = (0..all.len())
            .filter(|&i| !retained.contains(&all[i].1.checkpoint_id))
            .collect();
        candidates.sort_by(|&a, &b| all[a].1.timestamp.cmp(&all[b].1.timestamp));

        let mut deleted = Vec::new();
        for i in candidates {
            if total <= cap_bytes {
                break;
            }
            let (dir, manifest) = &all[i];
            match fs::remove_dir_all(dir).await {
                Ok(()) => {
                    total = total.saturating_sub(sizes[i]);
                    info!(
                        checkpoint_id = %manifest.checkpoint_id,
                        task_id = %manifest.task_id,
                        freed = sizes[i],
                        "Checkpoint pruned"
                    );
                    deleted.push(manifest.checkpoint_id.clone());
                }
                Err(e) => {
                    warn!(checkpoint_id = %manifest.checkpoint_id, error = %e, "Prune failed");
                }
            }
        }

        Ok(deleted)
    }

    /// All readable manifests under `<base>/<task>/checkpoints/<id>/`.
    /// Unreadable manifests are logged and skipped here; the loud listing
    /// path lives in the persistence engine.
    async fn collect_manifests(&self) -> Result<Vec<(PathBuf, CheckpointManifest)>> {
        let mut found = Vec::new();
        let mut tasks = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };

        while let Some(task_entry) = tasks.next_entry().await? {
            let checkpoints = task_entry.path().join("checkpoints");
            let mut entries = match fs::read_dir(&checkpoints).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                match read_manifest(&entry.path()).await {
                    Ok(manifest) => found.push((entry.path(), manifest)),
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "Skipping unreadable manifest");
                    }
                }
            }
        }

        Ok(found)
    }
}

async fn read_manifest(dir: &Path) -> Result<CheckpointManifest> {
    let content = fs::read_to_string(dir.join(MANIFEST_FILE)).await?;
    serde_json::from_str(&content).map_err(CoordError::from)
}

/// Checkpoint directories are flat, so a single pass suffices.
async fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

fn gzip_file(source: &Path, target: &Path) -> Result<()> {
    let bytes = std::fs::read(source)?;
    let file = std::fs::File::create(target)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&bytes)?;
    encoder.finish()?;
    Ok(())
}
