//! Worker log and gatekeeper artifact pruning. Grounded on
//! `original_source/core/logs.py`: age pruning first, then a file-count cap,
//! then a total-size cap, applied in that order so the cheapest check runs
//! first.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::config::{ArtifactPruneConfig, LogPruneConfig};

#[derive(Debug, Default, Clone, Copy)]
pub struct PruneReport {
    pub removed_by_age: usize,
    pub removed_by_count: usize,
    pub removed_by_size: usize,
}

impl PruneReport {
    pub fn total_removed(&self) -> usize {
        self.removed_by_age + self.removed_by_count + self.removed_by_size
    }
}

fn list_files_by_mtime_desc(dir: &Path) -> Vec<(std::path::PathBuf, SystemTime, u64)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<_> = entries
        .flatten()
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let mtime = meta.modified().ok()?;
            Some((e.path(), mtime, meta.len()))
        })
        .collect();
    files.sort_by(|a, b| b.1.cmp(&a.1));
    files
}

/// Prunes log files under `dir` by age, then count, then total size.
/// `keep_files` and `max_total_mb` are hard caps; `keep_days` is a floor age.
pub fn prune_directory(
    dir: &Path,
    keep_days: i64,
    keep_files: usize,
    max_total_mb: u64,
) -> PruneReport {
    let mut report = PruneReport::default();
    if !dir.exists() {
        return report;
    }

    let mut files = list_files_by_mtime_desc(dir);
    let now = SystemTime::now();
    let cutoff = Duration::from_secs((keep_days.max(0) as u64) * 86_400);

    files.retain(|(path, mtime, _)| {
        let age = now.duration_since(*mtime).unwrap_or_default();
        if age > cutoff {
            if std::fs::remove_file(path).is_ok() {
                report.removed_by_age += 1;
            }
            false
        } else {
            true
        }
    });

    if files.len() > keep_files {
        let overflow = files.split_off(keep_files);
        for (path, _, _) in overflow {
            if std::fs::remove_file(&path).is_ok() {
                report.removed_by_count += 1;
            }
        }
    }

    let max_bytes = max_total_mb.saturating_mul(1024 * 1024);
    let mut running_total: u64 = files.iter().map(|(_, _, size)| size).sum();
    if running_total > max_bytes {
        for (path, _, size) in files.iter().rev() {
            if running_total <= max_bytes {
                break;
            }
            if std::fs::remove_file(path).is_ok() {
                running_total = running_total.saturating_sub(*size);
                report.removed_by_size += 1;
            }
        }
    }

    if report.total_removed() > 0 {
        debug!(
            dir = %dir.display(),
            removed_by_age = report.removed_by_age,
            removed_by_count = report.removed_by_count,
            removed_by_size = report.removed_by_size,
            "pruned directory"
        );
    }

    report
}

pub fn prune_worker_logs(logs_dir: &Path, cfg: &LogPruneConfig) -> PruneReport {
    prune_directory(logs_dir, cfg.keep_days, cfg.keep_files, cfg.max_total_mb)
}

/// Gatekeeper artifacts default to the worker log knobs when left unset,
/// matching `logs.py`'s env-var fallback behavior.
pub fn prune_gatekeeper_artifacts(
    artifacts_dir: &Path,
    cfg: &ArtifactPruneConfig,
    fallback: &LogPruneConfig,
) -> PruneReport {
    let keep_days = cfg.keep_days.unwrap_or(fallback.keep_days);
    let keep_files = cfg.keep_files.unwrap_or(fallback.keep_files);
    let max_total_mb = cfg.max_total_mb.unwrap_or(fallback.max_total_mb);
    prune_directory(artifacts_dir, keep_days, keep_files, max_total_mb)
}

pub fn warn_if_oversized(dir: &Path, max_total_mb: u64) {
    let total: u64 = list_files_by_mtime_desc(dir).iter().map(|(_, _, s)| s).sum();
    let max_bytes = max_total_mb.saturating_mul(1024 * 1024);
    if total > max_bytes {
        warn!(
            dir = %dir.display(),
            total_mb = total / (1024 * 1024),
            max_mb = max_total_mb,
            "directory still over size budget after pruning"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::time::{Duration as StdDuration, SystemTime};
    use tempfile::TempDir;

    fn touch_with_age(dir: &Path, name: &str, bytes: usize, age_secs: u64) {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0u8; bytes]).unwrap();
        drop(f);
        let old_time = SystemTime::now() - StdDuration::from_secs(age_secs);
        let ft = filetime_from(old_time);
        let _ = filetime_set(&path, ft);
    }

    // Minimal mtime-setting shim; avoids pulling in the `filetime` crate for
    // a single test helper.
    fn filetime_from(t: SystemTime) -> SystemTime {
        t
    }
    fn filetime_set(path: &Path, t: SystemTime) -> std::io::Result<()> {
        let f = File::options().write(true).open(path)?;
        f.set_modified(t)
    }

    #[test]
    fn prunes_files_older_than_keep_days() {
        let dir = TempDir::new().unwrap();
        touch_with_age(dir.path(), "old.log", 10, 10 * 86_400);
        touch_with_age(dir.path(), "new.log", 10, 0);

        let report = prune_directory(dir.path(), 7, 200, 200);
        assert_eq!(report.removed_by_age, 1);
        assert!(dir.path().join("new.log").exists());
        assert!(!dir.path().join("old.log").exists());
    }

    #[test]
    fn caps_file_count() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            touch_with_age(dir.path(), &format!("f{i}.log"), 10, i as u64);
        }
        let report = prune_directory(dir.path(), 365, 3, 200);
        assert_eq!(report.removed_by_count, 2);
    }

    #[test]
    fn caps_total_size() {
        let dir = TempDir::new().unwrap();
        touch_with_age(dir.path(), "a.log", 2 * 1024 * 1024, 0);
        touch_with_age(dir.path(), "b.log", 2 * 1024 * 1024, 1);
        let report = prune_directory(dir.path(), 365, 200, 3);
        assert_eq!(report.removed_by_size, 1);
    }

    #[test]
    fn artifact_prune_falls_back_to_log_config() {
        let dir = TempDir::new().unwrap();
        touch_with_age(dir.path(), "old.json", 10, 10 * 86_400);
        let fallback = LogPruneConfig {
            keep_days: 7,
            keep_files: 200,
            max_total_mb: 200,
        };
        let cfg = ArtifactPruneConfig {
            keep_days: None,
            keep_files: None,
            max_total_mb: None,
        };
        let report = prune_gatekeeper_artifacts(dir.path(), &cfg, &fallback);
        assert_eq!(report.removed_by_age, 1);
    }
}
