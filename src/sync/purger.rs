//! Data purger — retention-driven deletion of raw sample files
//!
//! Normal purge deletes raw files only for rings that are both synced to
//! the cloud and of acceptable completeness, and only past the retention
//! window. Emergency purge (critical disk) deletes any raw file older than
//! the hard age ceiling regardless of sync state. Every candidate's mtime
//! is re-verified immediately before deletion; individual failures are
//! collected, never fatal.

use crate::error::Result;
use crate::storage::EdgeStore;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Outcome of one purge pass.
#[derive(Debug, Clone, Default)]
pub struct PurgeReport {
    pub files_deleted: u64,
    pub bytes_freed: u64,
    pub files_skipped: u64,
    pub errors: Vec<String>,
}

impl PurgeReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn bytes_freed_mb(&self) -> f64 {
        self.bytes_freed as f64 / 1_048_576.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PurgeStats {
    pub purge_runs: u64,
    pub files_deleted: u64,
    pub bytes_freed: u64,
    pub files_skipped: u64,
    pub errors: u64,
}

/// Deletes old raw data files after successful cloud sync.
pub struct DataPurger {
    store: EdgeStore,
    raw_data_path: PathBuf,
    retention_days: i64,
    dry_run: bool,
    stats: Arc<Mutex<PurgeStats>>,
}

impl DataPurger {
    pub fn new(
        store: EdgeStore,
        raw_data_path: impl Into<PathBuf>,
        retention_days: i64,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            raw_data_path: raw_data_path.into(),
            retention_days,
            dry_run,
            stats: Arc::new(Mutex::new(PurgeStats::default())),
        }
    }

    /// Normal purge: raw files for synced, complete-enough rings past the
    /// retention window.
    pub async fn purge_old_data(&self) -> Result<PurgeReport> {
        self.with_stats(|s| s.purge_runs += 1);

        let mut report = PurgeReport::default();
        let cutoff_ts = chrono::Utc::now().timestamp() as f64
            - self.retention_days as f64 * 86_400.0;

        info!(
            retention_days = self.retention_days,
            dry_run = self.dry_run,
            "Starting data purge"
        );

        let synced_rings = self.synced_purgeable_rings(cutoff_ts).await?;
        if synced_rings.is_empty() {
            info!("No old synced rings to purge");
            return Ok(report);
        }

        if !self.raw_data_path.exists() {
            warn!(path = %self.raw_data_path.display(), "Raw data path does not exist");
            return Ok(report);
        }

        let max_age = Duration::from_secs(self.retention_days.max(0) as u64 * 86_400);
        for ring_number in synced_rings {
            for file in find_ring_files(&self.raw_data_path, ring_number) {
                self.delete_if_old(&file, max_age, &mut report);
            }
        }

        self.fold_report(&report);
        info!(
            deleted = report.files_deleted,
            freed_mb = format!("{:.2}", report.bytes_freed_mb()),
            skipped = report.files_skipped,
            errors = report.errors.len(),
            "Purge complete"
        );
        Ok(report)
    }

    /// Emergency purge: any raw file older than `max_age_days`, synced or
    /// not. Invoked when disk space goes critical.
    pub async fn purge_any_old_data(&self, max_age_days: i64) -> Result<PurgeReport> {
        warn!(
            max_age_days,
            dry_run = self.dry_run,
            "Emergency purge: deleting old raw files regardless of sync state"
        );

        let mut report = PurgeReport::default();
        if !self.raw_data_path.exists() {
            return Ok(report);
        }

        let max_age = Duration::from_secs(max_age_days.max(0) as u64 * 86_400);
        for file in find_csv_files_recursive(&self.raw_data_path) {
            self.delete_if_old(&file, max_age, &mut report);
        }

        self.fold_report(&report);
        warn!(
            deleted = report.files_deleted,
            freed_mb = format!("{:.2}", report.bytes_freed_mb()),
            "Emergency purge complete"
        );
        Ok(report)
    }

    /// Delete a file if its mtime (re-checked here, immediately before the
    /// unlink) is older than `max_age`.
    fn delete_if_old(&self, file: &Path, max_age: Duration, report: &mut PurgeReport) {
        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                report.errors.push(format!("{}: {e}", file.display()));
                return;
            }
        };
        let modified = match meta.modified() {
            Ok(modified) => modified,
            Err(e) => {
                report.errors.push(format!("{}: {e}", file.display()));
                return;
            }
        };

        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age < max_age {
            debug!(file = %file.display(), "Skipping file inside retention window");
            report.files_skipped += 1;
            return;
        }

        let size = meta.len();
        if self.dry_run {
            info!(file = %file.display(), size, "[DRY RUN] would delete");
            report.files_deleted += 1;
            report.bytes_freed += size;
            return;
        }

        match std::fs::remove_file(file) {
            Ok(()) => {
                info!(file = %file.display(), size, "Deleted raw file");
                report.files_deleted += 1;
                report.bytes_freed += size;
            }
            Err(e) => {
                report.errors.push(format!("{}: {e}", file.display()));
            }
        }
    }

    /// Ring numbers whose records are synced, acceptably complete and whose
    /// window started before the cutoff.
    async fn synced_purgeable_rings(&self, cutoff_ts: f64) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT ring_number FROM ring_summary
             WHERE start_time < ?
             AND sync_status = 'synced'
             AND data_completeness_flag IN ('complete', 'acceptable')
             ORDER BY ring_number",
        )
        .bind(cutoff_ts)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows.into_iter().map(|(n,)| n).collect())
    }

    pub fn stats(&self) -> PurgeStats {
        *self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fold_report(&self, report: &PurgeReport) {
        self.with_stats(|s| {
            s.files_deleted += report.files_deleted;
            s.bytes_freed += report.bytes_freed;
            s.files_skipped += report.files_skipped;
            s.errors += report.errors.len() as u64;
        });
    }

    fn with_stats(&self, f: impl FnOnce(&mut PurgeStats)) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut stats);
    }
}

/// Raw files for one ring: `ring_NNNNN_*.csv` in the raw directory and its
/// immediate subdirectories (date-based layouts).
fn find_ring_files(raw_data_path: &Path, ring_number: i64) -> Vec<PathBuf> {
    let prefix = format!("ring_{ring_number:05}_");
    let mut files = Vec::new();

    let mut dirs = vec![raw_data_path.to_path_buf()];
    if let Ok(entries) = std::fs::read_dir(raw_data_path) {
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
    }

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix) && n.ends_with(".csv"))
                .unwrap_or(false);
            if matches {
                files.push(path);
            }
        }
    }
    files
}

/// All `.csv` files under the raw directory, recursively.
fn find_csv_files_recursive(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(find_csv_files_recursive(&path));
        } else if path.extension().and_then(|e| e.to_str()) == Some("csv") {
            files.push(path);
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (tempfile::TempDir, EdgeStore, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let store = EdgeStore::open(&dir.path().join("purger.db")).await.unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(&raw).unwrap();
        (dir, store, raw)
    }

    fn touch(path: &Path) {
        std::fs::write(path, b"timestamp,value\n0,1\n").unwrap();
    }

    async fn seed_ring(store: &EdgeStore, ring: i64, synced: bool) {
        // window started well before any cutoff
        store.create_ring_window(ring, 1000.0, 2000.0).await.unwrap();
        sqlx::query(
            "UPDATE ring_summary SET data_completeness_flag = 'complete', sync_status = ?
             WHERE ring_number = ?",
        )
        .bind(if synced { "synced" } else { "pending" })
        .bind(ring)
        .execute(store.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_pending_ring_is_preserved_then_deleted_after_sync() {
        let (_dir, store, raw) = setup().await;
        seed_ring(&store, 50, false).await;

        let file = raw.join("ring_00050_plc.csv");
        touch(&file);

        // retention 0 days: any file age qualifies; only sync status gates
        let purger = DataPurger::new(store.clone(), &raw, 0, false);

        let report = purger.purge_old_data().await.unwrap();
        assert_eq!(report.files_deleted, 0);
        assert!(file.exists(), "unsynced ring's file must be preserved");

        store.mark_ring_synced(50).await.unwrap();
        let report = purger.purge_old_data().await.unwrap();
        assert_eq!(report.files_deleted, 1);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_files_inside_retention_window_are_skipped() {
        let (_dir, store, raw) = setup().await;
        seed_ring(&store, 7, true).await;
        // force the ring's start_time past the cutoff check
        sqlx::query("UPDATE ring_summary SET start_time = 0, end_time = 1 WHERE ring_number = 7")
            .execute(store.pool())
            .await
            .unwrap();

        let file = raw.join("ring_00007_plc.csv");
        touch(&file);

        // 30-day retention: a freshly written file is inside the window
        let purger = DataPurger::new(store.clone(), &raw, 30, false);
        let report = purger.purge_old_data().await.unwrap();

        assert_eq!(report.files_deleted, 0);
        assert_eq!(report.files_skipped, 1);
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_incomplete_rings_are_not_purged() {
        let (_dir, store, raw) = setup().await;
        store.create_ring_window(9, 1000.0, 2000.0).await.unwrap();
        store.mark_ring_synced(9).await.unwrap();
        // completeness stays 'incomplete'

        let file = raw.join("ring_00009_plc.csv");
        touch(&file);

        let purger = DataPurger::new(store.clone(), &raw, 0, false);
        let report = purger.purge_old_data().await.unwrap();
        assert_eq!(report.files_deleted, 0);
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_subdirectory_files_are_found() {
        let (_dir, store, raw) = setup().await;
        seed_ring(&store, 12, true).await;

        let subdir = raw.join("2026-07-30");
        std::fs::create_dir_all(&subdir).unwrap();
        let file = subdir.join("ring_00012_attitude.csv");
        touch(&file);

        let purger = DataPurger::new(store.clone(), &raw, 0, false);
        let report = purger.purge_old_data().await.unwrap();
        assert_eq!(report.files_deleted, 1);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let (_dir, store, raw) = setup().await;
        seed_ring(&store, 3, true).await;
        let file = raw.join("ring_00003_plc.csv");
        touch(&file);

        let purger = DataPurger::new(store.clone(), &raw, 0, true);
        let report = purger.purge_old_data().await.unwrap();
        assert_eq!(report.files_deleted, 1); // counted, not removed
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_emergency_purge_ignores_sync_state() {
        let (_dir, store, raw) = setup().await;
        seed_ring(&store, 4, false).await;

        let nested = raw.join("old").join("deeper");
        std::fs::create_dir_all(&nested).unwrap();
        let file_a = raw.join("ring_00004_plc.csv");
        let file_b = nested.join("ring_00004_monitoring.csv");
        touch(&file_a);
        touch(&file_b);

        let purger = DataPurger::new(store.clone(), &raw, 30, false);
        let report = purger.purge_any_old_data(0).await.unwrap();

        assert_eq!(report.files_deleted, 2);
        assert!(!file_a.exists());
        assert!(!file_b.exists());
        assert!(report.success());
    }
}
