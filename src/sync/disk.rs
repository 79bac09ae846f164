//! Disk space monitor — normal/warning/critical state machine
//!
//! Checks free space under each configured path (statvfs) and takes the
//! minimum. The low-space callback fires once per edge into `warning` or
//! `critical`; the sync manager reacts with a purge (warning) or an
//! emergency purge (critical).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    Normal,
    Warning,
    Critical,
}

/// Function-valued low-space hook supplied at construction.
pub type DiskCallback = Arc<dyn Fn(DiskState, f64) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStats {
    pub total_checks: u64,
    pub warning_events: u64,
    pub critical_events: u64,
    pub min_free_gb: Option<f64>,
    pub max_free_gb: Option<f64>,
}

/// Free/total space for one monitored path.
#[derive(Debug, Clone, Copy)]
pub struct PathUsage {
    pub total_gb: f64,
    pub free_gb: f64,
}

/// Classify free space against the two thresholds.
pub fn classify(free_gb: f64, warning_gb: f64, critical_gb: f64) -> DiskState {
    if free_gb <= critical_gb {
        DiskState::Critical
    } else if free_gb <= warning_gb {
        DiskState::Warning
    } else {
        DiskState::Normal
    }
}

/// The callback fires on every edge INTO warning or critical, once per
/// transition.
fn should_notify(previous: DiskState, next: DiskState) -> bool {
    next != previous && next != DiskState::Normal
}

/// Free bytes on the filesystem containing `path`.
pub fn free_space_bytes(path: &Path) -> Result<u64, String> {
    let (free, _) = statvfs(path)?;
    Ok(free)
}

/// (free_bytes, total_bytes) via statvfs.
fn statvfs(path: &Path) -> Result<(u64, u64), String> {
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| e.to_string())?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    let result = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if result == 0 {
        let stat = unsafe { stat.assume_init() };
        let free = stat.f_bavail as u64 * stat.f_frsize as u64;
        let total = stat.f_blocks as u64 * stat.f_frsize as u64;
        Ok((free, total))
    } else {
        Err(format!("statvfs failed for {}", path.display()))
    }
}

/// Watches configured paths and tracks the disk state machine.
pub struct DiskMonitor {
    paths: Vec<PathBuf>,
    warning_threshold_gb: f64,
    critical_threshold_gb: f64,
    check_interval: Duration,
    state: Arc<Mutex<DiskState>>,
    stats: Arc<Mutex<DiskStats>>,
    on_low_space: Option<DiskCallback>,
}

impl DiskMonitor {
    pub fn new(
        paths: Vec<PathBuf>,
        warning_threshold_gb: f64,
        critical_threshold_gb: f64,
        check_interval_secs: f64,
        on_low_space: Option<DiskCallback>,
    ) -> Self {
        Self {
            paths,
            warning_threshold_gb,
            critical_threshold_gb,
            check_interval: Duration::from_secs_f64(check_interval_secs),
            state: Arc::new(Mutex::new(DiskState::Normal)),
            stats: Arc::new(Mutex::new(DiskStats::default())),
            on_low_space,
        }
    }

    pub fn state(&self) -> DiskState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> DiskStats {
        *self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One check round: minimum free space over all paths drives the state.
    pub fn check_once(&self) {
        {
            let mut stats = self
                .stats
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            stats.total_checks += 1;
        }

        let mut min_free_gb: Option<f64> = None;
        for path in &self.paths {
            if !path.exists() {
                warn!(path = %path.display(), "Monitored path does not exist");
                continue;
            }
            match free_space_bytes(path) {
                Ok(free) => {
                    let free_gb = free as f64 / 1024_f64.powi(3);
                    debug!(path = %path.display(), free_gb = format!("{free_gb:.2}"), "Disk check");
                    min_free_gb = Some(min_free_gb.map_or(free_gb, |m: f64| m.min(free_gb)));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Could not check disk space"),
            }
        }

        let Some(free_gb) = min_free_gb else {
            return;
        };

        {
            let mut stats = self
                .stats
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            stats.min_free_gb = Some(stats.min_free_gb.map_or(free_gb, |m| m.min(free_gb)));
            stats.max_free_gb = Some(stats.max_free_gb.map_or(free_gb, |m| m.max(free_gb)));
        }

        self.apply(free_gb);
    }

    /// Apply a measured free-space figure to the state machine.
    pub(crate) fn apply(&self, free_gb: f64) {
        let next = classify(free_gb, self.warning_threshold_gb, self.critical_threshold_gb);

        let previous = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let previous = *state;
            *state = next;
            previous
        };

        match next {
            DiskState::Critical if previous != DiskState::Critical => {
                error!(
                    free_gb = format!("{free_gb:.2}"),
                    threshold_gb = self.critical_threshold_gb,
                    "CRITICAL: low disk space"
                );
                let mut stats = self
                    .stats
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                stats.critical_events += 1;
            }
            DiskState::Warning if previous != DiskState::Warning => {
                warn!(
                    free_gb = format!("{free_gb:.2}"),
                    threshold_gb = self.warning_threshold_gb,
                    "Low disk space"
                );
                let mut stats = self
                    .stats
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                stats.warning_events += 1;
            }
            DiskState::Normal if previous != DiskState::Normal => {
                info!(free_gb = format!("{free_gb:.2}"), "Disk space recovered");
            }
            _ => {}
        }

        if should_notify(previous, next) {
            if let Some(callback) = &self.on_low_space {
                callback(next, free_gb);
            }
        }
    }

    /// Current usage for every monitored path.
    pub fn usage_report(&self) -> HashMap<String, PathUsage> {
        let mut report = HashMap::new();
        for path in &self.paths {
            if let Ok((free, total)) = statvfs(path) {
                report.insert(
                    path.display().to_string(),
                    PathUsage {
                        total_gb: total as f64 / 1024_f64.powi(3),
                        free_gb: free as f64 / 1024_f64.powi(3),
                    },
                );
            }
        }
        report
    }

    /// Monitoring loop; exits at the next await point after cancellation.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            paths = self.paths.len(),
            interval_s = self.check_interval.as_secs_f64(),
            "Disk monitor started"
        );

        loop {
            self.check_once();
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }

        info!("Disk monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(classify(10.0, 5.0, 2.0), DiskState::Normal);
        assert_eq!(classify(5.0, 5.0, 2.0), DiskState::Warning);
        assert_eq!(classify(3.0, 5.0, 2.0), DiskState::Warning);
        assert_eq!(classify(2.0, 5.0, 2.0), DiskState::Critical);
        assert_eq!(classify(0.5, 5.0, 2.0), DiskState::Critical);
    }

    #[test]
    fn test_should_notify_edges() {
        use DiskState::*;
        assert!(should_notify(Normal, Warning));
        assert!(should_notify(Normal, Critical));
        assert!(should_notify(Warning, Critical));
        assert!(should_notify(Critical, Warning));
        assert!(!should_notify(Warning, Warning));
        assert!(!should_notify(Critical, Critical));
        assert!(!should_notify(Warning, Normal));
        assert!(!should_notify(Critical, Normal));
    }

    #[test]
    fn test_callback_fires_once_per_transition() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);

        let monitor = DiskMonitor::new(
            vec![],
            5.0,
            2.0,
            300.0,
            Some(Arc::new(move |_, _| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );

        monitor.apply(10.0); // normal, no fire
        monitor.apply(4.0); // -> warning, fire
        monitor.apply(4.5); // still warning, no fire
        monitor.apply(1.0); // -> critical, fire
        monitor.apply(1.5); // still critical, no fire
        monitor.apply(10.0); // -> normal, no fire
        monitor.apply(1.0); // -> critical, fire

        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(monitor.stats().warning_events, 1);
        assert_eq!(monitor.stats().critical_events, 2);
    }

    #[test]
    fn test_free_space_on_real_path() {
        let dir = tempfile::tempdir().unwrap();
        let free = free_space_bytes(dir.path()).unwrap();
        assert!(free > 0);
    }

    #[test]
    fn test_check_once_with_real_path() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = DiskMonitor::new(
            vec![dir.path().to_path_buf()],
            0.000001, // thresholds far below any real filesystem
            0.0000001,
            300.0,
            None,
        );
        monitor.check_once();
        assert_eq!(monitor.state(), DiskState::Normal);
        assert!(monitor.stats().min_free_gb.unwrap() > 0.0);
        assert!(!monitor.usage_report().is_empty());
    }
}
