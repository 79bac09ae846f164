//! Network connectivity monitor — online/offline state machine
//!
//! Periodic health checks against the cloud endpoint. One success flips the
//! machine online; three consecutive failures flip it offline (hysteresis
//! against flapping links). The state-change callback supplied at
//! construction fires on every transition.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive failures required to leave the online state.
const OFFLINE_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Online,
    Offline,
}

/// Function-valued state-change hook supplied at construction.
pub type NetworkCallback = Arc<dyn Fn(NetworkState) + Send + Sync>;

/// Monitoring counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkStats {
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub state_changes: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// Pure transition core of the monitor. Starts offline.
#[derive(Debug)]
pub(crate) struct ConnectivityTracker {
    online: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl ConnectivityTracker {
    pub(crate) fn new() -> Self {
        Self {
            online: false,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    pub(crate) fn is_online(&self) -> bool {
        self.online
    }

    /// Record a successful check; returns the new state on a transition.
    pub(crate) fn note_success(&mut self) -> Option<NetworkState> {
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;

        if !self.online {
            self.online = true;
            return Some(NetworkState::Online);
        }
        None
    }

    /// Record a failed check; returns the new state on a transition.
    pub(crate) fn note_failure(&mut self) -> Option<NetworkState> {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;

        if self.online && self.consecutive_failures >= OFFLINE_AFTER_FAILURES {
            self.online = false;
            return Some(NetworkState::Offline);
        }
        None
    }
}

/// Watches the cloud `/health` endpoint and tracks reachability.
pub struct NetworkMonitor {
    http: reqwest::Client,
    health_url: String,
    check_interval: Duration,
    tracker: Arc<Mutex<ConnectivityTracker>>,
    stats: Arc<Mutex<NetworkStats>>,
    on_state_change: Option<NetworkCallback>,
}

impl NetworkMonitor {
    pub fn new(
        cloud_endpoint: &str,
        health_path: &str,
        check_interval_secs: f64,
        timeout_secs: f64,
        on_state_change: Option<NetworkCallback>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(timeout_secs))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            health_url: format!("{}{}", cloud_endpoint.trim_end_matches('/'), health_path),
            check_interval: Duration::from_secs_f64(check_interval_secs),
            tracker: Arc::new(Mutex::new(ConnectivityTracker::new())),
            stats: Arc::new(Mutex::new(NetworkStats::default())),
            on_state_change,
        }
    }

    pub fn is_online(&self) -> bool {
        self.tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_online()
    }

    pub fn stats(&self) -> NetworkStats {
        let tracker = self
            .tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut stats = *self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stats.consecutive_failures = tracker.consecutive_failures;
        stats.consecutive_successes = tracker.consecutive_successes;
        stats
    }

    /// One health check round. Any HTTP 200 means online.
    pub async fn check_once(&self) {
        {
            let mut stats = self
                .stats
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            stats.total_checks += 1;
        }

        let healthy = match self.http.get(&self.health_url).send().await {
            Ok(resp) if resp.status().as_u16() == 200 => true,
            Ok(resp) => {
                debug!(status = resp.status().as_u16(), "Health check failed");
                false
            }
            Err(e) => {
                debug!(error = %e, "Health check failed");
                false
            }
        };

        let transition = {
            let mut tracker = self
                .tracker
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut stats = self
                .stats
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if healthy {
                stats.successful_checks += 1;
                tracker.note_success()
            } else {
                stats.failed_checks += 1;
                tracker.note_failure()
            }
        };

        if let Some(state) = transition {
            {
                let mut stats = self
                    .stats
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                stats.state_changes += 1;
            }
            match state {
                NetworkState::Online => info!("Network connection established"),
                NetworkState::Offline => warn!("Network connection lost"),
            }
            if let Some(callback) = &self.on_state_change {
                callback(state);
            }
        }
    }

    /// Monitoring loop. Exits at the next await point once the token is
    /// cancelled.
    pub async fn run(&self, token: CancellationToken) {
        info!(url = %self.health_url, interval_s = self.check_interval.as_secs_f64(), "Network monitor started");

        loop {
            self.check_once().await;
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }

        info!("Network monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_offline() {
        let tracker = ConnectivityTracker::new();
        assert!(!tracker.is_online());
    }

    #[test]
    fn test_single_success_goes_online() {
        let mut tracker = ConnectivityTracker::new();
        assert_eq!(tracker.note_success(), Some(NetworkState::Online));
        assert!(tracker.is_online());
        // further successes are not transitions
        assert_eq!(tracker.note_success(), None);
    }

    #[test]
    fn test_offline_requires_three_consecutive_failures() {
        let mut tracker = ConnectivityTracker::new();
        tracker.note_success();

        assert_eq!(tracker.note_failure(), None);
        assert_eq!(tracker.note_failure(), None);
        assert!(tracker.is_online());
        assert_eq!(tracker.note_failure(), Some(NetworkState::Offline));
        assert!(!tracker.is_online());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut tracker = ConnectivityTracker::new();
        tracker.note_success();

        tracker.note_failure();
        tracker.note_failure();
        tracker.note_success(); // streak broken
        tracker.note_failure();
        tracker.note_failure();
        assert!(tracker.is_online());
        assert_eq!(tracker.note_failure(), Some(NetworkState::Offline));
    }

    #[test]
    fn test_failures_while_offline_do_not_transition() {
        let mut tracker = ConnectivityTracker::new();
        for _ in 0..10 {
            assert_eq!(tracker.note_failure(), None);
        }
        assert!(!tracker.is_online());
    }

    #[tokio::test]
    async fn test_check_against_unreachable_endpoint() {
        let monitor = NetworkMonitor::new("http://127.0.0.1:1", "/health", 30.0, 0.2, None);
        monitor.check_once().await;

        assert!(!monitor.is_online());
        let stats = monitor.stats();
        assert_eq!(stats.total_checks, 1);
        assert_eq!(stats.failed_checks, 1);
    }
}
