//! Edge configuration — every operational knob as an operator-tunable TOML value
//!
//! Each struct implements `Default` with the documented values, so a missing
//! file (or any missing section) means built-in behavior. Unknown top-level
//! sections are ignored with a warning; they are never an error.

use crate::config::defaults::DEFAULT_CUTTERHEAD_RPM;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Aggregation functions the aligner may compute per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFn {
    Mean,
    Max,
    Min,
    Std,
}

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one edge deployment.
///
/// Load with `EdgeConfig::load()` which searches:
/// 1. `$SHIELD_EDGE_CONFIG` env var
/// 2. `./shield_edge.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub alignment: AlignmentConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub edge_device_id: String,
    pub project_id: i64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            edge_device_id: "edge-001".to_string(),
            project_id: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Embedded SQLite database file
    pub db_path: PathBuf,
    /// Ring-indexed raw sample files (purge target)
    pub raw_data_path: PathBuf,
    /// Model artifact directory
    pub models_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/shield_edge.db"),
            raw_data_path: PathBuf::from("data/raw"),
            models_dir: PathBuf::from("data/models"),
        }
    }
}

// ============================================================================
// Alignment
// ============================================================================

/// Ring geometry used for derived indicators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingGeometry {
    /// Excavation diameter (m)
    pub diameter: f64,
    /// Ring width / advance length (m)
    pub width: f64,
    /// Cutterhead speed (rev/min) when the PLC does not report one.
    /// Shared by the aligner and the feature engineer.
    pub default_cutterhead_rpm: f64,
}

impl Default for RingGeometry {
    fn default() -> Self {
        Self {
            diameter: 6.5,
            width: 1.5,
            default_cutterhead_rpm: DEFAULT_CUTTERHEAD_RPM,
        }
    }
}

/// Lag window (hours after ring close) for one lagged sensor type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LagWindow {
    pub min_hours: f64,
    pub max_hours: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletenessConfig {
    pub min_plc_readings: i64,
    pub min_attitude_readings: i64,
    /// When false, a missing settlement target does not block `complete`
    pub require_settlement: bool,
}

impl Default for CompletenessConfig {
    fn default() -> Self {
        Self {
            min_plc_readings: 100,
            min_attitude_readings: 0,
            require_settlement: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentConfig {
    #[serde(default)]
    pub geometry: RingGeometry,

    /// Lag windows keyed by sensor type
    #[serde(default = "default_time_lag_windows")]
    pub time_lag_windows: HashMap<String, LagWindow>,

    /// Which aggregates to compute per channel
    #[serde(default = "default_aggregation_functions")]
    pub aggregation_functions: Vec<AggFn>,

    #[serde(default)]
    pub completeness: CompletenessConfig,

    /// When true (default), telemetry queries filter by both the time window
    /// and the ring_number tag. Set false for deployments where ingest has
    /// not yet assigned ring numbers; the time window alone is trusted then.
    #[serde(default = "default_true")]
    pub require_ring_tag: bool,
}

fn default_time_lag_windows() -> HashMap<String, LagWindow> {
    let mut map = HashMap::new();
    map.insert(
        "surface_settlement".to_string(),
        LagWindow {
            min_hours: 6.0,
            max_hours: 8.0,
        },
    );
    map
}

fn default_aggregation_functions() -> Vec<AggFn> {
    vec![AggFn::Mean, AggFn::Max, AggFn::Min, AggFn::Std]
}

fn default_true() -> bool {
    true
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            geometry: RingGeometry::default(),
            time_lag_windows: default_time_lag_windows(),
            aggregation_functions: default_aggregation_functions(),
            completeness: CompletenessConfig::default(),
            require_ring_tag: true,
        }
    }
}

// ============================================================================
// Inference
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Historical rings used for windowed features
    pub window_size: usize,
    /// Evaluate all active models every N predictions
    pub monitoring_interval: usize,
    /// RMSE increase fraction over baseline that flags drift (0.20 = 20%)
    pub drift_threshold: f64,
    /// Rolling evaluation window (prediction/actual pairs)
    pub evaluation_window: usize,
    /// Minimum pairs required before an evaluation runs
    pub min_samples: usize,
    /// Concurrent inference calls allowed off the event loop
    pub max_concurrent_inferences: usize,
    pub verify_checksum: bool,
    pub warm_up: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            monitoring_interval: 50,
            drift_threshold: 0.20,
            evaluation_window: 50,
            min_samples: 20,
            max_concurrent_inferences: 2,
            verify_checksum: true,
            warm_up: true,
        }
    }
}

// ============================================================================
// Sync
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub check_interval_secs: f64,
    pub timeout_secs: f64,
    pub health_path: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30.0,
            timeout_secs: 10.0,
            health_path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Paths whose filesystems are watched; the minimum free space governs
    pub paths: Vec<PathBuf>,
    pub warning_threshold_gb: f64,
    pub critical_threshold_gb: f64,
    pub check_interval_secs: f64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from("data")],
            warning_threshold_gb: 5.0,
            critical_threshold_gb: 2.0,
            check_interval_secs: 300.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    pub retention_days: i64,
    /// Emergency purge ceiling: anything older goes, synced or not
    pub max_age_days: i64,
    pub dry_run: bool,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            max_age_days: 90,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub cloud_endpoint: String,
    pub api_key: String,
    pub sync_interval_secs: u64,
    /// Random extra sleep so a fleet of devices does not upload in lockstep
    pub sync_jitter_secs: u64,
    pub purge_interval_secs: u64,
    pub max_buffer_size: i64,
    pub buffer_max_retries: i64,
    pub ring_batch_size: usize,
    pub prediction_batch_size: usize,
    pub warning_batch_size: usize,

    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub purge: PurgeConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cloud_endpoint: "http://localhost:8001".to_string(),
            api_key: String::new(),
            sync_interval_secs: 60,
            sync_jitter_secs: 0,
            purge_interval_secs: 3600,
            max_buffer_size: 10_000,
            buffer_max_retries: 3,
            ring_batch_size: 50,
            prediction_batch_size: 100,
            warning_batch_size: 20,
            network: NetworkConfig::default(),
            disk: DiskConfig::default(),
            purge: PurgeConfig::default(),
        }
    }
}

// ============================================================================
// Notification surface (transports are external; only the contract lives here)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    pub retain: bool,
    #[serde(default)]
    pub topics: HashMap<String, String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "edge-warning-publisher".to_string(),
            username: None,
            password: None,
            qos: 1,
            retain: true,
            topics: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
    pub from_address: String,
    pub from_name: String,
    pub use_tls: bool,
    pub timeout_secs: u64,
    #[serde(default)]
    pub recipients: HashMap<String, Vec<String>>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_user: String::new(),
            smtp_password: String::new(),
            from_address: String::new(),
            from_name: "Shield Tunneling Alert System".to_string(),
            use_tls: true,
            timeout_secs: 30,
            recipients: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub enabled: bool,
    pub provider: String,
    #[serde(default)]
    pub recipients: HashMap<String, Vec<String>>,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "twilio".to_string(),
            recipients: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyRetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub max_task_age_hours: u64,
    pub cleanup_interval_seconds: u64,
    pub backoff_delays: Vec<u64>,
}

impl Default for NotifyRetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            max_task_age_hours: 24,
            cleanup_interval_seconds: 3600,
            backoff_delays: vec![60, 300, 900],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyBatchingConfig {
    pub enabled: bool,
    pub max_batch_size: usize,
    pub window_seconds: u64,
}

impl Default for NotifyBatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 10,
            window_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub retry: NotifyRetryConfig,
    /// Severity level -> channels engaged at that level
    #[serde(default)]
    pub graded_response: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub batching: NotifyBatchingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Configuration load error. Fatal at startup: a present-but-broken config
/// file is an operator mistake that must not be papered over.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

const KNOWN_SECTIONS: [&str; 7] = [
    "device",
    "storage",
    "alignment",
    "inference",
    "sync",
    "notify",
    "logging",
];

impl EdgeConfig {
    /// Load configuration using the standard search order:
    /// 1. `$SHIELD_EDGE_CONFIG` environment variable
    /// 2. `./shield_edge.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("SHIELD_EDGE_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), device = %config.device.edge_device_id, "Loaded edge config from SHIELD_EDGE_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from SHIELD_EDGE_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "SHIELD_EDGE_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("shield_edge.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(device = %config.device.edge_device_id, "Loaded edge config from ./shield_edge.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./shield_edge.toml, using defaults");
                }
            }
        }

        info!("No shield_edge.toml found — using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path. Unknown top-level sections are
    /// ignored with a warning.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;

        if let Ok(value) = contents.parse::<toml::Value>() {
            if let Some(table) = value.as_table() {
                for key in table.keys() {
                    if !KNOWN_SECTIONS.contains(&key.as_str()) {
                        warn!(section = %key, "Unknown config section ignored");
                    }
                }
            }
        }

        let config: EdgeConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Lag window for a sensor type, if configured.
    pub fn lag_window(&self, sensor_type: &str) -> Option<LagWindow> {
        self.alignment.time_lag_windows.get(sensor_type).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EdgeConfig::default();
        assert_eq!(config.inference.window_size, 10);
        assert_eq!(config.inference.monitoring_interval, 50);
        assert!((config.inference.drift_threshold - 0.20).abs() < 1e-12);
        assert_eq!(config.sync.ring_batch_size, 50);
        assert_eq!(config.sync.prediction_batch_size, 100);
        assert_eq!(config.sync.warning_batch_size, 20);
        assert_eq!(config.sync.buffer_max_retries, 3);
        assert!((config.sync.disk.warning_threshold_gb - 5.0).abs() < 1e-12);
        assert!((config.sync.disk.critical_threshold_gb - 2.0).abs() < 1e-12);
        assert_eq!(config.sync.purge.retention_days, 30);
        assert_eq!(config.sync.purge.max_age_days, 90);

        let lag = config.lag_window("surface_settlement").unwrap();
        assert!((lag.min_hours - 6.0).abs() < 1e-12);
        assert!((lag.max_hours - 8.0).abs() < 1e-12);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[device]
edge_device_id = "edge-042"
project_id = 7

[sync]
cloud_endpoint = "http://cloud.example.com"
api_key = "k"
sync_interval_secs = 15
sync_jitter_secs = 0
purge_interval_secs = 3600
max_buffer_size = 500
buffer_max_retries = 5
ring_batch_size = 10
prediction_batch_size = 20
warning_batch_size = 5
"#
        )
        .unwrap();

        let config = EdgeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.device.edge_device_id, "edge-042");
        assert_eq!(config.sync.max_buffer_size, 500);
        // untouched sections keep defaults
        assert_eq!(config.inference.window_size, 10);
        assert!(config.alignment.require_ring_tag);
    }

    #[test]
    fn test_unknown_section_is_not_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[frobnicator]
speed = 11
"#
        )
        .unwrap();

        let config = EdgeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.device.project_id, 1);
    }
}
