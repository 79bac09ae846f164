//! Safety warning events forwarded to the cloud
//!
//! The core does not generate warnings itself; it carries them through the
//! durable queue with severity-derived priority and urgency-tuned upload.

use serde::{Deserialize, Serialize};

/// Warning severity. Ordering matters: critical warnings are uploaded first
/// within a batch and get the highest queue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl WarningSeverity {
    /// Durable-queue priority for this severity.
    pub fn queue_priority(&self) -> i64 {
        match self {
            WarningSeverity::Critical => 10,
            WarningSeverity::High => 5,
            WarningSeverity::Medium => 2,
            WarningSeverity::Low => 1,
        }
    }

    /// Sort rank within an upload batch (critical first).
    pub fn upload_rank(&self) -> u8 {
        match self {
            WarningSeverity::Critical => 0,
            WarningSeverity::High => 1,
            WarningSeverity::Medium => 2,
            WarningSeverity::Low => 3,
        }
    }
}

/// One safety warning event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarningEvent {
    pub ring_number: i64,
    pub timestamp: f64,
    /// e.g. "settlement_anomaly", "thrust_anomaly", "data_quality"
    pub warning_type: String,
    pub severity: WarningSeverity,
    pub message: String,
    pub predicted_value: Option<f64>,
    pub threshold: Option<f64>,
    /// Free-form context forwarded verbatim to the cloud
    #[serde(default)]
    pub context: serde_json::Value,
}
