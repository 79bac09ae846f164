//! Model registry records — deployed model metadata and performance metrics
//!
//! The edge keeps a local replica of the cloud model registry. Lifecycle
//! fields (`deployment_status`, `deployed_at`, `retired_at`) are mutated
//! only by the registry.

use serde::{Deserialize, Serialize};
use sqlx::types::Json;

/// Deployment lifecycle of a model on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Staged,
    Active,
    Retired,
    Failed,
}

/// Output layout for 2-output models.
///
/// Disambiguates `[settlement, confidence]` (v2) from the legacy
/// `[settlement, lower_bound]` (v1). Ignored for other output counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum OutputFormat {
    V1LowerBound,
    V2Confidence,
}

/// Metadata for one deployed model artifact.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ModelMetadata {
    pub id: i64,
    pub model_name: String,
    pub model_version: String,
    /// lightgbm, xgboost, lstm, ensemble
    pub model_type: String,

    // Artifact
    pub artifact_path: String,
    /// SHA-256 hex digest; verified before every load
    pub checksum: Option<String>,
    pub model_size_bytes: Option<i64>,

    // Training provenance
    pub training_date: Option<f64>,
    /// e.g. "rings_1-500"
    pub training_data_range: Option<String>,

    /// Target zone, or "all" for a zone-agnostic model
    pub geological_zone: String,

    // Validation metrics from training
    pub validation_r2: Option<f64>,
    pub validation_rmse: Option<f64>,
    pub validation_mae: Option<f64>,

    /// Feature names in the exact order the model expects
    pub feature_list: Json<Vec<String>>,
    pub output_format_version: Option<OutputFormat>,
    pub hyperparameters: Json<serde_json::Value>,

    pub deployment_status: DeploymentStatus,
    pub deployed_at: Option<f64>,
    pub retired_at: Option<f64>,

    // Edge-measured
    pub load_time_seconds: Option<f64>,
    pub avg_inference_time_ms: Option<f64>,

    pub created_at: f64,
    pub updated_at: f64,
}

/// Drift severity classification from a performance evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DriftSeverity {
    None,
    Minor,
    Moderate,
    Severe,
}

/// One performance evaluation over a range of prediction/actual pairs.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PerformanceMetric {
    pub id: i64,
    pub model_name: String,
    pub evaluation_date: f64,

    /// e.g. "rings_501-550"
    pub evaluation_data_range: Option<String>,
    pub num_predictions: i64,

    pub r2_score: f64,
    /// mm
    pub rmse: f64,
    /// mm
    pub mae: f64,
    /// percent, over pairs with nonzero actual
    pub mape: f64,

    /// Fraction of actuals falling inside [lower, upper]; ~0.95 for a
    /// well-calibrated 95% interval
    pub confidence_coverage: f64,

    pub drift_detected: bool,
    pub drift_severity: DriftSeverity,
    pub baseline_rmse: Option<f64>,
    pub rmse_increase_percent: f64,

    pub triggered_retraining: bool,
    pub retraining_reason: Option<String>,

    pub created_at: f64,
}
