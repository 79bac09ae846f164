//! Centralized error taxonomy for the edge service
//!
//! Every error carries a category and a stable numeric code so that log
//! consumers and the cloud side can key on them without parsing messages.
//! Per-ring failures (alignment, inference) are recorded and skipped by
//! callers; storage failures fail fast and rely on the owning loop's next
//! tick; configuration failures are fatal at startup.

use serde_json::json;
use std::collections::BTreeMap;

/// Broad error category, one per subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Storage,
    Ingestion,
    DataQuality,
    Alignment,
    Inference,
    Sync,
    Config,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Storage => "storage",
            ErrorCategory::Ingestion => "ingestion",
            ErrorCategory::DataQuality => "data_quality",
            ErrorCategory::Alignment => "alignment",
            ErrorCategory::Inference => "inference",
            ErrorCategory::Sync => "sync",
            ErrorCategory::Config => "config",
        };
        write!(f, "{}", name)
    }
}

/// Edge service error with structured code and details.
#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    // Storage (1xxx)
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    // Alignment (4xxx)
    #[error("ring {ring_number} not found in ring_summary")]
    RingNotFound { ring_number: i64 },
    #[error("ring {ring_number} data insufficient: {detail}")]
    DataInsufficient { ring_number: i64, detail: String },
    #[error("aggregation failed for ring {ring_number}: {detail}")]
    Aggregation { ring_number: i64, detail: String },

    // Inference (5xxx)
    #[error("no active model for geological zone '{zone}'")]
    NoActiveModel { zone: String },
    #[error("model '{model_name}' is not available: {detail}")]
    ModelUnavailable { model_name: String, detail: String },
    #[error("model artifact checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("feature '{feature}' missing from engineered vector")]
    FeatureMissing { feature: String },
    #[error("unsupported model output shape: {outputs} outputs")]
    OutputShapeUnsupported { outputs: usize },
    #[error("inference session error: {0}")]
    Session(String),

    // Sync (6xxx)
    #[error("transient sync failure: {0}")]
    SyncTransient(String),
    #[error("permanent sync rejection: {0}")]
    SyncPermanent(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Filesystem (shared by loader and purger)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Config (9xxx) — fatal at startup
    #[error("configuration error: {0}")]
    Config(String),
}

impl EdgeError {
    /// Subsystem category for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EdgeError::Storage(_) => ErrorCategory::Storage,
            EdgeError::RingNotFound { .. }
            | EdgeError::DataInsufficient { .. }
            | EdgeError::Aggregation { .. } => ErrorCategory::Alignment,
            EdgeError::NoActiveModel { .. }
            | EdgeError::ModelUnavailable { .. }
            | EdgeError::ChecksumMismatch { .. }
            | EdgeError::FeatureMissing { .. }
            | EdgeError::OutputShapeUnsupported { .. }
            | EdgeError::Session(_) => ErrorCategory::Inference,
            EdgeError::SyncTransient(_) | EdgeError::SyncPermanent(_) | EdgeError::Http(_) => {
                ErrorCategory::Sync
            }
            EdgeError::Io(_) => ErrorCategory::Storage,
            EdgeError::Config(_) => ErrorCategory::Config,
        }
    }

    /// Stable numeric code (1xxx storage, 4xxx alignment, 5xxx inference,
    /// 6xxx sync, 9xxx config).
    pub fn code(&self) -> u16 {
        match self {
            EdgeError::Storage(_) => 1002,
            EdgeError::Io(_) => 1004,
            EdgeError::RingNotFound { .. } => 4001,
            EdgeError::Aggregation { .. } => 4002,
            EdgeError::DataInsufficient { .. } => 4004,
            EdgeError::NoActiveModel { .. } => 5001,
            EdgeError::ModelUnavailable { .. } => 5002,
            EdgeError::ChecksumMismatch { .. } => 5003,
            EdgeError::FeatureMissing { .. } => 5004,
            EdgeError::OutputShapeUnsupported { .. } => 5005,
            EdgeError::Session(_) => 5006,
            EdgeError::SyncTransient(_) => 6001,
            EdgeError::SyncPermanent(_) => 6002,
            EdgeError::Http(_) => 6003,
            EdgeError::Config(_) => 9001,
        }
    }

    /// Structured details map for log consumers.
    pub fn details(&self) -> BTreeMap<String, serde_json::Value> {
        let mut map = BTreeMap::new();
        match self {
            EdgeError::RingNotFound { ring_number }
            | EdgeError::DataInsufficient { ring_number, .. }
            | EdgeError::Aggregation { ring_number, .. } => {
                map.insert("ring_number".to_string(), json!(ring_number));
            }
            EdgeError::NoActiveModel { zone } => {
                map.insert("geological_zone".to_string(), json!(zone));
            }
            EdgeError::ModelUnavailable { model_name, .. } => {
                map.insert("model_name".to_string(), json!(model_name));
            }
            EdgeError::ChecksumMismatch { expected, actual } => {
                map.insert("expected".to_string(), json!(expected));
                map.insert("actual".to_string(), json!(actual));
            }
            EdgeError::FeatureMissing { feature } => {
                map.insert("feature".to_string(), json!(feature));
            }
            EdgeError::OutputShapeUnsupported { outputs } => {
                map.insert("num_outputs".to_string(), json!(outputs));
            }
            _ => {}
        }
        map
    }

    /// Serializable report for logging or forwarding.
    pub fn to_report(&self) -> serde_json::Value {
        json!({
            "message": self.to_string(),
            "category": self.category().to_string(),
            "code": self.code(),
            "details": self.details(),
        })
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EdgeError>;

/// Run a fallible operation, logging and substituting a default on failure.
///
/// This is the common outer wrapper for call sites that must degrade rather
/// than abort (sync cycles, per-ring processing in batch paths).
pub fn or_default_logged<T>(result: Result<T>, default: T, operation: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(
                operation = operation,
                category = %e.category(),
                code = e.code(),
                error = %e,
                "Operation failed, using default"
            );
            default
        }
    }
}
