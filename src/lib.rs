//! Shield-Edge: data-and-inference core for a shield tunneling edge agent
//!
//! Ingested telemetry is partitioned into tunnel ring windows, aggregated
//! into ring records, turned into ML feature vectors, run through ONNX
//! settlement models and forwarded to the cloud through a durable
//! store-and-forward queue that survives restarts and network partitions.
//!
//! ## Architecture
//!
//! - **Aligner**: raw time-series window -> aggregated ring record
//! - **Inference**: features -> model selection -> typed prediction record
//! - **Performance monitoring**: accuracy metrics, drift, retraining triggers
//! - **Sync core**: priority queue, batched uploads, network/disk monitors,
//!   retention purge

pub mod aligner;
pub mod config;
pub mod error;
pub mod inference;
pub mod storage;
pub mod sync;
pub mod types;

// Re-export configuration
pub use config::EdgeConfig;

// Re-export commonly used types
pub use types::{
    Completeness, GeologicalContext, ModelMetadata, PerformanceMetric, PredictionRecord,
    QualityFlag, RingRecord, SoilType, SyncStatus, WarningEvent, WarningSeverity,
};

// Re-export pipeline components
pub use aligner::RingAligner;
pub use error::{EdgeError, ErrorCategory};
pub use inference::{InferenceService, ModelRegistry, PerformanceMonitor, PredictionManager};
pub use storage::EdgeStore;
pub use sync::{SyncBuffer, SyncManager};
