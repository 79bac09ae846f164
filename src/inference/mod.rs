//! Inference pipeline — feature engineering, model lifecycle, prediction
//!
//! ## Architecture
//! - `features`: ring record + geology + history -> normalized feature vector
//! - `loader`: ONNX sessions with checksum verification and latency tracking
//! - `registry`: model metadata lifecycle and zone-based selection
//! - `service`: per-ring prediction, tensor assembly, bound synthesis
//! - `monitor`: accuracy metrics, drift detection, retraining triggers
//! - `manager`: orchestrator wiring all of the above

pub mod features;
pub mod loader;
pub mod manager;
pub mod monitor;
pub mod registry;
pub mod service;

pub use features::{FeatureEngineer, FeatureVector};
pub use loader::{decode_outputs, LatencyStats, ModelLoader, PredictionPayload, TargetEstimate};
pub use manager::{ManagerStatus, ModelDeployment, PredictionManager, ValidationMetrics};
pub use monitor::PerformanceMonitor;
pub use registry::ModelRegistry;
pub use service::InferenceService;
