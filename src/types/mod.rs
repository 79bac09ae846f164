//! Shared domain types for the edge data-and-inference core

pub mod geology;
pub mod model;
pub mod prediction;
pub mod ring;
pub mod warning;

pub use geology::{GeologicalContext, SoilType};
pub use model::{DeploymentStatus, DriftSeverity, ModelMetadata, OutputFormat, PerformanceMetric};
pub use prediction::{PredictionRecord, QualityFlag};
pub use ring::{Completeness, RingRecord, SyncStatus};
pub use warning::{WarningEvent, WarningSeverity};
