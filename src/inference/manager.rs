//! Prediction manager — control plane for the inference pipeline
//!
//! Wires the feature engineer, loader, registry, inference service and
//! performance monitor; owns model deployment/rollback and triggers the
//! periodic evaluation of every active model.

use crate::aligner::RingAligner;
use crate::config::{AlignmentConfig, InferenceConfig};
use crate::error::Result;
use crate::inference::features::FeatureEngineer;
use crate::inference::loader::{sha256_file, LatencyStats, ModelLoader};
use crate::inference::monitor::PerformanceMonitor;
use crate::inference::registry::ModelRegistry;
use crate::inference::service::InferenceService;
use crate::storage::EdgeStore;
use crate::types::{
    GeologicalContext, ModelMetadata, OutputFormat, PerformanceMetric, PredictionRecord,
};
use sqlx::types::Json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Validation metrics shipped alongside a deployed model.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationMetrics {
    pub r2: Option<f64>,
    pub rmse: Option<f64>,
    pub mae: Option<f64>,
}

/// Parameters for deploying a model artifact to this device.
#[derive(Debug, Clone)]
pub struct ModelDeployment {
    pub model_file_path: PathBuf,
    pub model_name: String,
    pub model_version: String,
    pub model_type: String,
    pub geological_zone: String,
    pub validation_metrics: ValidationMetrics,
    pub feature_list: Vec<String>,
    pub activate: bool,
    pub output_format_version: OutputFormat,
}

/// Aggregate status report for the prediction system.
#[derive(Debug, Clone)]
pub struct ManagerStatus {
    pub loaded_models: Vec<String>,
    pub active_models_count: i64,
    pub total_predictions: i64,
    pub predictions_since_last_eval: usize,
    pub model_latency: HashMap<String, LatencyStats>,
}

pub struct PredictionManager {
    store: EdgeStore,
    aligner: RingAligner,
    registry: Arc<ModelRegistry>,
    service: InferenceService,
    monitor: Arc<PerformanceMonitor>,
    config: InferenceConfig,
    predictions_since_eval: AtomicUsize,
}

impl PredictionManager {
    pub fn new(
        store: EdgeStore,
        alignment: AlignmentConfig,
        models_dir: &Path,
        config: InferenceConfig,
    ) -> Self {
        let loader = Arc::new(ModelLoader::new(models_dir));
        let registry = Arc::new(ModelRegistry::new(store.clone(), loader));
        let engineer = FeatureEngineer::new(alignment.geometry.clone(), config.window_size);
        let aligner = RingAligner::new(store.clone(), alignment);
        let service = InferenceService::new(
            store.clone(),
            engineer,
            Arc::clone(&registry),
            config.max_concurrent_inferences,
            config.window_size,
        );
        let monitor = Arc::new(PerformanceMonitor::new(
            store.clone(),
            config.drift_threshold,
            config.evaluation_window,
            config.min_samples,
        ));

        Self {
            store,
            aligner,
            registry,
            service,
            monitor,
            config,
            predictions_since_eval: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn aligner(&self) -> &RingAligner {
        &self.aligner
    }

    /// Align a freshly closed ring, then predict on the aligned record.
    pub async fn align_and_predict(
        &self,
        ring_number: i64,
        geological: Option<&GeologicalContext>,
    ) -> Result<PredictionRecord> {
        self.aligner.align(ring_number).await?;
        self.predict(ring_number, geological, None).await
    }

    /// Load every active model (checksum-verified) into memory.
    pub async fn initialize(&self) -> Result<usize> {
        info!("Initializing prediction system");

        let active = self.registry.active_models().await?;
        if active.is_empty() {
            warn!("No active models in registry");
            return Ok(0);
        }

        let mut loaded = 0_usize;
        for metadata in &active {
            match self
                .registry
                .ensure_loaded(metadata, self.config.verify_checksum, self.config.warm_up)
                .await
            {
                Ok(()) => {
                    loaded += 1;
                    info!(model = %metadata.model_name, "Loaded active model");
                }
                Err(e) => {
                    error!(model = %metadata.model_name, error = %e, "Failed to load active model");
                }
            }
        }

        info!(loaded, total = active.len(), "Prediction system initialized");
        Ok(loaded)
    }

    /// Main prediction entry point. Every `monitoring_interval` calls, an
    /// evaluation of all active models is triggered asynchronously.
    pub async fn predict(
        &self,
        ring_number: i64,
        geological: Option<&GeologicalContext>,
        model_override: Option<&str>,
    ) -> Result<PredictionRecord> {
        let record = self
            .service
            .predict_for_ring(ring_number, geological, model_override)
            .await?;

        let count = self.predictions_since_eval.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.config.monitoring_interval {
            self.predictions_since_eval.store(0, Ordering::Relaxed);
            let monitor = Arc::clone(&self.monitor);
            tokio::spawn(async move {
                run_auto_monitoring(monitor).await;
            });
        }

        Ok(record)
    }

    pub async fn predict_batch(
        &self,
        ring_numbers: &[i64],
        geological_map: Option<&HashMap<i64, GeologicalContext>>,
    ) -> Vec<PredictionRecord> {
        self.service.predict_batch(ring_numbers, geological_map).await
    }

    pub async fn update_with_actual(
        &self,
        ring_number: i64,
        actual_settlement: f64,
        actual_displacement: Option<f64>,
        actual_groundwater_change: Option<f64>,
    ) -> Result<bool> {
        self.service
            .update_with_actual(
                ring_number,
                actual_settlement,
                actual_displacement,
                actual_groundwater_change,
            )
            .await
    }

    /// Deploy a new model: stage metadata with a freshly computed checksum,
    /// load it (verified), then optionally activate.
    pub async fn deploy_model(&self, deployment: ModelDeployment) -> Result<()> {
        let path = deployment.model_file_path.clone();
        let checksum = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| crate::error::EdgeError::Session(format!("checksum task panicked: {e}")))??;

        let now = crate::storage::now_ts();
        let metadata = ModelMetadata {
            id: 0,
            model_name: deployment.model_name.clone(),
            model_version: deployment.model_version.clone(),
            model_type: deployment.model_type.clone(),
            artifact_path: deployment.model_file_path.to_string_lossy().into_owned(),
            checksum: Some(checksum),
            model_size_bytes: None,
            training_date: None,
            training_data_range: None,
            geological_zone: deployment.geological_zone.clone(),
            validation_r2: deployment.validation_metrics.r2,
            validation_rmse: deployment.validation_metrics.rmse,
            validation_mae: deployment.validation_metrics.mae,
            feature_list: Json(deployment.feature_list.clone()),
            output_format_version: Some(deployment.output_format_version),
            hyperparameters: Json(serde_json::json!({})),
            deployment_status: crate::types::DeploymentStatus::Staged,
            deployed_at: None,
            retired_at: None,
            load_time_seconds: None,
            avg_inference_time_ms: None,
            created_at: now,
            updated_at: now,
        };

        self.registry.insert_staged(&metadata).await?;
        self.registry.ensure_loaded(&metadata, true, true).await?;

        if deployment.activate {
            self.registry.activate(&deployment.model_name).await?;
        }

        info!(
            model = %deployment.model_name,
            version = %deployment.model_version,
            zone = %deployment.geological_zone,
            activated = deployment.activate,
            "Model deployed"
        );
        Ok(())
    }

    /// Roll back to a previous model version: retire the current model and
    /// activate `<name>_<previous_version>`.
    pub async fn rollback_model(&self, model_name: &str, previous_version: &str) -> Result<()> {
        self.registry.retire(model_name).await?;

        let previous_name = format!("{model_name}_{previous_version}");
        self.registry.activate(&previous_name).await?;

        info!(
            model = model_name,
            previous = %previous_name,
            "Model rolled back"
        );
        Ok(())
    }

    pub async fn evaluate_model(&self, model_name: &str) -> Result<Option<PerformanceMetric>> {
        self.monitor.evaluate(model_name, None).await
    }

    pub async fn drift_alerts(&self, days: i64) -> Result<Vec<PerformanceMetric>> {
        self.monitor.drift_alerts(days).await
    }

    /// Aggregate system status.
    pub async fn status(&self) -> Result<ManagerStatus> {
        let loaded_models = self.registry.loader().loaded_models();

        let mut model_latency = HashMap::new();
        for name in &loaded_models {
            if let Some(stats) = self.registry.loader().performance_stats(name) {
                model_latency.insert(name.clone(), stats);
            }
        }

        let active_models_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM model_metadata WHERE deployment_status = 'active'",
        )
        .fetch_one(self.store.pool())
        .await?;

        let total_predictions: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM prediction_results")
                .fetch_one(self.store.pool())
                .await?;

        Ok(ManagerStatus {
            loaded_models,
            active_models_count,
            total_predictions,
            predictions_since_last_eval: self.predictions_since_eval.load(Ordering::Relaxed),
            model_latency,
        })
    }

    /// Unload every session. Call on clean shutdown.
    pub fn shutdown(&self) {
        info!("Shutting down prediction system");
        for model_name in self.registry.loader().loaded_models() {
            self.registry.loader().unload(&model_name);
        }
    }
}

async fn run_auto_monitoring(monitor: Arc<PerformanceMonitor>) {
    info!("Triggering automatic performance monitoring");
    match monitor.evaluate_all_active().await {
        Ok(metrics) => {
            for metric in metrics {
                if metric.drift_detected {
                    warn!(
                        model = %metric.model_name,
                        severity = ?metric.drift_severity,
                        rmse_increase_pct = format!("{:.1}", metric.rmse_increase_percent),
                        "Drift detected during auto-monitoring"
                    );
                }
                if metric.triggered_retraining {
                    warn!(
                        model = %metric.model_name,
                        reason = metric.retraining_reason.as_deref().unwrap_or(""),
                        "Retraining requested"
                    );
                }
            }
        }
        Err(e) => error!(error = %e, "Auto-monitoring failed"),
    }
}
