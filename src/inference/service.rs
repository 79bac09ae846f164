//! Edge inference service — per-ring settlement predictions
//!
//! Pulls the ring record and its history, engineers features, selects the
//! active model for the geological zone, assembles the input tensor in the
//! model's declared feature order and decodes the payload into a persisted
//! prediction record. NaN features are zero-substituted at this boundary
//! only, so feature completeness still reflects what was really available.

use crate::config::defaults::{DEFAULT_CI_FRACTION, DEFAULT_CONFIDENCE};
use crate::error::{EdgeError, Result};
use crate::inference::features::{FeatureEngineer, FeatureVector};
use crate::inference::loader::TargetEstimate;
use crate::inference::registry::ModelRegistry;
use crate::storage::{now_ts, EdgeStore};
use crate::types::{GeologicalContext, ModelMetadata, PredictionRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Complete a target's confidence interval, preserving any bound the model
/// provided and synthesizing the missing side as `value ± 0.20·|value|`.
pub fn complete_bounds(value: f64, lower: Option<f64>, upper: Option<f64>) -> (f64, f64) {
    let half_width = value.abs() * DEFAULT_CI_FRACTION;
    (
        lower.unwrap_or(value - half_width),
        upper.unwrap_or(value + half_width),
    )
}

pub struct InferenceService {
    store: EdgeStore,
    engineer: FeatureEngineer,
    registry: Arc<ModelRegistry>,
    /// Bounds concurrent CPU-offloaded inference calls (edge default 2)
    inference_gate: Arc<Semaphore>,
    window_size: usize,
}

impl InferenceService {
    pub fn new(
        store: EdgeStore,
        engineer: FeatureEngineer,
        registry: Arc<ModelRegistry>,
        max_concurrent_inferences: usize,
        window_size: usize,
    ) -> Self {
        Self {
            store,
            engineer,
            registry,
            inference_gate: Arc::new(Semaphore::new(max_concurrent_inferences.max(1))),
            window_size,
        }
    }

    /// Generate and persist a prediction for one ring.
    pub async fn predict_for_ring(
        &self,
        ring_number: i64,
        geological: Option<&GeologicalContext>,
        model_override: Option<&str>,
    ) -> Result<PredictionRecord> {
        let ring = self
            .store
            .fetch_ring(ring_number)
            .await?
            .ok_or(EdgeError::RingNotFound { ring_number })?;

        let history = self
            .store
            .fetch_previous_rings(ring_number, self.window_size as i64)
            .await?;

        let vector = self.engineer.engineer(&ring, &history, geological);

        let model_name = match model_override {
            Some(name) => {
                info!(ring = ring_number, model = name, "Using manual model override");
                name.to_string()
            }
            None => {
                let zone = vector
                    .geological_zone
                    .clone()
                    .or_else(|| ring.geological_zone.clone())
                    .unwrap_or_else(|| "all".to_string());
                self.registry
                    .active_for_zone(&zone)
                    .await?
                    .ok_or(EdgeError::NoActiveModel { zone })?
            }
        };

        let metadata = self
            .registry
            .metadata(&model_name)
            .await?
            .ok_or_else(|| EdgeError::ModelUnavailable {
                model_name: model_name.clone(),
                detail: "metadata not found".to_string(),
            })?;

        let features = assemble_features(&metadata, &vector.features);

        // Inference is synchronous CPU work; offload it and bound the
        // number of in-flight calls.
        let permit = self
            .inference_gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EdgeError::Session("inference gate closed".to_string()))?;

        let loader = Arc::clone(self.registry.loader());
        let call_model = model_name.clone();
        let payload = tokio::task::spawn_blocking(move || {
            let result = loader.predict(&call_model, &features);
            drop(permit);
            result
        })
        .await
        .map_err(|e| EdgeError::Session(format!("inference task panicked: {e}")))??;

        self.registry.record_avg_latency(&model_name).await?;

        let mut record = build_record(ring_number, &metadata, &vector, &payload.settlement);
        record.inference_time_ms = payload.inference_time_ms;

        if let Some(displacement) = &payload.displacement {
            let (lower, upper) =
                complete_bounds(displacement.value, displacement.lower, displacement.upper);
            record.predicted_displacement = Some(displacement.value);
            record.displacement_lower = Some(lower);
            record.displacement_upper = Some(upper);
        }
        if let Some(groundwater) = &payload.groundwater {
            let (lower, upper) =
                complete_bounds(groundwater.value, groundwater.lower, groundwater.upper);
            record.predicted_groundwater_change = Some(groundwater.value);
            record.groundwater_lower = Some(lower);
            record.groundwater_upper = Some(upper);
        }

        let id = self.insert_prediction(&record).await?;
        record.id = id;

        info!(
            ring = ring_number,
            model = %model_name,
            predicted_mm = format!("{:.2}", record.predicted_settlement),
            lower = format!("{:.2}", record.settlement_lower),
            upper = format!("{:.2}", record.settlement_upper),
            latency_ms = format!("{:.1}", record.inference_time_ms),
            "Prediction complete"
        );

        Ok(record)
    }

    /// Batch prediction. Per-ring failures are logged and skipped.
    pub async fn predict_batch(
        &self,
        ring_numbers: &[i64],
        geological_map: Option<&HashMap<i64, GeologicalContext>>,
    ) -> Vec<PredictionRecord> {
        let mut results = Vec::new();
        for &ring_number in ring_numbers {
            let geological = geological_map.and_then(|m| m.get(&ring_number));
            match self.predict_for_ring(ring_number, geological, None).await {
                Ok(record) => results.push(record),
                Err(e) => {
                    error!(ring = ring_number, error = %e, "Prediction failed, skipping ring");
                }
            }
        }
        results
    }

    /// Back-fill measured actuals into the most recent prediction for a
    /// ring and compute its error fields. Returns false when no prediction
    /// exists for that ring.
    pub async fn update_with_actual(
        &self,
        ring_number: i64,
        actual_settlement: f64,
        actual_displacement: Option<f64>,
        actual_groundwater_change: Option<f64>,
    ) -> Result<bool> {
        let latest: Option<PredictionRecord> = sqlx::query_as(
            "SELECT * FROM prediction_results
             WHERE ring_number = ?
             ORDER BY timestamp DESC, id DESC
             LIMIT 1",
        )
        .bind(ring_number)
        .fetch_optional(self.store.pool())
        .await?;

        let Some(mut record) = latest else {
            warn!(ring = ring_number, "No prediction found for back-fill");
            return Ok(false);
        };

        record.update_with_actual(
            actual_settlement,
            actual_displacement,
            actual_groundwater_change,
        );

        sqlx::query(
            "UPDATE prediction_results
             SET actual_settlement = ?, actual_displacement = ?,
                 actual_groundwater_change = ?, prediction_error = ?, absolute_error = ?
             WHERE id = ?",
        )
        .bind(record.actual_settlement)
        .bind(record.actual_displacement)
        .bind(record.actual_groundwater_change)
        .bind(record.prediction_error)
        .bind(record.absolute_error)
        .bind(record.id)
        .execute(self.store.pool())
        .await?;

        info!(
            ring = ring_number,
            predicted_mm = format!("{:.2}", record.predicted_settlement),
            actual_mm = format!("{actual_settlement:.2}"),
            error_mm = format!("{:.2}", record.prediction_error.unwrap_or(0.0)),
            "Prediction back-filled with actual"
        );
        Ok(true)
    }

    /// All predictions for a ring, newest first.
    pub async fn prediction_history(&self, ring_number: i64) -> Result<Vec<PredictionRecord>> {
        let rows = sqlx::query_as(
            "SELECT * FROM prediction_results
             WHERE ring_number = ?
             ORDER BY timestamp DESC, id DESC",
        )
        .bind(ring_number)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows)
    }

    /// Most recent predictions across all rings.
    pub async fn recent_predictions(&self, limit: i64) -> Result<Vec<PredictionRecord>> {
        let rows = sqlx::query_as(
            "SELECT * FROM prediction_results
             ORDER BY timestamp DESC, id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows)
    }

    pub(crate) async fn insert_prediction(&self, record: &PredictionRecord) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO prediction_results
             (ring_number, timestamp, model_name, model_version, model_type,
              geological_zone, predicted_settlement, settlement_lower, settlement_upper,
              predicted_displacement, displacement_lower, displacement_upper,
              predicted_groundwater_change, groundwater_lower, groundwater_upper,
              prediction_confidence, inference_time_ms, feature_completeness,
              quality_flag, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.ring_number)
        .bind(record.timestamp)
        .bind(&record.model_name)
        .bind(&record.model_version)
        .bind(&record.model_type)
        .bind(&record.geological_zone)
        .bind(record.predicted_settlement)
        .bind(record.settlement_lower)
        .bind(record.settlement_upper)
        .bind(record.predicted_displacement)
        .bind(record.displacement_lower)
        .bind(record.displacement_upper)
        .bind(record.predicted_groundwater_change)
        .bind(record.groundwater_lower)
        .bind(record.groundwater_upper)
        .bind(record.prediction_confidence)
        .bind(record.inference_time_ms)
        .bind(record.feature_completeness)
        .bind(record.quality_flag)
        .bind(record.created_at)
        .execute(self.store.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }
}

/// Assemble the `[1, n]` input row in the model's declared feature order.
/// Missing and NaN features become 0.0 here, at the boundary only.
fn assemble_features(metadata: &ModelMetadata, features: &HashMap<String, f64>) -> Vec<f32> {
    metadata
        .feature_list
        .0
        .iter()
        .map(|name| {
            let value = features.get(name).copied().unwrap_or(0.0);
            if value.is_nan() {
                0.0
            } else {
                value as f32
            }
        })
        .collect()
}

fn build_record(
    ring_number: i64,
    metadata: &ModelMetadata,
    vector: &FeatureVector,
    settlement: &TargetEstimate,
) -> PredictionRecord {
    let (lower, upper) = complete_bounds(settlement.value, settlement.lower, settlement.upper);

    PredictionRecord {
        id: 0,
        ring_number,
        timestamp: now_ts(),
        model_name: metadata.model_name.clone(),
        model_version: metadata.model_version.clone(),
        model_type: metadata.model_type.clone(),
        geological_zone: vector.geological_zone.clone(),
        predicted_settlement: settlement.value,
        settlement_lower: lower,
        settlement_upper: upper,
        predicted_displacement: None,
        displacement_lower: None,
        displacement_upper: None,
        predicted_groundwater_change: None,
        groundwater_lower: None,
        groundwater_upper: None,
        prediction_confidence: settlement.confidence.unwrap_or(DEFAULT_CONFIDENCE),
        inference_time_ms: 0.0,
        feature_completeness: vector.feature_completeness,
        quality_flag: vector.quality_flag,
        actual_settlement: None,
        actual_displacement: None,
        actual_groundwater_change: None,
        prediction_error: None,
        absolute_error: None,
        created_at: now_ts(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RingGeometry;
    use crate::inference::loader::ModelLoader;
    use crate::types::QualityFlag;
    use sqlx::types::Json;

    async fn test_service() -> (tempfile::TempDir, EdgeStore, InferenceService) {
        let dir = tempfile::tempdir().unwrap();
        let store = EdgeStore::open(&dir.path().join("service.db"))
            .await
            .unwrap();
        let loader = Arc::new(ModelLoader::new(dir.path().join("models")));
        let registry = Arc::new(ModelRegistry::new(store.clone(), loader));
        let service = InferenceService::new(
            store.clone(),
            FeatureEngineer::new(RingGeometry::default(), 10),
            registry,
            2,
            10,
        );
        (dir, store, service)
    }

    fn sample_metadata() -> ModelMetadata {
        ModelMetadata {
            id: 1,
            model_name: "m".to_string(),
            model_version: "1.0.0".to_string(),
            model_type: "lightgbm".to_string(),
            artifact_path: "m.onnx".to_string(),
            checksum: None,
            model_size_bytes: None,
            training_date: None,
            training_data_range: None,
            geological_zone: "all".to_string(),
            validation_r2: None,
            validation_rmse: None,
            validation_mae: None,
            feature_list: Json(vec![
                "mean_thrust".to_string(),
                "missing_feature".to_string(),
            ]),
            output_format_version: None,
            hyperparameters: Json(serde_json::json!({})),
            deployment_status: crate::types::DeploymentStatus::Active,
            deployed_at: Some(1.0),
            retired_at: None,
            load_time_seconds: None,
            avg_inference_time_ms: None,
            created_at: 0.0,
            updated_at: 0.0,
        }
    }

    #[test]
    fn test_complete_bounds_synthesizes_both() {
        // 12.3 with no bounds: ±20% of |12.3| = 2.46
        let (lower, upper) = complete_bounds(12.3, None, None);
        assert!((lower - 9.84).abs() < 1e-9);
        assert!((upper - 14.76).abs() < 1e-9);
    }

    #[test]
    fn test_complete_bounds_preserves_partial() {
        let (lower, upper) = complete_bounds(10.0, Some(7.5), None);
        assert_eq!(lower, 7.5);
        assert_eq!(upper, 12.0);

        let (lower, upper) = complete_bounds(-10.0, None, Some(-6.0));
        assert_eq!(lower, -12.0);
        assert_eq!(upper, -6.0);
    }

    #[test]
    fn test_assemble_features_order_and_nan_substitution() {
        let metadata = sample_metadata();
        let mut features = HashMap::new();
        features.insert("mean_thrust".to_string(), 0.4);
        // missing_feature absent entirely

        let assembled = assemble_features(&metadata, &features);
        assert_eq!(assembled.len(), 2);
        assert!((assembled[0] - 0.4).abs() < 1e-6);
        assert_eq!(assembled[1], 0.0);

        features.insert("missing_feature".to_string(), f64::NAN);
        let assembled = assemble_features(&metadata, &features);
        assert_eq!(assembled[1], 0.0);
    }

    #[tokio::test]
    async fn test_predict_missing_ring() {
        let (_dir, _store, service) = test_service().await;
        match service.predict_for_ring(42, None, None).await {
            Err(EdgeError::RingNotFound { ring_number }) => assert_eq!(ring_number, 42),
            other => panic!("expected RingNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_predict_no_active_model() {
        let (_dir, store, service) = test_service().await;
        store.create_ring_window(1, 0.0, 100.0).await.unwrap();

        match service.predict_for_ring(1, None, None).await {
            Err(EdgeError::NoActiveModel { zone }) => assert_eq!(zone, "all"),
            other => panic!("expected NoActiveModel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_with_actual_roundtrip() {
        let (_dir, _store, service) = test_service().await;

        let mut record = build_record(
            7,
            &sample_metadata(),
            &FeatureVector {
                ring_number: 7,
                features: HashMap::new(),
                feature_completeness: 1.0,
                quality_flag: QualityFlag::Normal,
                geological_zone: None,
            },
            &TargetEstimate {
                value: 12.0,
                lower: None,
                upper: None,
                confidence: None,
            },
        );
        record.id = service.insert_prediction(&record).await.unwrap();

        // no prediction for other rings
        assert!(!service.update_with_actual(8, 5.0, None, None).await.unwrap());

        assert!(service.update_with_actual(7, 10.0, None, None).await.unwrap());
        let history = service.prediction_history(7).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].actual_settlement, Some(10.0));
        assert_eq!(history[0].prediction_error, Some(2.0));
        assert_eq!(history[0].absolute_error, Some(2.0));

        // idempotent on repeated application
        assert!(service.update_with_actual(7, 10.0, None, None).await.unwrap());
        let history = service.prediction_history(7).await.unwrap();
        assert_eq!(history[0].prediction_error, Some(2.0));
    }

    #[tokio::test]
    async fn test_bound_invariant_on_inserted_records() {
        let (_dir, _store, service) = test_service().await;

        let record = build_record(
            1,
            &sample_metadata(),
            &FeatureVector {
                ring_number: 1,
                features: HashMap::new(),
                feature_completeness: 0.9,
                quality_flag: QualityFlag::ColdStart,
                geological_zone: Some("mixed".to_string()),
            },
            &TargetEstimate {
                value: 12.3,
                lower: None,
                upper: None,
                confidence: Some(0.91),
            },
        );
        service.insert_prediction(&record).await.unwrap();

        let recent = service.recent_predictions(10).await.unwrap();
        let stored = &recent[0];
        assert!(stored.settlement_lower <= stored.predicted_settlement);
        assert!(stored.predicted_settlement <= stored.settlement_upper);
        assert_eq!(stored.prediction_confidence, 0.91);
        assert_eq!(stored.quality_flag, QualityFlag::ColdStart);
    }
}
