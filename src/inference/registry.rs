//! Model registry — metadata lifecycle and zone-based model selection
//!
//! The registry is the only component that mutates model lifecycle fields.
//! Zone lookups are cached (read-mostly); the cache is written only under
//! `activate`/`retire`.

use crate::error::{EdgeError, Result};
use crate::inference::loader::{LoadReport, ModelLoader};
use crate::storage::{now_ts, EdgeStore};
use crate::types::{DeploymentStatus, ModelMetadata};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// High-level model management: selection, activation, retirement.
pub struct ModelRegistry {
    store: EdgeStore,
    loader: Arc<ModelLoader>,
    /// zone -> active model name
    cache: RwLock<HashMap<String, String>>,
}

impl ModelRegistry {
    pub fn new(store: EdgeStore, loader: Arc<ModelLoader>) -> Self {
        Self {
            store,
            loader,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &Arc<ModelLoader> {
        &self.loader
    }

    /// Fetch metadata by model name.
    pub async fn metadata(&self, model_name: &str) -> Result<Option<ModelMetadata>> {
        let row = sqlx::query_as::<_, ModelMetadata>(
            "SELECT * FROM model_metadata WHERE model_name = ?",
        )
        .bind(model_name)
        .fetch_optional(self.store.pool())
        .await?;
        Ok(row)
    }

    /// All models currently marked active.
    pub async fn active_models(&self) -> Result<Vec<ModelMetadata>> {
        let rows = sqlx::query_as::<_, ModelMetadata>(
            "SELECT * FROM model_metadata WHERE deployment_status = 'active'",
        )
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows)
    }

    /// Name of the active model for a geological zone.
    ///
    /// A zone-specific model wins over an `"all"` model only through the
    /// deployment timestamp: the most recently deployed matching model is
    /// selected. Cached per zone until the next activate/retire.
    pub async fn active_for_zone(&self, zone: &str) -> Result<Option<String>> {
        {
            let cache = self.cache.read().await;
            if let Some(name) = cache.get(zone) {
                return Ok(Some(name.clone()));
            }
        }

        let row: Option<(String,)> = sqlx::query_as(
            "SELECT model_name FROM model_metadata
             WHERE deployment_status = 'active'
             AND geological_zone IN (?, 'all')
             ORDER BY deployed_at DESC
             LIMIT 1",
        )
        .bind(zone)
        .fetch_optional(self.store.pool())
        .await?;

        if let Some((name,)) = &row {
            let mut cache = self.cache.write().await;
            cache.insert(zone.to_string(), name.clone());
        }

        Ok(row.map(|(name,)| name))
    }

    /// Insert a new model row in `staged` state.
    pub async fn insert_staged(&self, metadata: &ModelMetadata) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            "INSERT INTO model_metadata
             (model_name, model_version, model_type, artifact_path, checksum,
              model_size_bytes, training_date, training_data_range, geological_zone,
              validation_r2, validation_rmse, validation_mae,
              feature_list, output_format_version, hyperparameters,
              deployment_status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'staged', ?, ?)",
        )
        .bind(&metadata.model_name)
        .bind(&metadata.model_version)
        .bind(&metadata.model_type)
        .bind(&metadata.artifact_path)
        .bind(&metadata.checksum)
        .bind(metadata.model_size_bytes)
        .bind(metadata.training_date)
        .bind(&metadata.training_data_range)
        .bind(&metadata.geological_zone)
        .bind(metadata.validation_r2)
        .bind(metadata.validation_rmse)
        .bind(metadata.validation_mae)
        .bind(serde_json::to_string(&metadata.feature_list.0).unwrap_or_else(|_| "[]".to_string()))
        .bind(metadata.output_format_version)
        .bind(
            serde_json::to_string(&metadata.hyperparameters.0)
                .unwrap_or_else(|_| "{}".to_string()),
        )
        .bind(now)
        .bind(now)
        .execute(self.store.pool())
        .await?;

        info!(model = %metadata.model_name, version = %metadata.model_version, "Model metadata staged");
        Ok(())
    }

    /// Load a model's session (off the event loop) if not already loaded,
    /// persisting measured load time and artifact size.
    pub async fn ensure_loaded(
        &self,
        metadata: &ModelMetadata,
        verify_checksum: bool,
        warm_up: bool,
    ) -> Result<()> {
        if self.loader.is_loaded(&metadata.model_name) {
            return Ok(());
        }

        let loader = Arc::clone(&self.loader);
        let meta = metadata.clone();
        let report = tokio::task::spawn_blocking(move || {
            loader.load(&meta, verify_checksum, warm_up)
        })
        .await
        .map_err(|e| EdgeError::Session(format!("load task panicked: {e}")))??;

        self.record_load_report(&metadata.model_name, report).await?;
        Ok(())
    }

    async fn record_load_report(&self, model_name: &str, report: LoadReport) -> Result<()> {
        sqlx::query(
            "UPDATE model_metadata
             SET load_time_seconds = ?, model_size_bytes = ?, updated_at = ?
             WHERE model_name = ?",
        )
        .bind(report.load_time_seconds)
        .bind(report.model_size_bytes)
        .bind(now_ts())
        .bind(model_name)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Activate a model for production use. Loads (with verification) first;
    /// a model that cannot be loaded is marked `failed` instead of active.
    pub async fn activate(&self, model_name: &str) -> Result<()> {
        let metadata = self
            .metadata(model_name)
            .await?
            .ok_or_else(|| EdgeError::ModelUnavailable {
                model_name: model_name.to_string(),
                detail: "not in registry".to_string(),
            })?;

        if let Err(e) = self.ensure_loaded(&metadata, true, true).await {
            warn!(model = model_name, error = %e, "Activation failed, marking model failed");
            self.set_status(model_name, DeploymentStatus::Failed).await?;
            return Err(e);
        }

        let now = now_ts();
        sqlx::query(
            "UPDATE model_metadata
             SET deployment_status = 'active', deployed_at = ?, updated_at = ?
             WHERE model_name = ?",
        )
        .bind(now)
        .bind(now)
        .bind(model_name)
        .execute(self.store.pool())
        .await?;

        let mut cache = self.cache.write().await;
        cache.insert(metadata.geological_zone.clone(), model_name.to_string());

        info!(model = model_name, zone = %metadata.geological_zone, "Model activated");
        Ok(())
    }

    /// Retire a model from production and evict it from the zone cache.
    pub async fn retire(&self, model_name: &str) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            "UPDATE model_metadata
             SET deployment_status = 'retired', retired_at = ?, updated_at = ?
             WHERE model_name = ?",
        )
        .bind(now)
        .bind(now)
        .bind(model_name)
        .execute(self.store.pool())
        .await?;

        let mut cache = self.cache.write().await;
        cache.retain(|_, name| name != model_name);

        info!(model = model_name, "Model retired");
        Ok(())
    }

    async fn set_status(&self, model_name: &str, status: DeploymentStatus) -> Result<()> {
        sqlx::query(
            "UPDATE model_metadata SET deployment_status = ?, updated_at = ? WHERE model_name = ?",
        )
        .bind(status)
        .bind(now_ts())
        .bind(model_name)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Persist the rolling average latency measured by the loader.
    pub async fn record_avg_latency(&self, model_name: &str) -> Result<()> {
        if let Some(avg) = self.loader.avg_inference_time_ms(model_name) {
            sqlx::query(
                "UPDATE model_metadata SET avg_inference_time_ms = ? WHERE model_name = ?",
            )
            .bind(avg)
            .bind(model_name)
            .execute(self.store.pool())
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::types::Json;

    async fn test_registry() -> (tempfile::TempDir, ModelRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = EdgeStore::open(&dir.path().join("registry.db"))
            .await
            .unwrap();
        let loader = Arc::new(ModelLoader::new(dir.path().join("models")));
        (dir, ModelRegistry::new(store, loader))
    }

    fn staged(name: &str, zone: &str) -> ModelMetadata {
        ModelMetadata {
            id: 0,
            model_name: name.to_string(),
            model_version: "1.0.0".to_string(),
            model_type: "lightgbm".to_string(),
            artifact_path: format!("{name}.onnx"),
            checksum: None,
            model_size_bytes: None,
            training_date: None,
            training_data_range: Some("rings_1-500".to_string()),
            geological_zone: zone.to_string(),
            validation_r2: Some(0.95),
            validation_rmse: Some(4.0),
            validation_mae: Some(3.0),
            feature_list: Json(vec!["mean_thrust".to_string()]),
            output_format_version: None,
            hyperparameters: Json(serde_json::json!({"n_estimators": 200})),
            deployment_status: DeploymentStatus::Staged,
            deployed_at: None,
            retired_at: None,
            load_time_seconds: None,
            avg_inference_time_ms: None,
            created_at: 0.0,
            updated_at: 0.0,
        }
    }

    #[tokio::test]
    async fn test_stage_and_fetch() {
        let (_dir, registry) = test_registry().await;
        registry.insert_staged(&staged("m1", "all")).await.unwrap();

        let metadata = registry.metadata("m1").await.unwrap().unwrap();
        assert_eq!(metadata.deployment_status, DeploymentStatus::Staged);
        assert_eq!(metadata.feature_list.0, vec!["mean_thrust".to_string()]);
        assert_eq!(metadata.validation_rmse, Some(4.0));
        assert!(registry.metadata("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_active_for_zone_prefers_latest_deployment() {
        let (_dir, registry) = test_registry().await;
        registry.insert_staged(&staged("older", "all")).await.unwrap();
        registry
            .insert_staged(&staged("newer", "soft_clay"))
            .await
            .unwrap();

        // activate directly in SQL to skip artifact loading
        sqlx::query(
            "UPDATE model_metadata SET deployment_status = 'active', deployed_at = ? WHERE model_name = ?",
        )
        .bind(100.0)
        .bind("older")
        .execute(registry.store.pool())
        .await
        .unwrap();
        sqlx::query(
            "UPDATE model_metadata SET deployment_status = 'active', deployed_at = ? WHERE model_name = ?",
        )
        .bind(200.0)
        .bind("newer")
        .execute(registry.store.pool())
        .await
        .unwrap();

        let selected = registry.active_for_zone("soft_clay").await.unwrap();
        assert_eq!(selected.as_deref(), Some("newer"));

        // "all" models serve zones with no specific model
        let selected = registry.active_for_zone("hard_rock").await.unwrap();
        assert_eq!(selected.as_deref(), Some("older"));

        // cached answer survives
        let again = registry.active_for_zone("soft_clay").await.unwrap();
        assert_eq!(again.as_deref(), Some("newer"));
    }

    #[tokio::test]
    async fn test_retire_evicts_cache() {
        let (_dir, registry) = test_registry().await;
        registry.insert_staged(&staged("m1", "all")).await.unwrap();
        sqlx::query(
            "UPDATE model_metadata SET deployment_status = 'active', deployed_at = 1.0 WHERE model_name = 'm1'",
        )
        .execute(registry.store.pool())
        .await
        .unwrap();

        assert_eq!(
            registry.active_for_zone("mixed").await.unwrap().as_deref(),
            Some("m1")
        );

        registry.retire("m1").await.unwrap();

        let metadata = registry.metadata("m1").await.unwrap().unwrap();
        assert_eq!(metadata.deployment_status, DeploymentStatus::Retired);
        assert!(metadata.retired_at.is_some());
        assert!(registry.active_for_zone("mixed").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_activate_missing_artifact_marks_failed() {
        let (_dir, registry) = test_registry().await;
        registry.insert_staged(&staged("broken", "all")).await.unwrap();

        assert!(registry.activate("broken").await.is_err());

        let metadata = registry.metadata("broken").await.unwrap().unwrap();
        assert_eq!(metadata.deployment_status, DeploymentStatus::Failed);
    }
}
