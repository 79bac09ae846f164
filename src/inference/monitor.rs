//! Model performance monitor — accuracy tracking and drift detection
//!
//! Evaluates prediction/actual pairs back-filled by the inference service,
//! compares current RMSE against the model's validation baseline and raises
//! retraining requests when drift or low R² shows up.

use crate::config::defaults::R2_RETRAIN_THRESHOLD;
use crate::error::Result;
use crate::storage::{now_ts, EdgeStore};
use crate::types::{DriftSeverity, PerformanceMetric, PredictionRecord};
use tracing::{info, warn};

/// Plain regression metrics over paired predictions and actuals.
#[derive(Debug, Clone, Copy)]
pub struct RegressionMetrics {
    pub r2: f64,
    pub rmse: f64,
    pub mae: f64,
    /// percent, computed over pairs with nonzero actual
    pub mape: f64,
}

/// R², RMSE, MAE and MAPE. R² is defined as 0 when the total sum of
/// squares is 0 (constant actuals).
pub fn regression_metrics(predicted: &[f64], actual: &[f64]) -> RegressionMetrics {
    let n = predicted.len() as f64;

    let actual_mean = actual.iter().sum::<f64>() / n;
    let ss_res: f64 = predicted
        .iter()
        .zip(actual)
        .map(|(p, a)| (a - p).powi(2))
        .sum();
    let ss_tot: f64 = actual.iter().map(|a| (a - actual_mean).powi(2)).sum();
    let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

    let rmse = (ss_res / n).sqrt();
    let mae = predicted
        .iter()
        .zip(actual)
        .map(|(p, a)| (a - p).abs())
        .sum::<f64>()
        / n;

    let nonzero: Vec<(f64, f64)> = predicted
        .iter()
        .zip(actual)
        .filter(|(_, a)| **a != 0.0)
        .map(|(p, a)| (*p, *a))
        .collect();
    let mape = if nonzero.is_empty() {
        0.0
    } else {
        nonzero
            .iter()
            .map(|(p, a)| ((a - p) / a).abs())
            .sum::<f64>()
            / nonzero.len() as f64
            * 100.0
    };

    RegressionMetrics { r2, rmse, mae, mape }
}

/// Drift classification against a validation baseline.
///
/// Flagged when the RMSE increase exceeds `100·threshold` percent; severity
/// is severe above 50%, moderate above 30%, otherwise minor.
pub fn classify_drift(
    current_rmse: f64,
    baseline_rmse: Option<f64>,
    threshold: f64,
) -> (bool, DriftSeverity, f64) {
    let Some(baseline) = baseline_rmse.filter(|b| *b > 0.0) else {
        return (false, DriftSeverity::None, 0.0);
    };

    let increase_pct = (current_rmse - baseline) / baseline * 100.0;
    if increase_pct <= threshold * 100.0 {
        return (false, DriftSeverity::None, increase_pct);
    }

    let severity = if increase_pct > 50.0 {
        DriftSeverity::Severe
    } else if increase_pct > 30.0 {
        DriftSeverity::Moderate
    } else {
        DriftSeverity::Minor
    };
    (true, severity, increase_pct)
}

pub struct PerformanceMonitor {
    store: EdgeStore,
    drift_threshold: f64,
    evaluation_window: usize,
    min_samples: usize,
}

impl PerformanceMonitor {
    pub fn new(
        store: EdgeStore,
        drift_threshold: f64,
        evaluation_window: usize,
        min_samples: usize,
    ) -> Self {
        Self {
            store,
            drift_threshold,
            evaluation_window,
            min_samples,
        }
    }

    /// Evaluate a model over its back-filled predictions, optionally
    /// restricted to a ring range. Returns None (and skips persistence)
    /// when fewer than `min_samples` pairs are available.
    pub async fn evaluate(
        &self,
        model_name: &str,
        ring_range: Option<(i64, i64)>,
    ) -> Result<Option<PerformanceMetric>> {
        let pairs = self.fetch_pairs(model_name, ring_range).await?;

        if pairs.len() < self.min_samples {
            warn!(
                model = model_name,
                samples = pairs.len(),
                min = self.min_samples,
                "Insufficient samples for evaluation"
            );
            return Ok(None);
        }

        let predicted: Vec<f64> = pairs.iter().map(|p| p.predicted_settlement).collect();
        let actual: Vec<f64> = pairs
            .iter()
            .filter_map(|p| p.actual_settlement)
            .collect();

        let metrics = regression_metrics(&predicted, &actual);
        let coverage = confidence_coverage(&pairs);

        let baseline_rmse: Option<f64> = sqlx::query_scalar(
            "SELECT validation_rmse FROM model_metadata WHERE model_name = ?",
        )
        .bind(model_name)
        .fetch_optional(self.store.pool())
        .await?
        .flatten();

        let (drift_detected, drift_severity, rmse_increase_percent) =
            classify_drift(metrics.rmse, baseline_rmse, self.drift_threshold);

        if drift_detected {
            warn!(
                model = model_name,
                rmse_increase_pct = format!("{rmse_increase_percent:.1}"),
                baseline_mm = format!("{:.2}", baseline_rmse.unwrap_or(0.0)),
                current_mm = format!("{:.2}", metrics.rmse),
                severity = ?drift_severity,
                "Model drift detected"
            );
        }

        let (triggered_retraining, retraining_reason) = if drift_detected {
            (
                true,
                Some(format!(
                    "drift_detected_{}",
                    match drift_severity {
                        DriftSeverity::Severe => "severe",
                        DriftSeverity::Moderate => "moderate",
                        _ => "minor",
                    }
                )),
            )
        } else if metrics.r2 < R2_RETRAIN_THRESHOLD {
            (true, Some("performance_below_threshold".to_string()))
        } else {
            (false, None)
        };

        let first_ring = pairs.first().map(|p| p.ring_number).unwrap_or(0);
        let last_ring = pairs.last().map(|p| p.ring_number).unwrap_or(0);

        let metric = PerformanceMetric {
            id: 0,
            model_name: model_name.to_string(),
            evaluation_date: now_ts(),
            evaluation_data_range: Some(format!("rings_{first_ring}-{last_ring}")),
            num_predictions: pairs.len() as i64,
            r2_score: metrics.r2,
            rmse: metrics.rmse,
            mae: metrics.mae,
            mape: metrics.mape,
            confidence_coverage: coverage,
            drift_detected,
            drift_severity,
            baseline_rmse,
            rmse_increase_percent,
            triggered_retraining,
            retraining_reason,
            created_at: now_ts(),
        };

        let id = self.insert_metric(&metric).await?;
        let metric = PerformanceMetric { id, ..metric };

        info!(
            model = model_name,
            r2 = format!("{:.3}", metric.r2_score),
            rmse_mm = format!("{:.2}", metric.rmse),
            mae_mm = format!("{:.2}", metric.mae),
            coverage = format!("{:.2}", metric.confidence_coverage),
            drift = metric.drift_detected,
            "Model evaluation complete"
        );

        Ok(Some(metric))
    }

    /// Evaluate over the most recent `evaluation_window` pairs.
    pub async fn evaluate_rolling(&self, model_name: &str) -> Result<Option<PerformanceMetric>> {
        let recent: Vec<(i64,)> = sqlx::query_as(
            "SELECT ring_number FROM prediction_results
             WHERE model_name = ? AND actual_settlement IS NOT NULL
             ORDER BY ring_number DESC
             LIMIT ?",
        )
        .bind(model_name)
        .bind(self.evaluation_window as i64)
        .fetch_all(self.store.pool())
        .await?;

        if recent.is_empty() {
            return Ok(None);
        }

        let end_ring = recent.first().map(|(n,)| *n).unwrap_or(0);
        let start_ring = recent.last().map(|(n,)| *n).unwrap_or(0);
        self.evaluate(model_name, Some((start_ring, end_ring))).await
    }

    /// Evaluate every active model, concurrently.
    pub async fn evaluate_all_active(&self) -> Result<Vec<PerformanceMetric>> {
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT model_name FROM model_metadata WHERE deployment_status = 'active'",
        )
        .fetch_all(self.store.pool())
        .await?;

        let evaluations = names
            .iter()
            .map(|(name,)| self.evaluate(name, None));
        let results = futures::future::join_all(evaluations).await;

        let mut metrics = Vec::new();
        for result in results {
            if let Some(metric) = result? {
                metrics.push(metric);
            }
        }
        Ok(metrics)
    }

    /// Evaluation history for a model over the last `days`.
    pub async fn performance_history(
        &self,
        model_name: &str,
        days: i64,
    ) -> Result<Vec<PerformanceMetric>> {
        let cutoff = now_ts() - days as f64 * 86_400.0;
        let rows = sqlx::query_as(
            "SELECT * FROM model_performance_metrics
             WHERE model_name = ? AND evaluation_date >= ?
             ORDER BY evaluation_date DESC",
        )
        .bind(model_name)
        .bind(cutoff)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows)
    }

    /// Recent evaluations that flagged drift.
    pub async fn drift_alerts(&self, days: i64) -> Result<Vec<PerformanceMetric>> {
        let cutoff = now_ts() - days as f64 * 86_400.0;
        let rows = sqlx::query_as(
            "SELECT * FROM model_performance_metrics
             WHERE drift_detected = 1 AND evaluation_date >= ?
             ORDER BY evaluation_date DESC",
        )
        .bind(cutoff)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows)
    }

    /// Latest evaluations that requested retraining.
    pub async fn retraining_queue(&self) -> Result<Vec<PerformanceMetric>> {
        let rows = sqlx::query_as(
            "SELECT * FROM model_performance_metrics
             WHERE triggered_retraining = 1
             ORDER BY evaluation_date DESC
             LIMIT 10",
        )
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows)
    }

    async fn fetch_pairs(
        &self,
        model_name: &str,
        ring_range: Option<(i64, i64)>,
    ) -> Result<Vec<PredictionRecord>> {
        let rows = match ring_range {
            Some((start, end)) => {
                sqlx::query_as(
                    "SELECT * FROM prediction_results
                     WHERE model_name = ? AND actual_settlement IS NOT NULL
                     AND ring_number >= ? AND ring_number <= ?
                     ORDER BY ring_number ASC",
                )
                .bind(model_name)
                .bind(start)
                .bind(end)
                .fetch_all(self.store.pool())
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM prediction_results
                     WHERE model_name = ? AND actual_settlement IS NOT NULL
                     ORDER BY ring_number ASC",
                )
                .bind(model_name)
                .fetch_all(self.store.pool())
                .await?
            }
        };
        Ok(rows)
    }

    async fn insert_metric(&self, metric: &PerformanceMetric) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO model_performance_metrics
             (model_name, evaluation_date, evaluation_data_range, num_predictions,
              r2_score, rmse, mae, mape, confidence_coverage,
              drift_detected, drift_severity, baseline_rmse, rmse_increase_percent,
              triggered_retraining, retraining_reason, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&metric.model_name)
        .bind(metric.evaluation_date)
        .bind(&metric.evaluation_data_range)
        .bind(metric.num_predictions)
        .bind(metric.r2_score)
        .bind(metric.rmse)
        .bind(metric.mae)
        .bind(metric.mape)
        .bind(metric.confidence_coverage)
        .bind(metric.drift_detected)
        .bind(metric.drift_severity)
        .bind(metric.baseline_rmse)
        .bind(metric.rmse_increase_percent)
        .bind(metric.triggered_retraining)
        .bind(&metric.retraining_reason)
        .bind(metric.created_at)
        .execute(self.store.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }
}

/// Fraction of predictions whose actual fell inside [lower, upper].
fn confidence_coverage(pairs: &[PredictionRecord]) -> f64 {
    let mut total = 0_usize;
    let mut within = 0_usize;

    for record in pairs {
        if let Some(actual) = record.actual_settlement {
            total += 1;
            if record.settlement_lower <= actual && actual <= record.settlement_upper {
                within += 1;
            }
        }
    }

    if total == 0 {
        0.0
    } else {
        within as f64 / total as f64
    }
}
