//! Prediction record — one inference output per ring per model invocation

use serde::{Deserialize, Serialize};

/// Quality of the feature vector that produced a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum QualityFlag {
    Normal,
    GeologicalDataIncomplete,
    ColdStart,
}

/// Settlement (and optional multi-target) prediction for a ring.
///
/// Invariant: `settlement_lower <= predicted_settlement <= settlement_upper`.
/// When the model supplies only one bound, the inference service synthesizes
/// the other as `predicted ± 0.20·|predicted|`. Actuals and errors are
/// back-filled later by `update_with_actual`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PredictionRecord {
    /// Row id; 0 until persisted.
    pub id: i64,
    pub ring_number: i64,
    pub timestamp: f64,

    pub model_name: String,
    pub model_version: String,
    pub model_type: String,
    pub geological_zone: Option<String>,

    // Primary target: surface settlement (mm)
    pub predicted_settlement: f64,
    pub settlement_lower: f64,
    pub settlement_upper: f64,

    // Optional second target: lateral displacement (mm)
    pub predicted_displacement: Option<f64>,
    pub displacement_lower: Option<f64>,
    pub displacement_upper: Option<f64>,

    // Optional third target: groundwater level change (m)
    pub predicted_groundwater_change: Option<f64>,
    pub groundwater_lower: Option<f64>,
    pub groundwater_upper: Option<f64>,

    pub prediction_confidence: f64,
    pub inference_time_ms: f64,
    pub feature_completeness: f64,
    pub quality_flag: QualityFlag,

    // Back-filled once the lagged measurement arrives
    pub actual_settlement: Option<f64>,
    pub actual_displacement: Option<f64>,
    pub actual_groundwater_change: Option<f64>,
    /// predicted − actual (mm)
    pub prediction_error: Option<f64>,
    pub absolute_error: Option<f64>,

    pub created_at: f64,
}

impl PredictionRecord {
    /// Fill in measured values and derive the error fields.
    ///
    /// Idempotent: applying the same actuals twice leaves the record
    /// unchanged.
    pub fn update_with_actual(
        &mut self,
        actual_settlement: f64,
        actual_displacement: Option<f64>,
        actual_groundwater_change: Option<f64>,
    ) {
        self.actual_settlement = Some(actual_settlement);
        if actual_displacement.is_some() {
            self.actual_displacement = actual_displacement;
        }
        if actual_groundwater_change.is_some() {
            self.actual_groundwater_change = actual_groundwater_change;
        }

        let error = self.predicted_settlement - actual_settlement;
        self.prediction_error = Some(error);
        self.absolute_error = Some(error.abs());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record() -> PredictionRecord {
        PredictionRecord {
            id: 0,
            ring_number: 100,
            timestamp: 1_700_000_000.0,
            model_name: "settlement_lgbm".to_string(),
            model_version: "1.0.0".to_string(),
            model_type: "lightgbm".to_string(),
            geological_zone: Some("soft_clay".to_string()),
            predicted_settlement: 12.0,
            settlement_lower: 9.6,
            settlement_upper: 14.4,
            predicted_displacement: None,
            displacement_lower: None,
            displacement_upper: None,
            predicted_groundwater_change: None,
            groundwater_lower: None,
            groundwater_upper: None,
            prediction_confidence: 0.85,
            inference_time_ms: 1.2,
            feature_completeness: 1.0,
            quality_flag: QualityFlag::Normal,
            actual_settlement: None,
            actual_displacement: None,
            actual_groundwater_change: None,
            prediction_error: None,
            absolute_error: None,
            created_at: 1_700_000_000.0,
        }
    }

    #[test]
    fn test_update_with_actual_computes_errors() {
        let mut record = make_record();
        record.update_with_actual(10.0, None, None);

        assert_eq!(record.actual_settlement, Some(10.0));
        assert_eq!(record.prediction_error, Some(2.0));
        assert_eq!(record.absolute_error, Some(2.0));
    }

    #[test]
    fn test_update_with_actual_is_idempotent() {
        let mut record = make_record();
        record.update_with_actual(14.5, Some(3.0), None);
        let first = record.clone();
        record.update_with_actual(14.5, Some(3.0), None);

        assert_eq!(record.prediction_error, first.prediction_error);
        assert_eq!(record.actual_displacement, Some(3.0));
        // error is negative when actual exceeds prediction
        assert!(record.prediction_error.unwrap() < 0.0);
        assert_eq!(
            record.absolute_error.unwrap(),
            record.prediction_error.unwrap().abs()
        );
    }
}
