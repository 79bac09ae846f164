//! Feature engineering pipeline
//!
//! Derives the ML-ready feature vector from an aligned ring record plus
//! geological context and a rolling window of ring history. Missing values
//! are carried as NaN internally so that `feature_completeness` reflects
//! truth; zero-substitution happens only at the inference boundary.

use crate::aligner::derived_indicators;
use crate::config::RingGeometry;
use crate::types::{GeologicalContext, QualityFlag, RingRecord, SoilType};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Raw ring_summary fields copied verbatim into the vector.
const RAW_FEATURES: [&str; 17] = [
    "mean_thrust",
    "max_thrust",
    "std_thrust",
    "mean_torque",
    "max_torque",
    "std_torque",
    "mean_chamber_pressure",
    "std_chamber_pressure",
    "mean_advance_rate",
    "max_advance_rate",
    "mean_grout_pressure",
    "grout_volume",
    "mean_pitch",
    "mean_roll",
    "mean_yaw",
    "horizontal_deviation_max",
    "vertical_deviation_max",
];

/// Parameters that get windowed moving average / std / trend features.
const WINDOWED_PARAMS: [&str; 4] = [
    "mean_thrust",
    "mean_torque",
    "mean_chamber_pressure",
    "mean_advance_rate",
];

/// Min-max normalization ranges from domain knowledge, prefix-matched so
/// that windowed derivatives of a base feature share its range.
const FEATURE_RANGES: [(&str, f64, f64); 6] = [
    ("mean_thrust", 8_000.0, 18_000.0),          // kN
    ("mean_torque", 500.0, 1_500.0),             // kN·m
    ("mean_chamber_pressure", 100.0, 400.0),     // kPa
    ("mean_advance_rate", 10.0, 60.0),           // mm/min
    ("overburden_depth", 5.0, 30.0),             // m
    ("specific_energy", 0.0, 100.0),             // MJ/m³
];

/// Minimum historical rings before windowed features are real (below this
/// the vector is a cold start).
const COLD_START_MIN_HISTORY: usize = 3;

/// Engineered features for one ring, ready for tensor assembly.
#[derive(Debug, Clone)]
pub struct FeatureVector {
    pub ring_number: i64,
    pub features: HashMap<String, f64>,
    /// Fraction of features that are not NaN
    pub feature_completeness: f64,
    pub quality_flag: QualityFlag,
    pub geological_zone: Option<String>,
}

/// Automated feature engineering from ring records.
///
/// Generates raw aggregates, physics-derived indicators, encoded geological
/// context and time-windowed trend features, then min-max normalizes the
/// ranged numeric features.
pub struct FeatureEngineer {
    geometry: RingGeometry,
    window_size: usize,
}

impl FeatureEngineer {
    pub fn new(geometry: RingGeometry, window_size: usize) -> Self {
        Self {
            geometry,
            window_size,
        }
    }

    pub fn engineer(
        &self,
        ring: &RingRecord,
        history: &[RingRecord],
        geological: Option<&GeologicalContext>,
    ) -> FeatureVector {
        let mut features = HashMap::new();
        let mut quality_flag = QualityFlag::Normal;

        // Raw aggregates; missing -> NaN
        for name in RAW_FEATURES {
            features.insert(
                name.to_string(),
                ring.raw_field(name).unwrap_or(f64::NAN),
            );
        }

        // Physics-derived indicators (shared formulas with the aligner)
        self.insert_derived(ring, &mut features);

        // Geological context, or neutral fallback
        match geological {
            Some(context) => self.insert_geological(context, &mut features),
            None => {
                warn!(
                    ring = ring.ring_number,
                    "Geological data missing, using fallback values"
                );
                self.insert_geological_fallback(&mut features);
                quality_flag = QualityFlag::GeologicalDataIncomplete;
            }
        }

        // Time-windowed features over the last N rings
        if history.len() >= COLD_START_MIN_HISTORY {
            self.insert_windowed(history, &mut features);
        } else {
            debug!(
                ring = ring.ring_number,
                history = history.len(),
                "Insufficient history, cold start mode"
            );
            self.insert_cold_start(&mut features);
            if quality_flag == QualityFlag::Normal {
                quality_flag = QualityFlag::ColdStart;
            }
        }

        let features = normalize(features);
        let feature_completeness = completeness(&features);

        let geological_zone = geological
            .and_then(|g| g.soil_type)
            .map(|s| s.as_str().to_string())
            .or_else(|| ring.geological_zone.clone());

        FeatureVector {
            ring_number: ring.ring_number,
            features,
            feature_completeness,
            quality_flag,
            geological_zone,
        }
    }

    fn insert_derived(&self, ring: &RingRecord, features: &mut HashMap<String, f64>) {
        let (se, gl, vl) = derived_indicators(
            ring.mean_torque,
            ring.mean_advance_rate,
            ring.grout_volume,
            &self.geometry,
        );
        features.insert("specific_energy".to_string(), se.unwrap_or(f64::NAN));
        features.insert("ground_loss_rate".to_string(), gl.unwrap_or(f64::NAN));
        features.insert("volume_loss_ratio".to_string(), vl.unwrap_or(f64::NAN));

        let ratio = |num: Option<f64>, den: Option<f64>| match (num, den) {
            (Some(n), Some(d)) if d != 0.0 => n / d,
            _ => f64::NAN,
        };
        features.insert(
            "thrust_torque_ratio".to_string(),
            ratio(ring.mean_thrust, ring.mean_torque),
        );
        features.insert(
            "advance_pressure_ratio".to_string(),
            ratio(ring.mean_advance_rate, ring.mean_chamber_pressure),
        );
    }

    fn insert_geological(&self, context: &GeologicalContext, features: &mut HashMap<String, f64>) {
        features.insert(
            "overburden_depth".to_string(),
            context.overburden_depth.unwrap_or(0.0),
        );
        features.insert(
            "groundwater_level".to_string(),
            context.groundwater_level.unwrap_or(0.0),
        );
        features.insert(
            "proximity_to_structures".to_string(),
            context.proximity_to_structures.unwrap_or(999.0),
        );

        for soil in SoilType::ALL {
            let hot = context.soil_type == Some(soil);
            features.insert(
                format!("soil_type_{}", soil.as_str()),
                if hot { 1.0 } else { 0.0 },
            );
        }
    }

    fn insert_geological_fallback(&self, features: &mut HashMap<String, f64>) {
        use crate::config::defaults::{
            FALLBACK_GROUNDWATER_LEVEL_M, FALLBACK_OVERBURDEN_DEPTH_M, FALLBACK_PROXIMITY_M,
        };

        features.insert(
            "overburden_depth".to_string(),
            FALLBACK_OVERBURDEN_DEPTH_M,
        );
        features.insert(
            "groundwater_level".to_string(),
            FALLBACK_GROUNDWATER_LEVEL_M,
        );
        features.insert("proximity_to_structures".to_string(), FALLBACK_PROXIMITY_M);

        // unknown soil: all zeros
        for soil in SoilType::ALL {
            features.insert(format!("soil_type_{}", soil.as_str()), 0.0);
        }
    }

    fn insert_windowed(&self, history: &[RingRecord], features: &mut HashMap<String, f64>) {
        let window_start = history.len().saturating_sub(self.window_size);
        let window = &history[window_start..];
        let n = self.window_size;

        for param in WINDOWED_PARAMS {
            let values: Vec<f64> = window.iter().filter_map(|r| r.raw_field(param)).collect();

            if values.is_empty() {
                features.insert(format!("{param}_ma{n}"), f64::NAN);
                features.insert(format!("{param}_std{n}"), f64::NAN);
                features.insert(format!("{param}_trend"), 0.0);
                continue;
            }

            let count = values.len() as f64;
            let mean = values.iter().sum::<f64>() / count;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;

            features.insert(format!("{param}_ma{n}"), mean);
            features.insert(format!("{param}_std{n}"), variance.sqrt());
            features.insert(
                format!("{param}_trend"),
                if values.len() >= 3 {
                    trend_slope(&values)
                } else {
                    0.0
                },
            );
        }

        let thrust: Vec<f64> = window.iter().filter_map(|r| r.mean_thrust).collect();
        let cumulative = if thrust.len() >= 2 {
            thrust[thrust.len() - 1] - thrust[0]
        } else {
            0.0
        };
        features.insert("cumulative_thrust_change".to_string(), cumulative);
    }

    fn insert_cold_start(&self, features: &mut HashMap<String, f64>) {
        let n = self.window_size;
        for param in WINDOWED_PARAMS {
            features.insert(format!("{param}_ma{n}"), 0.0);
            features.insert(format!("{param}_std{n}"), 0.0);
            features.insert(format!("{param}_trend"), 0.0);
        }
        features.insert("cumulative_thrust_change".to_string(), 0.0);
    }

    /// Check recomputed derived indicators against an independently
    /// calculated oracle; each must agree within 2% relative error.
    pub fn validate_derived(
        &self,
        ring: &RingRecord,
        oracle: &HashMap<String, f64>,
    ) -> bool {
        let mut derived = HashMap::new();
        self.insert_derived(ring, &mut derived);

        for (name, expected) in oracle {
            let Some(&calculated) = derived.get(name) else {
                continue;
            };
            if calculated.is_nan() || expected.is_nan() {
                continue;
            }
            let relative_error = if *expected != 0.0 {
                (calculated - expected).abs() / expected.abs()
            } else {
                0.0
            };
            if relative_error > 0.02 {
                warn!(
                    feature = %name,
                    calculated,
                    expected,
                    error_pct = relative_error * 100.0,
                    "Derived feature validation failed"
                );
                return false;
            }
        }
        true
    }
}

/// Least-squares slope of `values` against their index.
fn trend_slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = values.iter().sum::<f64>() / n;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Min-max normalize ranged features (prefix-matched); NaN and unranged
/// features pass through unchanged.
fn normalize(features: HashMap<String, f64>) -> HashMap<String, f64> {
    features
        .into_iter()
        .map(|(key, value)| {
            if value.is_nan() {
                return (key, value);
            }
            let normalized = FEATURE_RANGES
                .iter()
                .find(|(base, _, _)| key.starts_with(base))
                .map(|(_, min, max)| (value - min) / (max - min))
                .unwrap_or(value);
            (key, normalized)
        })
        .collect()
}

fn completeness(features: &HashMap<String, f64>) -> f64 {
    if features.is_empty() {
        return 0.0;
    }
    let complete = features.values().filter(|v| !v.is_nan()).count();
    complete as f64 / features.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Completeness, SyncStatus};

    fn make_ring(ring_number: i64) -> RingRecord {
        RingRecord {
            ring_number,
            start_time: 0.0,
            end_time: 1800.0,
            mean_thrust: Some(12_000.0),
            max_thrust: Some(12_500.0),
            min_thrust: Some(11_500.0),
            std_thrust: Some(120.0),
            mean_torque: Some(900.0),
            max_torque: Some(950.0),
            min_torque: Some(850.0),
            std_torque: Some(25.0),
            mean_chamber_pressure: Some(250.0),
            max_chamber_pressure: Some(270.0),
            min_chamber_pressure: Some(230.0),
            std_chamber_pressure: Some(8.0),
            mean_advance_rate: Some(30.0),
            max_advance_rate: Some(35.0),
            min_advance_rate: Some(25.0),
            std_advance_rate: Some(2.0),
            mean_grout_pressure: Some(180.0),
            max_grout_pressure: Some(200.0),
            min_grout_pressure: Some(160.0),
            std_grout_pressure: Some(10.0),
            grout_volume: Some(40.0),
            mean_pitch: Some(0.1),
            max_pitch: Some(0.2),
            mean_roll: Some(-0.05),
            max_roll: Some(0.1),
            mean_yaw: Some(0.02),
            max_yaw: Some(0.08),
            mean_horizontal_deviation: Some(3.0),
            max_horizontal_deviation: Some(5.0),
            mean_vertical_deviation: Some(2.0),
            max_vertical_deviation: Some(4.0),
            specific_energy: None,
            ground_loss_rate: None,
            volume_loss_ratio: None,
            settlement_value: None,
            data_completeness_flag: Completeness::Complete,
            geological_zone: None,
            sync_status: SyncStatus::Pending,
            created_at: 0.0,
            updated_at: 0.0,
        }
    }

    fn make_history(len: usize) -> Vec<RingRecord> {
        (0..len)
            .map(|i| {
                let mut ring = make_ring(i as i64);
                // linearly increasing thrust so the trend is known
                ring.mean_thrust = Some(10_000.0 + 100.0 * i as f64);
                ring
            })
            .collect()
    }

    fn engineer() -> FeatureEngineer {
        FeatureEngineer::new(RingGeometry::default(), 10)
    }

    #[test]
    fn test_raw_features_missing_become_nan() {
        let mut ring = make_ring(1);
        ring.mean_thrust = None;

        let vector = engineer().engineer(&ring, &make_history(5), None);
        assert!(vector.features["mean_thrust"].is_nan());
        assert!(vector.feature_completeness < 1.0);
    }

    #[test]
    fn test_derived_ratios() {
        let ring = make_ring(1);
        let vector = engineer().engineer(&ring, &make_history(5), None);

        // unnormalized features: ratios have no range entry
        let ttr = vector.features["thrust_torque_ratio"];
        assert!((ttr - 12_000.0 / 900.0).abs() < 1e-9);

        let apr = vector.features["advance_pressure_ratio"];
        assert!((apr - 30.0 / 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_division_by_zero_is_nan() {
        let mut ring = make_ring(1);
        ring.mean_torque = Some(0.0);
        let vector = engineer().engineer(&ring, &make_history(5), None);
        assert!(vector.features["thrust_torque_ratio"].is_nan());
    }

    #[test]
    fn test_geological_one_hot() {
        let ring = make_ring(1);
        let context = GeologicalContext {
            soil_type: Some(SoilType::SoftClay),
            overburden_depth: Some(18.0),
            groundwater_level: Some(-2.5),
            proximity_to_structures: Some(12.0),
        };

        let vector = engineer().engineer(&ring, &make_history(5), Some(&context));
        assert_eq!(vector.features["soil_type_soft_clay"], 1.0);
        assert_eq!(vector.features["soil_type_hard_rock"], 0.0);
        assert_eq!(vector.quality_flag, QualityFlag::Normal);
        assert_eq!(vector.geological_zone.as_deref(), Some("soft_clay"));

        // overburden_depth normalized into (5, 30)
        let depth = vector.features["overburden_depth"];
        assert!((depth - (18.0 - 5.0) / 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_geological_sets_flag_and_fallback() {
        let ring = make_ring(1);
        let vector = engineer().engineer(&ring, &make_history(5), None);

        assert_eq!(vector.quality_flag, QualityFlag::GeologicalDataIncomplete);
        for soil in SoilType::ALL {
            assert_eq!(
                vector.features[&format!("soil_type_{}", soil.as_str())],
                0.0
            );
        }
        assert_eq!(vector.features["proximity_to_structures"], 999.0);
    }

    #[test]
    fn test_cold_start_zeros_and_flag() {
        let ring = make_ring(1);
        let context = GeologicalContext {
            soil_type: Some(SoilType::Mixed),
            overburden_depth: Some(10.0),
            groundwater_level: Some(-3.0),
            proximity_to_structures: None,
        };

        let vector = engineer().engineer(&ring, &make_history(2), Some(&context));
        assert_eq!(vector.quality_flag, QualityFlag::ColdStart);
        assert_eq!(vector.features["mean_thrust_trend"], 0.0);
        assert_eq!(vector.features["cumulative_thrust_change"], 0.0);
    }

    #[test]
    fn test_geological_flag_outranks_cold_start() {
        let ring = make_ring(1);
        let vector = engineer().engineer(&ring, &[], None);
        assert_eq!(vector.quality_flag, QualityFlag::GeologicalDataIncomplete);
    }

    #[test]
    fn test_windowed_trend_on_linear_series() {
        let ring = make_ring(20);
        let history = make_history(10);
        let vector = engineer().engineer(&ring, &history, None);

        // thrust rises 100 kN per ring; the raw slope of 100 then passes
        // through the prefix-matched min-max mapping for mean_thrust
        let trend = vector.features["mean_thrust_trend"];
        assert!(
            (trend - (100.0 - 8_000.0) / 10_000.0).abs() < 1e-9,
            "trend = {trend}"
        );

        // cumulative change has no range entry and passes through raw
        let cumulative = vector.features["cumulative_thrust_change"];
        assert!((cumulative - 900.0).abs() < 1e-9);
    }

    #[test]
    fn test_trend_slope_exact() {
        assert!((trend_slope(&[1.0, 2.0, 3.0, 4.0]) - 1.0).abs() < 1e-12);
        assert!(trend_slope(&[5.0, 5.0, 5.0]).abs() < 1e-12);
    }

    #[test]
    fn test_validate_derived_within_tolerance() {
        let ring = make_ring(1);
        let fe = engineer();

        let mut oracle = HashMap::new();
        // hand-computed for T=900 kN·m, v=30 mm/min, d=6.5 m, rpm=2.0
        oracle.insert("specific_energy".to_string(), 11.36);
        oracle.insert("thrust_torque_ratio".to_string(), 13.333);
        assert!(fe.validate_derived(&ring, &oracle));

        let mut bad = HashMap::new();
        bad.insert("specific_energy".to_string(), 20.0);
        assert!(!fe.validate_derived(&ring, &bad));
    }

    #[test]
    fn test_completeness_fraction() {
        let mut features = HashMap::new();
        features.insert("a".to_string(), 1.0);
        features.insert("b".to_string(), f64::NAN);
        features.insert("c".to_string(), 0.0);
        features.insert("d".to_string(), f64::NAN);
        assert!((completeness(&features) - 0.5).abs() < 1e-12);
    }
}
