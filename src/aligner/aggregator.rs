//! Ring data aggregation and alignment
//!
//! Aggregates high-frequency PLC and attitude telemetry over a ring's
//! excavation window, computes derived engineering indicators from ring
//! geometry, and associates the time-lagged surface settlement target.

use crate::config::{AggFn, AlignmentConfig, RingGeometry};
use crate::error::{EdgeError, Result};
use crate::storage::{now_ts, EdgeStore};
use crate::types::{Completeness, RingRecord};
use std::collections::HashMap;
use tracing::{debug, info};

/// PLC tags retained for aggregation, keyed to their ring_summary column
/// prefix. Everything else in plc_logs is ignored by the aligner.
const PLC_CHANNELS: [(&str, &str); 6] = [
    ("thrust_total", "thrust"),
    ("torque_cutterhead", "torque"),
    ("chamber_pressure", "chamber_pressure"),
    ("advance_rate", "advance_rate"),
    ("grout_pressure", "grout_pressure"),
    ("grout_volume", "grout_volume"),
];

const ATTITUDE_FIELDS: [&str; 5] = [
    "pitch",
    "roll",
    "yaw",
    "horizontal_deviation",
    "vertical_deviation",
];

/// Aggregates for one channel. Fields are None when the aggregate is not
/// enabled in config or the channel had no samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelAggregates {
    pub mean: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
    pub std: Option<f64>,
}

impl ChannelAggregates {
    /// Compute the enabled subset of aggregates. An empty slice yields all
    /// None — an empty channel must never read as zero.
    fn compute(values: &[f64], enabled: &[AggFn]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;

        let mut agg = Self::default();
        for func in enabled {
            match func {
                AggFn::Mean => agg.mean = Some(mean),
                AggFn::Max => agg.max = Some(values.iter().cloned().fold(f64::MIN, f64::max)),
                AggFn::Min => agg.min = Some(values.iter().cloned().fold(f64::MAX, f64::min)),
                AggFn::Std => {
                    let variance =
                        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                    agg.std = Some(variance.sqrt());
                }
            }
        }
        agg
    }
}

/// Derived engineering indicators from channel means and ring geometry.
///
/// - specific energy `E_s = (T·ω)/(A·v)` in MJ/m³, with T in kN·m converted
///   to N·m, ω from the configured cutterhead RPM, v from mm/min to m/s.
///   NULL when torque or advance rate is missing, or advance rate is zero.
/// - ground loss `V_t − V_grout` in m³ (missing grout volume counts as 0).
/// - volume loss ratio `100·V_loss/V_t` when `V_t > 0`.
pub fn derived_indicators(
    mean_torque: Option<f64>,
    mean_advance_rate: Option<f64>,
    grout_volume: Option<f64>,
    geometry: &RingGeometry,
) -> (Option<f64>, Option<f64>, Option<f64>) {
    let excavation_area = std::f64::consts::PI * geometry.diameter.powi(2) / 4.0;

    let specific_energy = match (mean_torque, mean_advance_rate) {
        (Some(torque), Some(advance_rate)) if advance_rate > 0.0 => {
            let omega = geometry.default_cutterhead_rpm * 2.0 * std::f64::consts::PI / 60.0;
            let velocity = advance_rate / 1000.0 / 60.0;
            let energy_j_per_m3 = (torque * 1000.0 * omega) / (excavation_area * velocity);
            Some(energy_j_per_m3 / 1e6)
        }
        _ => None,
    };

    let theoretical_volume = excavation_area * geometry.width;
    let ground_loss = theoretical_volume - grout_volume.unwrap_or(0.0);

    let volume_loss_ratio = if theoretical_volume > 0.0 {
        Some(ground_loss / theoretical_volume * 100.0)
    } else {
        None
    };

    (specific_energy, Some(ground_loss), volume_loss_ratio)
}

/// The ring aligner. `align` is idempotent for stable inputs.
pub struct RingAligner {
    store: EdgeStore,
    config: AlignmentConfig,
}

impl RingAligner {
    pub fn new(store: EdgeStore, config: AlignmentConfig) -> Self {
        Self { store, config }
    }

    /// Aggregate one ring's telemetry window and persist the result.
    ///
    /// Fails with `RingNotFound` when no window row exists, and with
    /// `DataInsufficient` when neither the PLC nor the attitude minimum was
    /// met — the incomplete record is still persisted first so downstream
    /// consumers can see the flag.
    pub async fn align(&self, ring_number: i64) -> Result<RingRecord> {
        // Step 1: ring time window
        let window: Option<(f64, f64)> = sqlx::query_as(
            "SELECT start_time, end_time FROM ring_summary WHERE ring_number = ?",
        )
        .bind(ring_number)
        .fetch_optional(self.store.pool())
        .await?;

        let (start_time, end_time) = window.ok_or(EdgeError::RingNotFound { ring_number })?;

        debug!(
            ring = ring_number,
            start = start_time,
            end = end_time,
            "Aligning ring window"
        );

        // Step 2: high-frequency PLC samples in-window, quality-filtered
        let plc_rows = self.fetch_plc_rows(ring_number, start_time, end_time).await?;
        let plc_count = plc_rows.len() as i64;

        let mut groups: HashMap<&str, Vec<f64>> = HashMap::new();
        for (tag_name, value) in &plc_rows {
            let channel = PLC_CHANNELS
                .iter()
                .find(|(tag, _)| *tag == tag_name.as_str())
                .map(|(_, channel)| *channel);
            if let Some(channel) = channel {
                groups.entry(channel).or_default().push(*value);
            }
        }

        let enabled = &self.config.aggregation_functions;
        let mut plc: HashMap<&str, ChannelAggregates> = HashMap::new();
        for (_, channel) in PLC_CHANNELS {
            let values = groups.get(channel).map(Vec::as_slice).unwrap_or(&[]);
            plc.insert(channel, ChannelAggregates::compute(values, enabled));
        }

        // Step 3: attitude aggregation (mean and max; NULL samples ignored)
        let attitude_rows = self
            .fetch_attitude_rows(ring_number, start_time, end_time)
            .await?;
        let attitude_count = attitude_rows.len() as i64;

        let attitude_enabled = [AggFn::Mean, AggFn::Max];
        let mut attitude: HashMap<&str, ChannelAggregates> = HashMap::new();
        for (idx, field) in ATTITUDE_FIELDS.iter().enumerate() {
            let values: Vec<f64> = attitude_rows.iter().filter_map(|row| row[idx]).collect();
            attitude.insert(*field, ChannelAggregates::compute(&values, &attitude_enabled));
        }

        // Step 4: derived indicators from ring geometry
        let torque = plc["torque"].mean;
        let advance = plc["advance_rate"].mean;
        let grout = plc["grout_volume"].mean;
        let (specific_energy, ground_loss_rate, volume_loss_ratio) =
            derived_indicators(torque, advance, grout, &self.config.geometry);

        // Step 5: lagged surface settlement target
        let settlement_value = self.fetch_lagged_settlement(ring_number, end_time).await?;

        // Step 6: completeness assessment
        let completeness = self.assess_completeness(plc_count, attitude_count, settlement_value);

        // Step 7: persist the whole record in one statement
        self.persist(
            ring_number,
            &plc,
            &attitude,
            specific_energy,
            ground_loss_rate,
            volume_loss_ratio,
            settlement_value,
            completeness,
        )
        .await?;

        info!(
            ring = ring_number,
            plc_samples = plc_count,
            attitude_samples = attitude_count,
            completeness = completeness.as_str(),
            settlement = ?settlement_value,
            "Ring alignment complete"
        );

        if completeness == Completeness::Incomplete {
            return Err(EdgeError::DataInsufficient {
                ring_number,
                detail: format!(
                    "{} PLC samples (min {}), {} attitude samples (min {})",
                    plc_count,
                    self.config.completeness.min_plc_readings,
                    attitude_count,
                    self.config.completeness.min_attitude_readings
                ),
            });
        }

        self.store
            .fetch_ring(ring_number)
            .await?
            .ok_or(EdgeError::RingNotFound { ring_number })
    }

    async fn fetch_plc_rows(
        &self,
        ring_number: i64,
        start_time: f64,
        end_time: f64,
    ) -> Result<Vec<(String, f64)>> {
        let rows = if self.config.require_ring_tag {
            sqlx::query_as(
                "SELECT tag_name, value FROM plc_logs
                 WHERE timestamp >= ? AND timestamp <= ?
                 AND data_quality_flag IN ('raw', 'interpolated', 'calibrated')
                 AND ring_number = ?",
            )
            .bind(start_time)
            .bind(end_time)
            .bind(ring_number)
            .fetch_all(self.store.pool())
            .await?
        } else {
            sqlx::query_as(
                "SELECT tag_name, value FROM plc_logs
                 WHERE timestamp >= ? AND timestamp <= ?
                 AND data_quality_flag IN ('raw', 'interpolated', 'calibrated')",
            )
            .bind(start_time)
            .bind(end_time)
            .fetch_all(self.store.pool())
            .await?
        };
        Ok(rows)
    }

    #[allow(clippy::type_complexity)]
    async fn fetch_attitude_rows(
        &self,
        ring_number: i64,
        start_time: f64,
        end_time: f64,
    ) -> Result<Vec<[Option<f64>; 5]>> {
        type AttitudeRow = (Option<f64>, Option<f64>, Option<f64>, Option<f64>, Option<f64>);
        let rows: Vec<AttitudeRow> = if self.config.require_ring_tag {
            sqlx::query_as(
                "SELECT pitch, roll, yaw, horizontal_deviation, vertical_deviation
                 FROM attitude_logs
                 WHERE timestamp >= ? AND timestamp <= ? AND ring_number = ?",
            )
            .bind(start_time)
            .bind(end_time)
            .bind(ring_number)
            .fetch_all(self.store.pool())
            .await?
        } else {
            sqlx::query_as(
                "SELECT pitch, roll, yaw, horizontal_deviation, vertical_deviation
                 FROM attitude_logs
                 WHERE timestamp >= ? AND timestamp <= ?",
            )
            .bind(start_time)
            .bind(end_time)
            .fetch_all(self.store.pool())
            .await?
        };
        Ok(rows
            .into_iter()
            .map(|(p, r, y, h, v)| [p, r, y, h, v])
            .collect())
    }

    /// Mean of surface settlement readings in the configured lag window
    /// after ring close; NULL when no readings exist.
    async fn fetch_lagged_settlement(
        &self,
        ring_number: i64,
        end_time: f64,
    ) -> Result<Option<f64>> {
        let Some(lag) = self.config.time_lag_windows.get("surface_settlement") else {
            return Ok(None);
        };

        let window_start = end_time + lag.min_hours * 3600.0;
        let window_end = end_time + lag.max_hours * 3600.0;

        let row: (Option<f64>,) = if self.config.require_ring_tag {
            sqlx::query_as(
                "SELECT AVG(value) FROM monitoring_logs
                 WHERE sensor_type = 'surface_settlement'
                 AND timestamp >= ? AND timestamp <= ?
                 AND ring_number = ?",
            )
            .bind(window_start)
            .bind(window_end)
            .bind(ring_number)
            .fetch_one(self.store.pool())
            .await?
        } else {
            sqlx::query_as(
                "SELECT AVG(value) FROM monitoring_logs
                 WHERE sensor_type = 'surface_settlement'
                 AND timestamp >= ? AND timestamp <= ?",
            )
            .bind(window_start)
            .bind(window_end)
            .fetch_one(self.store.pool())
            .await?
        };

        Ok(row.0)
    }

    fn assess_completeness(
        &self,
        plc_count: i64,
        attitude_count: i64,
        settlement: Option<f64>,
    ) -> Completeness {
        let limits = &self.config.completeness;
        let has_min_plc = plc_count >= limits.min_plc_readings;
        let has_min_attitude = attitude_count >= limits.min_attitude_readings;
        let has_settlement = if limits.require_settlement {
            settlement.is_some()
        } else {
            true
        };

        if has_min_plc && has_min_attitude && has_settlement {
            Completeness::Complete
        } else if has_min_plc || has_min_attitude {
            Completeness::Partial
        } else {
            Completeness::Incomplete
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist(
        &self,
        ring_number: i64,
        plc: &HashMap<&str, ChannelAggregates>,
        attitude: &HashMap<&str, ChannelAggregates>,
        specific_energy: Option<f64>,
        ground_loss_rate: Option<f64>,
        volume_loss_ratio: Option<f64>,
        settlement_value: Option<f64>,
        completeness: Completeness,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE ring_summary SET
                mean_thrust = ?, max_thrust = ?, min_thrust = ?, std_thrust = ?,
                mean_torque = ?, max_torque = ?, min_torque = ?, std_torque = ?,
                mean_chamber_pressure = ?, max_chamber_pressure = ?,
                min_chamber_pressure = ?, std_chamber_pressure = ?,
                mean_advance_rate = ?, max_advance_rate = ?,
                min_advance_rate = ?, std_advance_rate = ?,
                mean_grout_pressure = ?, max_grout_pressure = ?,
                min_grout_pressure = ?, std_grout_pressure = ?,
                grout_volume = ?,
                mean_pitch = ?, max_pitch = ?,
                mean_roll = ?, max_roll = ?,
                mean_yaw = ?, max_yaw = ?,
                mean_horizontal_deviation = ?, max_horizontal_deviation = ?,
                mean_vertical_deviation = ?, max_vertical_deviation = ?,
                specific_energy = ?, ground_loss_rate = ?, volume_loss_ratio = ?,
                settlement_value = ?,
                data_completeness_flag = ?,
                updated_at = ?
             WHERE ring_number = ?",
        )
        .bind(plc["thrust"].mean)
        .bind(plc["thrust"].max)
        .bind(plc["thrust"].min)
        .bind(plc["thrust"].std)
        .bind(plc["torque"].mean)
        .bind(plc["torque"].max)
        .bind(plc["torque"].min)
        .bind(plc["torque"].std)
        .bind(plc["chamber_pressure"].mean)
        .bind(plc["chamber_pressure"].max)
        .bind(plc["chamber_pressure"].min)
        .bind(plc["chamber_pressure"].std)
        .bind(plc["advance_rate"].mean)
        .bind(plc["advance_rate"].max)
        .bind(plc["advance_rate"].min)
        .bind(plc["advance_rate"].std)
        .bind(plc["grout_pressure"].mean)
        .bind(plc["grout_pressure"].max)
        .bind(plc["grout_pressure"].min)
        .bind(plc["grout_pressure"].std)
        .bind(plc["grout_volume"].mean)
        .bind(attitude["pitch"].mean)
        .bind(attitude["pitch"].max)
        .bind(attitude["roll"].mean)
        .bind(attitude["roll"].max)
        .bind(attitude["yaw"].mean)
        .bind(attitude["yaw"].max)
        .bind(attitude["horizontal_deviation"].mean)
        .bind(attitude["horizontal_deviation"].max)
        .bind(attitude["vertical_deviation"].mean)
        .bind(attitude["vertical_deviation"].max)
        .bind(specific_energy)
        .bind(ground_loss_rate)
        .bind(volume_loss_ratio)
        .bind(settlement_value)
        .bind(completeness)
        .bind(now_ts())
        .bind(ring_number)
        .execute(self.store.pool())
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlignmentConfig;

    async fn test_store() -> (tempfile::TempDir, EdgeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EdgeStore::open(&dir.path().join("aligner.db"))
            .await
            .unwrap();
        (dir, store)
    }

    #[test]
    fn test_channel_aggregates_constant_signal() {
        let values = vec![12_000.0; 100];
        let agg = ChannelAggregates::compute(
            &values,
            &[AggFn::Mean, AggFn::Max, AggFn::Min, AggFn::Std],
        );
        assert_eq!(agg.mean, Some(12_000.0));
        assert_eq!(agg.max, Some(12_000.0));
        assert_eq!(agg.min, Some(12_000.0));
        assert_eq!(agg.std, Some(0.0));
    }

    #[test]
    fn test_channel_aggregates_empty_is_null_not_zero() {
        let agg = ChannelAggregates::compute(&[], &[AggFn::Mean, AggFn::Std]);
        assert!(agg.mean.is_none());
        assert!(agg.std.is_none());
    }

    #[test]
    fn test_channel_aggregates_respects_enabled_subset() {
        let agg = ChannelAggregates::compute(&[1.0, 2.0, 3.0], &[AggFn::Mean]);
        assert_eq!(agg.mean, Some(2.0));
        assert!(agg.max.is_none());
        assert!(agg.std.is_none());
    }

    #[test]
    fn test_population_std() {
        // population std of [2, 4, 4, 4, 5, 5, 7, 9] is exactly 2
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let agg = ChannelAggregates::compute(&values, &[AggFn::Std]);
        assert!((agg.std.unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_derived_indicators_hand_calculation() {
        let geometry = RingGeometry {
            diameter: 6.5,
            width: 1.5,
            default_cutterhead_rpm: 2.0,
        };

        // T = 900 kN·m, v = 30 mm/min
        let (se, gl, vl) = derived_indicators(Some(900.0), Some(30.0), Some(40.0), &geometry);

        // Hand calculation:
        //   A     = π·6.5²/4                = 33.183 m²
        //   ω     = 2.0·2π/60               = 0.20944 rad/s
        //   v     = 30/1000/60              = 0.0005 m/s
        //   E_s   = 900e3·0.20944/(A·v)     = 11.360e6 J/m³ = 11.36 MJ/m³
        //   V_t   = A·1.5                   = 49.775 m³
        //   loss  = 49.775 − 40             = 9.775 m³
        //   ratio = 100·9.775/49.775        = 19.638 %
        let se = se.unwrap();
        assert!((se - 11.36).abs() / 11.36 < 0.02, "specific_energy = {se}");

        let gl = gl.unwrap();
        assert!((gl - 9.775).abs() / 9.775 < 0.02, "ground_loss = {gl}");

        let vl = vl.unwrap();
        assert!((vl - 19.638).abs() / 19.638 < 0.02, "volume_loss = {vl}");
    }

    #[test]
    fn test_derived_indicators_zero_advance_is_null() {
        let geometry = RingGeometry::default();
        let (se, _, _) = derived_indicators(Some(900.0), Some(0.0), None, &geometry);
        assert!(se.is_none());
        let (se, _, _) = derived_indicators(None, Some(30.0), None, &geometry);
        assert!(se.is_none());
    }

    #[tokio::test]
    async fn test_align_missing_ring() {
        let (_dir, store) = test_store().await;
        let aligner = RingAligner::new(store, AlignmentConfig::default());

        match aligner.align(999).await {
            Err(EdgeError::RingNotFound { ring_number }) => assert_eq!(ring_number, 999),
            other => panic!("expected RingNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_align_full_window() {
        // 1800 PLC rows at 1 Hz with constant thrust, lagged settlement of
        // 5.0 mm in the 6-8 h window
        let (_dir, store) = test_store().await;
        let start = 1_700_000_000.0;
        let end = 1_700_001_800.0;

        store.create_ring_window(100, start, end).await.unwrap();

        for i in 0..1800 {
            store
                .insert_plc_sample(start + i as f64, "thrust_total", 12_000.0, "raw", Some(100))
                .await
                .unwrap();
        }
        for i in 0..10 {
            store
                .insert_monitoring_sample(
                    end + 6.0 * 3600.0 + i as f64 * 60.0,
                    "surface_settlement",
                    5.0,
                    Some(100),
                )
                .await
                .unwrap();
        }

        let aligner = RingAligner::new(store.clone(), AlignmentConfig::default());
        let ring = aligner.align(100).await.unwrap();

        assert_eq!(ring.mean_thrust, Some(12_000.0));
        assert_eq!(ring.std_thrust, Some(0.0));
        assert_eq!(ring.settlement_value, Some(5.0));
        assert_eq!(ring.data_completeness_flag, Completeness::Complete);
        // empty channels stay NULL
        assert!(ring.mean_torque.is_none());
        assert!(ring.specific_energy.is_none());
        // grout volume missing counts as zero for ground loss
        assert!(ring.ground_loss_rate.is_some());
    }

    #[tokio::test]
    async fn test_align_is_idempotent() {
        let (_dir, store) = test_store().await;
        let start = 1_700_000_000.0;
        let end = 1_700_000_600.0;
        store.create_ring_window(5, start, end).await.unwrap();

        for i in 0..600 {
            store
                .insert_plc_sample(start + i as f64, "torque_cutterhead", 900.0, "raw", Some(5))
                .await
                .unwrap();
            store
                .insert_plc_sample(start + i as f64, "advance_rate", 30.0, "raw", Some(5))
                .await
                .unwrap();
        }

        let aligner = RingAligner::new(store.clone(), AlignmentConfig::default());
        let first = aligner.align(5).await.unwrap();
        let second = aligner.align(5).await.unwrap();

        assert_eq!(first.mean_torque, second.mean_torque);
        assert_eq!(first.specific_energy, second.specific_energy);
        assert_eq!(first.data_completeness_flag, second.data_completeness_flag);
    }

    #[tokio::test]
    async fn test_align_excludes_rejected_quality() {
        let (_dir, store) = test_store().await;
        let start = 1000.0;
        store.create_ring_window(3, start, start + 200.0).await.unwrap();

        for i in 0..150 {
            store
                .insert_plc_sample(start + i as f64, "thrust_total", 10_000.0, "raw", Some(3))
                .await
                .unwrap();
        }
        // rejected samples must not contribute
        for i in 0..50 {
            store
                .insert_plc_sample(start + i as f64, "thrust_total", 99_999.0, "rejected", Some(3))
                .await
                .unwrap();
        }

        let aligner = RingAligner::new(store.clone(), AlignmentConfig::default());
        let ring = aligner.align(3).await.unwrap();
        assert_eq!(ring.mean_thrust, Some(10_000.0));
    }

    #[tokio::test]
    async fn test_align_insufficient_data() {
        let (_dir, store) = test_store().await;
        store.create_ring_window(8, 0.0, 100.0).await.unwrap();
        // only 5 PLC samples, below the default minimum of 100

        for i in 0..5 {
            store
                .insert_plc_sample(i as f64, "thrust_total", 1.0, "raw", Some(8))
                .await
                .unwrap();
        }

        let mut config = AlignmentConfig::default();
        config.completeness.min_attitude_readings = 10;

        let aligner = RingAligner::new(store.clone(), config);
        match aligner.align(8).await {
            Err(EdgeError::DataInsufficient { ring_number, .. }) => assert_eq!(ring_number, 8),
            other => panic!("expected DataInsufficient, got {other:?}"),
        }

        // the incomplete record is still persisted
        let ring = store.fetch_ring(8).await.unwrap().unwrap();
        assert_eq!(ring.data_completeness_flag, Completeness::Incomplete);
        assert_eq!(ring.mean_thrust, Some(1.0));
    }
}
