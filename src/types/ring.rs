//! Ring summary record — one aggregated row per excavated tunnel ring
//!
//! Created when a ring's excavation window closes; mutated only by the
//! aligner (re-alignment) and by the sync core (sync_status flip).

use serde::{Deserialize, Serialize};

/// Data completeness for an aligned ring.
///
/// `Acceptable` is an operator-granted grade used by the purger's safety
/// filter; the aligner itself only emits the other three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    Acceptable,
    Partial,
    Incomplete,
}

impl Completeness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completeness::Complete => "complete",
            Completeness::Acceptable => "acceptable",
            Completeness::Partial => "partial",
            Completeness::Incomplete => "incomplete",
        }
    }
}

/// Cloud sync state of a ring record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
}

/// One aggregated ring record.
///
/// `start_time`/`end_time` are UNIX seconds. Aggregates are NULL (not zero)
/// when the source channel had no samples in the window. The lagged
/// `settlement_value` is the mean of surface settlement readings in the
/// configured lag window after `end_time`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RingRecord {
    pub ring_number: i64,
    pub start_time: f64,
    pub end_time: f64,

    // PLC channel aggregates
    pub mean_thrust: Option<f64>,
    pub max_thrust: Option<f64>,
    pub min_thrust: Option<f64>,
    pub std_thrust: Option<f64>,

    pub mean_torque: Option<f64>,
    pub max_torque: Option<f64>,
    pub min_torque: Option<f64>,
    pub std_torque: Option<f64>,

    pub mean_chamber_pressure: Option<f64>,
    pub max_chamber_pressure: Option<f64>,
    pub min_chamber_pressure: Option<f64>,
    pub std_chamber_pressure: Option<f64>,

    pub mean_advance_rate: Option<f64>,
    pub max_advance_rate: Option<f64>,
    pub min_advance_rate: Option<f64>,
    pub std_advance_rate: Option<f64>,

    pub mean_grout_pressure: Option<f64>,
    pub max_grout_pressure: Option<f64>,
    pub min_grout_pressure: Option<f64>,
    pub std_grout_pressure: Option<f64>,

    /// Mean of the grout_volume tag over the window (m³)
    pub grout_volume: Option<f64>,

    // Attitude aggregates
    pub mean_pitch: Option<f64>,
    pub max_pitch: Option<f64>,
    pub mean_roll: Option<f64>,
    pub max_roll: Option<f64>,
    pub mean_yaw: Option<f64>,
    pub max_yaw: Option<f64>,
    pub mean_horizontal_deviation: Option<f64>,
    pub max_horizontal_deviation: Option<f64>,
    pub mean_vertical_deviation: Option<f64>,
    pub max_vertical_deviation: Option<f64>,

    // Derived engineering indicators
    /// MJ/m³
    pub specific_energy: Option<f64>,
    /// m³ (theoretical volume minus grout volume)
    pub ground_loss_rate: Option<f64>,
    /// percent of theoretical volume
    pub volume_loss_ratio: Option<f64>,

    /// Time-lagged surface settlement target (mm)
    pub settlement_value: Option<f64>,

    pub data_completeness_flag: Completeness,
    pub geological_zone: Option<String>,
    pub sync_status: SyncStatus,

    pub created_at: f64,
    pub updated_at: f64,
}

impl RingRecord {
    /// Named lookup for raw feature extraction. Returns None both for
    /// unknown names and for NULL aggregates.
    pub fn raw_field(&self, name: &str) -> Option<f64> {
        match name {
            "mean_thrust" => self.mean_thrust,
            "max_thrust" => self.max_thrust,
            "min_thrust" => self.min_thrust,
            "std_thrust" => self.std_thrust,
            "mean_torque" => self.mean_torque,
            "max_torque" => self.max_torque,
            "min_torque" => self.min_torque,
            "std_torque" => self.std_torque,
            "mean_chamber_pressure" => self.mean_chamber_pressure,
            "max_chamber_pressure" => self.max_chamber_pressure,
            "std_chamber_pressure" => self.std_chamber_pressure,
            "mean_advance_rate" => self.mean_advance_rate,
            "max_advance_rate" => self.max_advance_rate,
            "mean_grout_pressure" => self.mean_grout_pressure,
            "grout_volume" => self.grout_volume,
            "mean_pitch" => self.mean_pitch,
            "mean_roll" => self.mean_roll,
            "mean_yaw" => self.mean_yaw,
            "horizontal_deviation_max" => self.max_horizontal_deviation,
            "vertical_deviation_max" => self.max_vertical_deviation,
            _ => None,
        }
    }
}
