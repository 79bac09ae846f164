//! Embedded relational store — the single shared mutable state
//!
//! One SQLite database holds telemetry tables (written by the external
//! source drivers), ring summaries, predictions, the model registry and the
//! sync buffer. All multi-statement changes run inside transactions; unique
//! indexes replace read-modify-write where a race is possible.

use crate::error::Result;
use crate::types::RingRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

/// Handle to the embedded store. Cheap to clone; every component gets one
/// at construction.
#[derive(Clone)]
pub struct EdgeStore {
    pool: SqlitePool,
}

/// Current UNIX time with sub-second resolution.
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

impl EdgeStore {
    /// Open (or create) the database file and apply the schema.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;

        info!(path = %db_path.display(), "Edge store opened");
        Ok(store)
    }

    /// Underlying pool for component-local queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create all tables and indexes if absent. Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            // Inbound telemetry (written by external source drivers)
            "CREATE TABLE IF NOT EXISTS plc_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                tag_name TEXT NOT NULL,
                value REAL,
                data_quality_flag TEXT NOT NULL DEFAULT 'raw',
                ring_number INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_plc_logs_window
                ON plc_logs(timestamp, tag_name)",
            "CREATE INDEX IF NOT EXISTS idx_plc_logs_ring
                ON plc_logs(ring_number)",
            "CREATE TABLE IF NOT EXISTS attitude_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                pitch REAL,
                roll REAL,
                yaw REAL,
                horizontal_deviation REAL,
                vertical_deviation REAL,
                ring_number INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_attitude_logs_window
                ON attitude_logs(timestamp)",
            "CREATE TABLE IF NOT EXISTS monitoring_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                sensor_type TEXT NOT NULL,
                value REAL,
                ring_number INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_monitoring_logs_sensor
                ON monitoring_logs(sensor_type, timestamp)",
            // Ring summaries
            "CREATE TABLE IF NOT EXISTS ring_summary (
                ring_number INTEGER PRIMARY KEY,
                start_time REAL NOT NULL,
                end_time REAL NOT NULL,
                mean_thrust REAL, max_thrust REAL, min_thrust REAL, std_thrust REAL,
                mean_torque REAL, max_torque REAL, min_torque REAL, std_torque REAL,
                mean_chamber_pressure REAL, max_chamber_pressure REAL,
                min_chamber_pressure REAL, std_chamber_pressure REAL,
                mean_advance_rate REAL, max_advance_rate REAL,
                min_advance_rate REAL, std_advance_rate REAL,
                mean_grout_pressure REAL, max_grout_pressure REAL,
                min_grout_pressure REAL, std_grout_pressure REAL,
                grout_volume REAL,
                mean_pitch REAL, max_pitch REAL,
                mean_roll REAL, max_roll REAL,
                mean_yaw REAL, max_yaw REAL,
                mean_horizontal_deviation REAL, max_horizontal_deviation REAL,
                mean_vertical_deviation REAL, max_vertical_deviation REAL,
                specific_energy REAL,
                ground_loss_rate REAL,
                volume_loss_ratio REAL,
                settlement_value REAL,
                data_completeness_flag TEXT NOT NULL DEFAULT 'incomplete',
                geological_zone TEXT,
                sync_status TEXT NOT NULL DEFAULT 'pending',
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL,
                CHECK (start_time <= end_time)
            )",
            "CREATE INDEX IF NOT EXISTS idx_ring_summary_sync
                ON ring_summary(sync_status)",
            // Predictions
            "CREATE TABLE IF NOT EXISTS prediction_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ring_number INTEGER NOT NULL,
                timestamp REAL NOT NULL,
                model_name TEXT NOT NULL,
                model_version TEXT NOT NULL,
                model_type TEXT NOT NULL,
                geological_zone TEXT,
                predicted_settlement REAL NOT NULL,
                settlement_lower REAL NOT NULL,
                settlement_upper REAL NOT NULL,
                predicted_displacement REAL,
                displacement_lower REAL,
                displacement_upper REAL,
                predicted_groundwater_change REAL,
                groundwater_lower REAL,
                groundwater_upper REAL,
                prediction_confidence REAL NOT NULL,
                inference_time_ms REAL NOT NULL,
                feature_completeness REAL NOT NULL,
                quality_flag TEXT NOT NULL DEFAULT 'normal',
                actual_settlement REAL,
                actual_displacement REAL,
                actual_groundwater_change REAL,
                prediction_error REAL,
                absolute_error REAL,
                created_at REAL NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_prediction_ring
                ON prediction_results(ring_number)",
            "CREATE INDEX IF NOT EXISTS idx_prediction_model
                ON prediction_results(model_name, timestamp)",
            // Model registry
            "CREATE TABLE IF NOT EXISTS model_metadata (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_name TEXT NOT NULL UNIQUE,
                model_version TEXT NOT NULL,
                model_type TEXT NOT NULL,
                artifact_path TEXT NOT NULL,
                checksum TEXT,
                model_size_bytes INTEGER,
                training_date REAL,
                training_data_range TEXT,
                geological_zone TEXT NOT NULL DEFAULT 'all',
                validation_r2 REAL,
                validation_rmse REAL,
                validation_mae REAL,
                feature_list TEXT NOT NULL DEFAULT '[]',
                output_format_version TEXT,
                hyperparameters TEXT NOT NULL DEFAULT '{}',
                deployment_status TEXT NOT NULL DEFAULT 'staged',
                deployed_at REAL,
                retired_at REAL,
                load_time_seconds REAL,
                avg_inference_time_ms REAL,
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_model_metadata_status
                ON model_metadata(deployment_status)",
            "CREATE INDEX IF NOT EXISTS idx_model_metadata_zone
                ON model_metadata(geological_zone)",
            // Performance metrics
            "CREATE TABLE IF NOT EXISTS model_performance_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_name TEXT NOT NULL,
                evaluation_date REAL NOT NULL,
                evaluation_data_range TEXT,
                num_predictions INTEGER NOT NULL,
                r2_score REAL NOT NULL,
                rmse REAL NOT NULL,
                mae REAL NOT NULL,
                mape REAL NOT NULL,
                confidence_coverage REAL NOT NULL,
                drift_detected INTEGER NOT NULL DEFAULT 0,
                drift_severity TEXT NOT NULL DEFAULT 'none',
                baseline_rmse REAL,
                rmse_increase_percent REAL NOT NULL DEFAULT 0,
                triggered_retraining INTEGER NOT NULL DEFAULT 0,
                retraining_reason TEXT,
                created_at REAL NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_performance_date
                ON model_performance_metrics(evaluation_date)",
            "CREATE INDEX IF NOT EXISTS idx_performance_drift
                ON model_performance_metrics(drift_detected)",
            // Store-and-forward buffer
            "CREATE TABLE IF NOT EXISTS sync_buffer (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_type TEXT NOT NULL,
                item_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at REAL,
                created_at REAL NOT NULL,
                metadata TEXT,
                UNIQUE(item_type, item_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_buffer_order
                ON sync_buffer(priority DESC, created_at ASC)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    // ── Ring summary access shared across components ──────────────────────

    /// Register a ring's excavation window (one row per ring, created when
    /// the window closes). No-op if the ring already exists.
    pub async fn create_ring_window(
        &self,
        ring_number: i64,
        start_time: f64,
        end_time: f64,
    ) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            "INSERT OR IGNORE INTO ring_summary
             (ring_number, start_time, end_time, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(ring_number)
        .bind(start_time)
        .bind(end_time)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one ring record, if present.
    pub async fn fetch_ring(&self, ring_number: i64) -> Result<Option<RingRecord>> {
        let ring = sqlx::query_as::<_, RingRecord>(
            "SELECT * FROM ring_summary WHERE ring_number = ?",
        )
        .bind(ring_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ring)
    }

    /// Fetch up to `limit` rings strictly before `ring_number`, in
    /// chronological (ascending) order.
    pub async fn fetch_previous_rings(
        &self,
        ring_number: i64,
        limit: i64,
    ) -> Result<Vec<RingRecord>> {
        let mut rings = sqlx::query_as::<_, RingRecord>(
            "SELECT * FROM ring_summary
             WHERE ring_number < ?
             ORDER BY ring_number DESC
             LIMIT ?",
        )
        .bind(ring_number)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rings.reverse();
        Ok(rings)
    }

    /// Flip a ring to `synced`. Called by the sync core strictly after the
    /// cloud acknowledged the record with a 2xx.
    pub async fn mark_ring_synced(&self, ring_number: i64) -> Result<()> {
        sqlx::query(
            "UPDATE ring_summary SET sync_status = 'synced', updated_at = ?
             WHERE ring_number = ?",
        )
        .bind(now_ts())
        .bind(ring_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Telemetry insertion (the contract the source drivers write to) ────

    pub async fn insert_plc_sample(
        &self,
        timestamp: f64,
        tag_name: &str,
        value: f64,
        quality_flag: &str,
        ring_number: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO plc_logs (timestamp, tag_name, value, data_quality_flag, ring_number)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(timestamp)
        .bind(tag_name)
        .bind(value)
        .bind(quality_flag)
        .bind(ring_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_attitude_sample(
        &self,
        timestamp: f64,
        pitch: Option<f64>,
        roll: Option<f64>,
        yaw: Option<f64>,
        horizontal_deviation: Option<f64>,
        vertical_deviation: Option<f64>,
        ring_number: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO attitude_logs
             (timestamp, pitch, roll, yaw, horizontal_deviation, vertical_deviation, ring_number)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(timestamp)
        .bind(pitch)
        .bind(roll)
        .bind(yaw)
        .bind(horizontal_deviation)
        .bind(vertical_deviation)
        .bind(ring_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_monitoring_sample(
        &self,
        timestamp: f64,
        sensor_type: &str,
        value: f64,
        ring_number: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO monitoring_logs (timestamp, sensor_type, value, ring_number)
             VALUES (?, ?, ?, ?)",
        )
        .bind(timestamp)
        .bind(sensor_type)
        .bind(value)
        .bind(ring_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
