//! Sync manager — orchestrates store-and-forward edge-to-cloud sync
//!
//! Owns the buffer, the three uploaders, the network and disk monitors and
//! the purger. Two cooperative loops do the work: the sync loop drains the
//! buffer in priority type order (warnings, then predictions, then rings)
//! whenever the link is up, and the purge loop reclaims disk on a long
//! period. Monitor callbacks feed a control channel: coming online triggers
//! an immediate sync cycle, low disk triggers a purge, critical disk an
//! emergency purge.

use crate::config::{DeviceConfig, SyncConfig};
use crate::error::{or_default_logged, Result};
use crate::storage::{now_ts, EdgeStore};
use crate::sync::buffer::{ItemType, SyncBuffer};
use crate::sync::disk::{DiskMonitor, DiskState};
use crate::sync::network::{NetworkMonitor, NetworkState};
use crate::sync::purger::DataPurger;
use crate::sync::uploader::{CloudUploader, UploadOutcome};
use crate::types::WarningSeverity;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Events produced by monitor callbacks and consumed by the control task.
#[derive(Debug, Clone, Copy)]
enum ControlEvent {
    NetworkOnline,
    DiskWarning,
    DiskCritical,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncManagerStats {
    pub sync_cycles: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub purge_cycles: u64,
    pub total_items_synced: u64,
}

/// Aggregate status of the sync subsystem.
#[derive(Debug, Clone)]
pub struct SyncStatusReport {
    pub running: bool,
    pub online: bool,
    pub last_sync: Option<f64>,
    pub last_purge: Option<f64>,
    pub buffer_total: i64,
    pub buffer_by_type: HashMap<String, i64>,
    pub disk_state: DiskState,
    pub stats: SyncManagerStats,
}

pub struct SyncManager {
    store: EdgeStore,
    config: SyncConfig,
    buffer: SyncBuffer,
    ring_uploader: CloudUploader,
    prediction_uploader: CloudUploader,
    warning_uploader: CloudUploader,
    network: Arc<NetworkMonitor>,
    disk: Arc<DiskMonitor>,
    purger: Arc<DataPurger>,
    token: CancellationToken,
    running: AtomicBool,
    stats: Arc<Mutex<SyncManagerStats>>,
    last_sync: Mutex<Option<f64>>,
    last_purge: Mutex<Option<f64>>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(
        store: EdgeStore,
        config: SyncConfig,
        device: DeviceConfig,
        raw_data_path: PathBuf,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let buffer = SyncBuffer::new(
            store.clone(),
            config.max_buffer_size,
            config.buffer_max_retries,
        );

        let ring_uploader = CloudUploader::ring(
            &config.cloud_endpoint,
            &config.api_key,
            &device.edge_device_id,
            device.project_id,
            config.ring_batch_size,
        );
        let prediction_uploader = CloudUploader::prediction(
            &config.cloud_endpoint,
            &config.api_key,
            &device.edge_device_id,
            device.project_id,
            config.prediction_batch_size,
        );
        let warning_uploader = CloudUploader::warning(
            &config.cloud_endpoint,
            &config.api_key,
            &device.edge_device_id,
            device.project_id,
            config.warning_batch_size,
        );

        let network_tx = control_tx.clone();
        let network = Arc::new(NetworkMonitor::new(
            &config.cloud_endpoint,
            &config.network.health_path,
            config.network.check_interval_secs,
            config.network.timeout_secs,
            Some(Arc::new(move |state| {
                if state == NetworkState::Online {
                    let _ = network_tx.send(ControlEvent::NetworkOnline);
                }
            })),
        ));

        let disk_tx = control_tx;
        let disk = Arc::new(DiskMonitor::new(
            config.disk.paths.clone(),
            config.disk.warning_threshold_gb,
            config.disk.critical_threshold_gb,
            config.disk.check_interval_secs,
            Some(Arc::new(move |state, _free_gb| {
                let event = match state {
                    DiskState::Critical => ControlEvent::DiskCritical,
                    _ => ControlEvent::DiskWarning,
                };
                let _ = disk_tx.send(event);
            })),
        ));

        let purger = Arc::new(DataPurger::new(
            store.clone(),
            raw_data_path,
            config.purge.retention_days,
            config.purge.dry_run,
        ));

        Self {
            store,
            config,
            buffer,
            ring_uploader,
            prediction_uploader,
            warning_uploader,
            network,
            disk,
            purger,
            token: CancellationToken::new(),
            running: AtomicBool::new(false),
            stats: Arc::new(Mutex::new(SyncManagerStats::default())),
            last_sync: Mutex::new(None),
            last_purge: Mutex::new(None),
            control_rx: Mutex::new(Some(control_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn buffer(&self) -> &SyncBuffer {
        &self.buffer
    }

    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    /// Start the monitors and the sync/purge loops.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Sync manager already running");
            return;
        }

        info!(
            endpoint = %self.config.cloud_endpoint,
            sync_interval_s = self.config.sync_interval_secs,
            purge_interval_s = self.config.purge_interval_secs,
            "Starting sync manager"
        );

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        {
            let network = Arc::clone(&self.network);
            let token = self.token.child_token();
            tasks.push(tokio::spawn(async move { network.run(token).await }));
        }
        {
            let disk = Arc::clone(&self.disk);
            let token = self.token.child_token();
            tasks.push(tokio::spawn(async move { disk.run(token).await }));
        }
        {
            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move { manager.sync_loop().await }));
        }
        {
            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move { manager.purge_loop().await }));
        }
        if let Some(rx) = self
            .control_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move { manager.control_loop(rx).await }));
        }
    }

    /// Cancel every loop and wait for them to finish. In-flight HTTP
    /// requests are dropped; buffer rows keep their current retry counts.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping sync manager");
        self.token.cancel();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        info!("Sync manager stopped");
    }

    async fn sync_loop(&self) {
        loop {
            let jitter = if self.config.sync_jitter_secs > 0 {
                use rand::Rng;
                rand::thread_rng().gen_range(0..self.config.sync_jitter_secs)
            } else {
                0
            };
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(self.config.sync_interval_secs + jitter)) => {}
            }
            self.run_sync_cycle().await;
        }
    }

    async fn purge_loop(&self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(self.config.purge_interval_secs)) => {}
            }
            self.run_purge().await;
        }
    }

    async fn control_loop(&self, mut rx: mpsc::UnboundedReceiver<ControlEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.token.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ControlEvent::NetworkOnline => {
                    info!("Network online, triggering immediate sync");
                    self.run_sync_cycle().await;
                }
                ControlEvent::DiskWarning => {
                    info!("Low disk space, triggering purge");
                    self.run_purge().await;
                }
                ControlEvent::DiskCritical => {
                    warn!("Critical disk space, triggering emergency purge");
                    match self
                        .purger
                        .purge_any_old_data(self.config.purge.max_age_days)
                        .await
                    {
                        Ok(report) => warn!(
                            freed_mb = format!("{:.2}", report.bytes_freed_mb()),
                            "Emergency purge freed space"
                        ),
                        Err(e) => error!(error = %e, "Emergency purge failed"),
                    }
                }
            }
        }
    }

    /// One sync cycle: warnings, then predictions, then rings. Skips
    /// silently while offline.
    pub async fn run_sync_cycle(&self) -> u64 {
        {
            let mut stats = self
                .stats
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            stats.sync_cycles += 1;
        }
        *self
            .last_sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(now_ts());

        if !self.network.is_online() {
            debug!("Offline, skipping sync cycle");
            return 0;
        }

        let warnings = self.sync_one_type(&self.warning_uploader, ItemType::Warning).await;
        let predictions = self
            .sync_one_type(&self.prediction_uploader, ItemType::Prediction)
            .await;
        let rings = self
            .sync_one_type(&self.ring_uploader, ItemType::RingSummary)
            .await;

        let total = warnings + predictions + rings;
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if total > 0 {
            stats.successful_syncs += 1;
            stats.total_items_synced += total;
            info!(
                total,
                warnings, predictions, rings, "Sync cycle complete"
            );
        } else {
            debug!("Sync cycle: nothing to sync");
        }
        total
    }

    async fn sync_one_type(&self, uploader: &CloudUploader, item_type: ItemType) -> u64 {
        let batch = or_default_logged(
            self.buffer
                .get_batch(uploader.batch_size(), Some(item_type))
                .await,
            Vec::new(),
            "buffer.get_batch",
        );
        if batch.is_empty() {
            return 0;
        }

        let payloads: Vec<serde_json::Value> =
            batch.iter().map(|entry| entry.payload.0.clone()).collect();

        match uploader.upload_batch(&payloads).await {
            Ok(UploadOutcome::Success) => {
                let mut synced = 0_u64;
                for entry in &batch {
                    if let Err(e) = self.buffer.mark_synced(entry.id).await {
                        error!(buffer_id = entry.id, error = %e, "Failed to mark entry synced");
                        continue;
                    }
                    synced += 1;

                    // the record's own sync flag flips strictly after the 2xx
                    if item_type == ItemType::RingSummary {
                        if let Err(e) = self.store.mark_ring_synced(entry.item_id).await {
                            error!(ring = entry.item_id, error = %e, "Failed to flip ring sync_status");
                        }
                    }
                }
                synced
            }
            Ok(UploadOutcome::Permanent { status, detail }) => {
                // no retry counting; queue left intact for operator action
                warn!(
                    item_type = item_type.as_str(),
                    status,
                    detail = %detail,
                    "Permanent upload rejection, leaving queue intact"
                );
                0
            }
            Ok(UploadOutcome::Transient { detail }) => {
                warn!(
                    item_type = item_type.as_str(),
                    detail = %detail,
                    "Transient upload failure, counting retry"
                );
                for entry in &batch {
                    if let Err(e) = self.buffer.mark_failed(entry.id).await {
                        error!(buffer_id = entry.id, error = %e, "Failed to mark entry failed");
                    }
                }
                0
            }
            Err(e) => {
                let mut stats = self
                    .stats
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                stats.failed_syncs += 1;
                error!(item_type = item_type.as_str(), error = %e, "Sync failed");
                0
            }
        }
    }

    /// One normal purge pass.
    pub async fn run_purge(&self) {
        {
            let mut stats = self
                .stats
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            stats.purge_cycles += 1;
        }
        *self
            .last_purge
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(now_ts());

        match self.purger.purge_old_data().await {
            Ok(report) if report.files_deleted > 0 => {
                info!(
                    deleted = report.files_deleted,
                    freed_mb = format!("{:.2}", report.bytes_freed_mb()),
                    "Purge cycle complete"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Purge cycle failed"),
        }
    }

    // ── Queue entry points ────────────────────────────────────────────────

    /// Queue a ring summary (priority 0). `ring_number` doubles as the
    /// source item id.
    pub async fn queue_ring(&self, ring_number: i64, payload: serde_json::Value) -> Result<bool> {
        self.buffer
            .add(ItemType::RingSummary, ring_number, &payload, 0, None)
            .await
    }

    /// Queue a prediction (priority 1).
    pub async fn queue_prediction(
        &self,
        prediction_id: i64,
        payload: serde_json::Value,
    ) -> Result<bool> {
        self.buffer
            .add(ItemType::Prediction, prediction_id, &payload, 1, None)
            .await
    }

    /// Queue a warning with severity-derived priority.
    pub async fn queue_warning(
        &self,
        warning_id: i64,
        payload: serde_json::Value,
        severity: WarningSeverity,
    ) -> Result<bool> {
        self.buffer
            .add(
                ItemType::Warning,
                warning_id,
                &payload,
                severity.queue_priority(),
                None,
            )
            .await
    }

    /// Aggregate status of the sync subsystem.
    pub async fn status(&self) -> Result<SyncStatusReport> {
        Ok(SyncStatusReport {
            running: self.running.load(Ordering::SeqCst),
            online: self.network.is_online(),
            last_sync: *self
                .last_sync
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            last_purge: *self
                .last_purge
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            buffer_total: self.buffer.len().await?,
            buffer_by_type: self.buffer.len_by_type().await?,
            disk_state: self.disk.state(),
            stats: *self
                .stats
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        })
    }

    /// Force one network health check (used on startup and in tests).
    pub async fn check_network_now(&self) {
        self.network.check_once().await;
    }
}
