//! Cloud uploaders — per-type batched HTTP POST with retry and backoff
//!
//! Ring summaries, predictions and warnings each get their own endpoint,
//! batch size and retry posture. Warnings use smaller batches, a longer
//! timeout, more retries and a gentler backoff so urgent events get through
//! first; within a warning batch, critical events are sorted to the front.

use crate::error::Result;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// What kind of records an uploader carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Ring,
    Prediction,
    Warning,
}

impl UploadKind {
    fn path(&self) -> &'static str {
        match self {
            UploadKind::Ring => "/api/ring-summaries",
            UploadKind::Prediction => "/api/predictions",
            UploadKind::Warning => "/api/warning-events",
        }
    }

    fn items_key(&self) -> &'static str {
        match self {
            UploadKind::Ring => "rings",
            UploadKind::Prediction => "predictions",
            UploadKind::Warning => "warnings",
        }
    }
}

/// Result of one batch upload.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    /// 2xx — mark the batch synced.
    Success,
    /// 400/401/403 — stop retrying; the queue is left intact for operator
    /// action (or permanent rejection triage).
    Permanent { status: u16, detail: String },
    /// Retries exhausted on server errors or connection failures — count a
    /// failed attempt against each queued row.
    Transient { detail: String },
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Success)
    }
}

/// Upload counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadStats {
    pub total_uploads: u64,
    pub successful_uploads: u64,
    pub failed_uploads: u64,
    pub items_uploaded: u64,
    pub critical_warnings_uploaded: u64,
}

/// Batched uploader for one record type.
#[derive(Clone)]
pub struct CloudUploader {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    edge_device_id: String,
    project_id: i64,
    kind: UploadKind,
    batch_size: usize,
    max_retries: u32,
    backoff_base: f64,
    stats: Arc<Mutex<UploadStats>>,
}

impl CloudUploader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: &str,
        api_key: &str,
        edge_device_id: &str,
        project_id: i64,
        kind: UploadKind,
        batch_size: usize,
        timeout_secs: f64,
        max_retries: u32,
        backoff_base: f64,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(timeout_secs))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            edge_device_id: edge_device_id.to_string(),
            project_id,
            kind,
            batch_size,
            max_retries,
            backoff_base,
            stats: Arc::new(Mutex::new(UploadStats::default())),
        }
    }

    /// Ring summary uploader: batch 50, timeout 30 s, 3 retries, 2^n backoff.
    pub fn ring(
        endpoint: &str,
        api_key: &str,
        edge_device_id: &str,
        project_id: i64,
        batch_size: usize,
    ) -> Self {
        Self::new(
            endpoint,
            api_key,
            edge_device_id,
            project_id,
            UploadKind::Ring,
            batch_size,
            30.0,
            3,
            2.0,
        )
    }

    /// Prediction uploader: batch 100, same retry posture as rings.
    pub fn prediction(
        endpoint: &str,
        api_key: &str,
        edge_device_id: &str,
        project_id: i64,
        batch_size: usize,
    ) -> Self {
        Self::new(
            endpoint,
            api_key,
            edge_device_id,
            project_id,
            UploadKind::Prediction,
            batch_size,
            30.0,
            3,
            2.0,
        )
    }

    /// Warning uploader: batch 20, timeout 45 s, 5 retries, 1.5^n backoff.
    pub fn warning(
        endpoint: &str,
        api_key: &str,
        edge_device_id: &str,
        project_id: i64,
        batch_size: usize,
    ) -> Self {
        Self::new(
            endpoint,
            api_key,
            edge_device_id,
            project_id,
            UploadKind::Warning,
            batch_size,
            45.0,
            5,
            1.5,
        )
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn kind(&self) -> UploadKind {
        self.kind
    }

    /// Upload one batch. Callers hand in at most `batch_size` items (the
    /// buffer's get_batch already limits this).
    pub async fn upload_batch(&self, items: &[serde_json::Value]) -> Result<UploadOutcome> {
        if items.is_empty() {
            return Ok(UploadOutcome::Success);
        }

        let mut batch: Vec<serde_json::Value> = items.to_vec();
        if self.kind == UploadKind::Warning {
            batch.sort_by_key(severity_rank);
        }

        self.with_stats(|s| s.total_uploads += 1);

        let url = format!("{}{}", self.endpoint, self.kind.path());
        let mut payload = json!({
            "edge_device_id": self.edge_device_id,
            "project_id": self.project_id,
        });
        payload[self.kind.items_key()] = serde_json::Value::Array(batch.clone());

        for attempt in 0..self.max_retries {
            let response = self
                .http
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&payload)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    match status.as_u16() {
                        200 | 201 => {
                            self.note_success(&batch, attempt);
                            return Ok(UploadOutcome::Success);
                        }
                        400 => {
                            let detail = resp.text().await.unwrap_or_default();
                            error!(
                                kind = ?self.kind,
                                detail = %detail,
                                "Upload rejected by server"
                            );
                            self.with_stats(|s| s.failed_uploads += 1);
                            return Ok(UploadOutcome::Permanent { status: 400, detail });
                        }
                        401 | 403 => {
                            error!(
                                kind = ?self.kind,
                                status = status.as_u16(),
                                "Authentication failed, check API key"
                            );
                            self.with_stats(|s| s.failed_uploads += 1);
                            return Ok(UploadOutcome::Permanent {
                                status: status.as_u16(),
                                detail: "authentication failed".to_string(),
                            });
                        }
                        other => {
                            let detail = resp.text().await.unwrap_or_default();
                            warn!(
                                kind = ?self.kind,
                                status = other,
                                attempt = attempt + 1,
                                max = self.max_retries,
                                "Upload failed, will retry"
                            );
                            if attempt + 1 < self.max_retries {
                                self.backoff(attempt).await;
                            } else {
                                self.with_stats(|s| s.failed_uploads += 1);
                                return Ok(UploadOutcome::Transient {
                                    detail: format!("HTTP {other}: {detail}"),
                                });
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        kind = ?self.kind,
                        error = %e,
                        attempt = attempt + 1,
                        max = self.max_retries,
                        "Upload connection error"
                    );
                    if attempt + 1 < self.max_retries {
                        self.backoff(attempt).await;
                    } else {
                        self.with_stats(|s| s.failed_uploads += 1);
                        return Ok(UploadOutcome::Transient {
                            detail: e.to_string(),
                        });
                    }
                }
            }
        }

        self.with_stats(|s| s.failed_uploads += 1);
        Ok(UploadOutcome::Transient {
            detail: "max retries reached".to_string(),
        })
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.backoff_base.powi(attempt as i32);
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
    }

    fn note_success(&self, batch: &[serde_json::Value], attempt: u32) {
        let critical = if self.kind == UploadKind::Warning {
            batch
                .iter()
                .filter(|w| w.get("severity").and_then(|s| s.as_str()) == Some("critical"))
                .count() as u64
        } else {
            0
        };

        self.with_stats(|s| {
            s.successful_uploads += 1;
            s.items_uploaded += batch.len() as u64;
            s.critical_warnings_uploaded += critical;
        });

        info!(
            kind = ?self.kind,
            items = batch.len(),
            critical,
            attempt = attempt + 1,
            "Batch uploaded"
        );
    }

    pub fn stats(&self) -> UploadStats {
        *self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_stats(&self, f: impl FnOnce(&mut UploadStats)) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut stats);
    }
}

/// Sort key for warning payloads: critical < high < medium < everything else.
fn severity_rank(warning: &serde_json::Value) -> u8 {
    match warning.get("severity").and_then(|s| s.as_str()) {
        Some("critical") => 0,
        Some("high") => 1,
        Some("medium") => 2,
        _ => 3,
    }
}
