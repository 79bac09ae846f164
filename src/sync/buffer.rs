//! Store-and-forward buffer — durable priority queue for cloud upload
//!
//! Backed by the sync_buffer table so queued items survive restarts and
//! network partitions. `(item_type, item_id)` is unique; duplicate enqueues
//! are a no-op. Delivery order within a type is `priority DESC, created_at
//! ASC`; when the buffer is full, the lowest-priority oldest items are
//! dropped first.

use crate::error::Result;
use crate::storage::{now_ts, EdgeStore};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Kind of item queued for upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ItemType {
    RingSummary,
    Prediction,
    Warning,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::RingSummary => "ring_summary",
            ItemType::Prediction => "prediction",
            ItemType::Warning => "warning",
        }
    }
}

/// One queued upload item.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BufferEntry {
    pub id: i64,
    pub item_type: ItemType,
    /// Id of the item in its source table (ring_number for rings)
    pub item_id: i64,
    pub payload: Json<serde_json::Value>,
    pub priority: i64,
    pub retry_count: i64,
    pub last_attempt_at: Option<f64>,
    pub created_at: f64,
    pub metadata: Option<Json<serde_json::Value>>,
}

/// Lifetime counters for the buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferStats {
    pub items_added: u64,
    pub items_removed: u64,
    pub items_dropped: u64,
    pub sync_attempts: u64,
    pub sync_successes: u64,
    pub sync_failures: u64,
}

/// Durable priority queue over the sync_buffer table.
#[derive(Clone)]
pub struct SyncBuffer {
    store: EdgeStore,
    max_size: i64,
    max_retries: i64,
    stats: Arc<Mutex<BufferStats>>,
}

impl SyncBuffer {
    pub fn new(store: EdgeStore, max_size: i64, max_retries: i64) -> Self {
        Self {
            store,
            max_size,
            max_retries,
            stats: Arc::new(Mutex::new(BufferStats::default())),
        }
    }

    pub fn max_retries(&self) -> i64 {
        self.max_retries
    }

    /// Enqueue an item. Returns false when `(item_type, item_id)` is
    /// already queued. Enforces `max_size` by evicting the lowest-priority
    /// oldest rows after insertion.
    pub async fn add(
        &self,
        item_type: ItemType,
        item_id: i64,
        payload: &serde_json::Value,
        priority: i64,
        metadata: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO sync_buffer
             (item_type, item_id, payload, priority, created_at, metadata)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(item_type)
        .bind(item_id)
        .bind(payload.to_string())
        .bind(priority)
        .bind(now_ts())
        .bind(metadata.map(|m| m.to_string()))
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                item_type = item_type.as_str(),
                item_id, "Item already buffered, skipping"
            );
            return Ok(false);
        }

        self.with_stats(|s| s.items_added += 1);
        debug!(
            item_type = item_type.as_str(),
            item_id, priority, "Item buffered for upload"
        );

        self.enforce_limit().await?;
        Ok(true)
    }

    /// Drop overflow rows: lowest priority first, oldest first within a
    /// priority.
    async fn enforce_limit(&self) -> Result<()> {
        let count = self.len().await?;
        if count <= self.max_size {
            return Ok(());
        }

        let overflow = count - self.max_size;
        let result = sqlx::query(
            "DELETE FROM sync_buffer WHERE id IN (
                SELECT id FROM sync_buffer
                ORDER BY priority ASC, created_at ASC, id ASC
                LIMIT ?
            )",
        )
        .bind(overflow)
        .execute(self.store.pool())
        .await?;

        let dropped = result.rows_affected();
        self.with_stats(|s| s.items_dropped += dropped);
        warn!(dropped, max = self.max_size, "Buffer full, dropped lowest-priority items");
        Ok(())
    }

    /// Next batch for upload: rows below the retry ceiling, highest
    /// priority first, oldest first within a priority.
    pub async fn get_batch(
        &self,
        batch_size: usize,
        item_type: Option<ItemType>,
    ) -> Result<Vec<BufferEntry>> {
        let rows = match item_type {
            Some(kind) => {
                sqlx::query_as(
                    "SELECT * FROM sync_buffer
                     WHERE item_type = ? AND retry_count < ?
                     ORDER BY priority DESC, created_at ASC, id ASC
                     LIMIT ?",
                )
                .bind(kind)
                .bind(self.max_retries)
                .bind(batch_size as i64)
                .fetch_all(self.store.pool())
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM sync_buffer
                     WHERE retry_count < ?
                     ORDER BY priority DESC, created_at ASC, id ASC
                     LIMIT ?",
                )
                .bind(self.max_retries)
                .bind(batch_size as i64)
                .fetch_all(self.store.pool())
                .await?
            }
        };
        Ok(rows)
    }

    /// Remove a successfully uploaded row.
    pub async fn mark_synced(&self, buffer_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM sync_buffer WHERE id = ?")
            .bind(buffer_id)
            .execute(self.store.pool())
            .await?;

        self.with_stats(|s| {
            s.items_removed += 1;
            s.sync_successes += 1;
        });
        Ok(())
    }

    /// Record a failed upload attempt. Rows that reach the retry ceiling
    /// are garbage-collected and counted as sync failures.
    pub async fn mark_failed(&self, buffer_id: i64) -> Result<()> {
        let retry_count: Option<i64> = sqlx::query_scalar(
            "UPDATE sync_buffer
             SET retry_count = retry_count + 1, last_attempt_at = ?
             WHERE id = ?
             RETURNING retry_count",
        )
        .bind(now_ts())
        .bind(buffer_id)
        .fetch_optional(self.store.pool())
        .await?;

        self.with_stats(|s| s.sync_attempts += 1);

        if let Some(retries) = retry_count {
            if retries >= self.max_retries {
                sqlx::query("DELETE FROM sync_buffer WHERE id = ?")
                    .bind(buffer_id)
                    .execute(self.store.pool())
                    .await?;
                self.with_stats(|s| s.sync_failures += 1);
                warn!(
                    buffer_id,
                    retries, "Buffer item removed after exhausting retries"
                );
            }
        }
        Ok(())
    }

    pub async fn len(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_buffer")
            .fetch_one(self.store.pool())
            .await?;
        Ok(count)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn len_by_type(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT item_type, COUNT(*) FROM sync_buffer GROUP BY item_type",
        )
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Remove everything (or everything of one type). Returns rows removed.
    pub async fn clear(&self, item_type: Option<ItemType>) -> Result<u64> {
        let result = match item_type {
            Some(kind) => {
                sqlx::query("DELETE FROM sync_buffer WHERE item_type = ?")
                    .bind(kind)
                    .execute(self.store.pool())
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM sync_buffer")
                    .execute(self.store.pool())
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    pub fn stats(&self) -> BufferStats {
        *self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn reset_stats(&self) {
        self.with_stats(|s| *s = BufferStats::default());
    }

    fn with_stats(&self, f: impl FnOnce(&mut BufferStats)) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut stats);
    }
}
