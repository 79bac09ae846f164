//! Sync core — durable store-and-forward edge-to-cloud synchronization
//!
//! ## Architecture
//! - `buffer`: SQLite-backed priority queue surviving restarts and partitions
//! - `uploader`: per-type batched HTTP POST with retry/backoff postures
//! - `network`: online/offline state machine over periodic health checks
//! - `disk`: normal/warning/critical free-space state machine
//! - `purger`: retention-driven deletion of synced raw sample files
//! - `manager`: the sync and purge loops plus monitor-driven triggers

pub mod buffer;
pub mod disk;
pub mod manager;
pub mod network;
pub mod purger;
pub mod uploader;

pub use buffer::{BufferEntry, BufferStats, ItemType, SyncBuffer};
pub use disk::{DiskMonitor, DiskState};
pub use manager::{SyncManager, SyncManagerStats, SyncStatusReport};
pub use network::{NetworkMonitor, NetworkState};
pub use purger::{DataPurger, PurgeReport};
pub use uploader::{CloudUploader, UploadKind, UploadOutcome, UploadStats};
