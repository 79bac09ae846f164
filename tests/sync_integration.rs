//! Sync core integration tests
//!
//! Exercise the store-and-forward pipeline against a local mock cloud:
//! offline buffering, drain-on-reconnect, the upload response contract and
//! the ring sync_status flip.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use shield_edge::config::{DeviceConfig, SyncConfig};
use shield_edge::storage::EdgeStore;
use shield_edge::sync::SyncManager;
use shield_edge::types::SyncStatus;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counters shared with the mock cloud handlers.
#[derive(Default)]
struct CloudState {
    ring_batches: AtomicUsize,
    rings_received: AtomicUsize,
    prediction_batches: AtomicUsize,
    warning_batches: AtomicUsize,
    /// status code POST handlers answer with
    post_status: AtomicUsize,
}

async fn spawn_mock_cloud(post_status: u16) -> (SocketAddr, Arc<CloudState>) {
    let state = Arc::new(CloudState {
        post_status: AtomicUsize::new(post_status as usize),
        ..CloudState::default()
    });

    async fn rings(
        State(state): State<Arc<CloudState>>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        let status = state.post_status.load(Ordering::SeqCst) as u16;
        if status < 300 {
            state.ring_batches.fetch_add(1, Ordering::SeqCst);
            let count = body["rings"].as_array().map(|a| a.len()).unwrap_or(0);
            state.rings_received.fetch_add(count, Ordering::SeqCst);
        }
        StatusCode::from_u16(status).unwrap()
    }

    async fn predictions(State(state): State<Arc<CloudState>>) -> StatusCode {
        let status = state.post_status.load(Ordering::SeqCst) as u16;
        if status < 300 {
            state.prediction_batches.fetch_add(1, Ordering::SeqCst);
        }
        StatusCode::from_u16(status).unwrap()
    }

    async fn warnings(State(state): State<Arc<CloudState>>) -> StatusCode {
        let status = state.post_status.load(Ordering::SeqCst) as u16;
        if status < 300 {
            state.warning_batches.fetch_add(1, Ordering::SeqCst);
        }
        StatusCode::from_u16(status).unwrap()
    }

    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/api/ring-summaries", post(rings))
        .route("/api/predictions", post(predictions))
        .route("/api/warning-events", post(warnings))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

async fn make_manager(endpoint: String) -> (tempfile::TempDir, EdgeStore, Arc<SyncManager>) {
    let dir = tempfile::tempdir().unwrap();
    let store = EdgeStore::open(&dir.path().join("sync.db")).await.unwrap();

    let config = SyncConfig {
        cloud_endpoint: endpoint,
        api_key: "test-key".to_string(),
        ring_batch_size: 50,
        ..SyncConfig::default()
    };
    let manager = Arc::new(SyncManager::new(
        store.clone(),
        config,
        DeviceConfig::default(),
        dir.path().join("raw"),
    ));
    (dir, store, manager)
}

/// Offline resilience: items buffer while offline, drain after reconnect,
/// and each ring's sync_status flips only after the cloud 2xx.
#[tokio::test]
async fn test_offline_buffering_then_drain() {
    let (addr, cloud) = spawn_mock_cloud(201).await;
    let (_dir, store, manager) = make_manager(format!("http://{addr}")).await;

    for ring in 1..=200_i64 {
        store
            .create_ring_window(ring, ring as f64 * 1000.0, ring as f64 * 1000.0 + 900.0)
            .await
            .unwrap();
        assert!(manager
            .queue_ring(ring, json!({"ring_number": ring}))
            .await
            .unwrap());
    }

    // monitor starts offline: cycles do nothing, buffer holds everything
    assert_eq!(manager.run_sync_cycle().await, 0);
    assert_eq!(manager.buffer().len().await.unwrap(), 200);
    assert_eq!(cloud.rings_received.load(Ordering::SeqCst), 0);

    // one successful health check brings us online
    manager.check_network_now().await;
    assert!(manager.is_online());

    // batch size 50: four cycles drain the queue
    let mut total = 0;
    for _ in 0..6 {
        total += manager.run_sync_cycle().await;
        if manager.buffer().len().await.unwrap() == 0 {
            break;
        }
    }

    assert_eq!(total, 200);
    assert_eq!(manager.buffer().len().await.unwrap(), 0);
    assert_eq!(cloud.rings_received.load(Ordering::SeqCst), 200);
    assert_eq!(cloud.ring_batches.load(Ordering::SeqCst), 4);

    for ring in [1_i64, 100, 200] {
        let record = store.fetch_ring(ring).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
    }
}

/// Sync cycles process warnings before predictions before rings.
#[tokio::test]
async fn test_type_order_within_cycle() {
    let (addr, cloud) = spawn_mock_cloud(200).await;
    let (_dir, store, manager) = make_manager(format!("http://{addr}")).await;

    store.create_ring_window(1, 0.0, 10.0).await.unwrap();
    manager.queue_ring(1, json!({"ring_number": 1})).await.unwrap();
    manager
        .queue_prediction(11, json!({"ring_number": 1, "predicted_settlement": 5.0}))
        .await
        .unwrap();
    manager
        .queue_warning(
            21,
            json!({"ring_number": 1, "severity": "critical"}),
            shield_edge::types::WarningSeverity::Critical,
        )
        .await
        .unwrap();

    manager.check_network_now().await;
    let synced = manager.run_sync_cycle().await;

    assert_eq!(synced, 3);
    assert_eq!(cloud.warning_batches.load(Ordering::SeqCst), 1);
    assert_eq!(cloud.prediction_batches.load(Ordering::SeqCst), 1);
    assert_eq!(cloud.ring_batches.load(Ordering::SeqCst), 1);
}

/// 401 is permanent: no retry counting, queue left intact for the operator.
#[tokio::test]
async fn test_auth_failure_leaves_queue_intact() {
    let (addr, _cloud) = spawn_mock_cloud(401).await;
    let (_dir, store, manager) = make_manager(format!("http://{addr}")).await;

    store.create_ring_window(1, 0.0, 10.0).await.unwrap();
    manager.queue_ring(1, json!({"ring_number": 1})).await.unwrap();

    manager.check_network_now().await;
    assert_eq!(manager.run_sync_cycle().await, 0);

    // still queued, retry count untouched
    let batch = manager.buffer().get_batch(10, None).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].retry_count, 0);

    let record = store.fetch_ring(1).await.unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::Pending);
}

/// Server errors are transient: the batch stays queued with one more retry
/// recorded against each row.
#[tokio::test]
async fn test_server_error_counts_retry() {
    let (addr, cloud) = spawn_mock_cloud(500).await;
    let (_dir, store, manager) = make_manager(format!("http://{addr}")).await;

    store.create_ring_window(1, 0.0, 10.0).await.unwrap();
    manager.queue_ring(1, json!({"ring_number": 1})).await.unwrap();

    manager.check_network_now().await;
    assert_eq!(manager.run_sync_cycle().await, 0);

    let batch = manager.buffer().get_batch(10, None).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].retry_count, 1);

    // server recovers; the row is still deliverable
    cloud.post_status.store(200, Ordering::SeqCst);
    assert_eq!(manager.run_sync_cycle().await, 1);
    assert_eq!(manager.buffer().len().await.unwrap(), 0);
}

/// Start/stop lifecycle: loops come up, observe the stop signal and exit.
#[tokio::test]
async fn test_start_and_stop() {
    let (addr, _cloud) = spawn_mock_cloud(200).await;
    let (_dir, _store, manager) = make_manager(format!("http://{addr}")).await;

    manager.start();
    let status = manager.status().await.unwrap();
    assert!(status.running);

    manager.stop().await;
    let status = manager.status().await.unwrap();
    assert!(!status.running);
}
