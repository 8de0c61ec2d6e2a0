//! Offline-first photo capture and synchronization core for the facility
//! maintenance app.
//!
//! Photos and annotations are captured into a durable local SQLite store,
//! each mutation paired atomically with a sync task, and a single
//! background worker drains the queue against the remote API with bounded
//! concurrency, exponential backoff and explicit conflict handling.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use uuid::Uuid;

// Public modules
pub mod database;
pub mod domains;
pub mod errors;
pub mod types;
pub mod validation;

// Private modules
mod db_migration;

use domains::annotation::repository::SqliteAnnotationRepository;
use domains::annotation::service::{AnnotationEngine, AnnotationEngineImpl};
use domains::photo::repository::SqlitePhotoRepository;
use domains::photo::service::{CapturePipeline, CapturePipelineImpl};
use domains::photo::types::CompressionSettings;
use domains::sync::network::ConnectivityMonitor;
use domains::sync::remote::{HttpRemoteSyncApi, RemoteSyncApi};
use domains::sync::repository::{
    ConflictLogRepository, SqliteConflictLogRepository, SqliteSyncQueueRepository,
    SyncQueueRepository,
};
use domains::sync::types::{ConflictRecord, Connectivity, SyncStatusReport, SyncWorkerConfig};
use domains::sync::worker::{SyncWorker, SyncWorkerHandle};
use errors::{DomainError, ServiceError, ServiceResult};

/// Configuration for a core session.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// SQLite database path; `:memory:` opens an in-memory store.
    pub db_path: String,
    /// Base URL of the remote sync API.
    pub remote_base_url: String,
    /// Local blob quota. Oldest synced blobs are evicted when exceeded.
    pub storage_quota_bytes: u64,
    pub compression: CompressionSettings,
    pub sync: SyncWorkerConfig,
    /// Connectivity assumed until the host shell reports otherwise.
    pub start_online: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            db_path: "facility_photo_core.db".to_string(),
            remote_base_url: "http://localhost:3000/api".to_string(),
            storage_quota_bytes: 500 * 1024 * 1024,
            compression: CompressionSettings::default(),
            sync: SyncWorkerConfig::default(),
            start_online: false,
        }
    }
}

/// A running core session: services, the connectivity monitor and the
/// background sync worker.
pub struct FacilityPhotoCore {
    pool: SqlitePool,
    capture: Arc<dyn CapturePipeline>,
    annotations: Arc<dyn AnnotationEngine>,
    conflict_repo: Arc<dyn ConflictLogRepository>,
    connectivity: Arc<ConnectivityMonitor>,
    worker: SyncWorkerHandle,
    worker_join: Option<JoinHandle<()>>,
}

impl FacilityPhotoCore {
    /// Open the store, run migrations and start the sync worker against
    /// the HTTP remote.
    pub async fn initialize(config: CoreConfig) -> ServiceResult<Self> {
        let remote = Arc::new(HttpRemoteSyncApi::new(
            &config.remote_base_url,
            config.sync.request_timeout,
        ));
        Self::initialize_with_remote(config, remote).await
    }

    /// Same as [`initialize`](Self::initialize) with a caller-supplied
    /// remote (used by tests and the simulator shell).
    pub async fn initialize_with_remote(
        config: CoreConfig,
        remote: Arc<dyn RemoteSyncApi>,
    ) -> ServiceResult<Self> {
        let pool = if config.db_path == ":memory:" {
            database::DbConnection::open_in_memory().await
        } else {
            database::DbConnection::open(&config.db_path).await
        }
        .map_err(|e| ServiceError::Domain(DomainError::Database(e)))?;

        db_migration::initialize_database(&pool)
            .await
            .map_err(|e| ServiceError::Domain(DomainError::Database(e)))?;

        let photo_repo = Arc::new(SqlitePhotoRepository::new(
            pool.clone(),
            config.storage_quota_bytes,
        ));
        let annotation_repo = Arc::new(SqliteAnnotationRepository::new(pool.clone()));
        let queue_repo = Arc::new(SqliteSyncQueueRepository::new(pool.clone()));
        let conflict_repo = Arc::new(SqliteConflictLogRepository::new(pool.clone()));

        // Tasks abandoned mid-flight by a previous session rerun safely
        // under their idempotency keys.
        let recovered = queue_repo
            .recover_stale_in_flight()
            .await
            .map_err(ServiceError::Domain)?;
        if recovered > 0 {
            log::info!("Recovered {} stale in-flight sync tasks", recovered);
        }

        let connectivity = Arc::new(ConnectivityMonitor::new(if config.start_online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }));

        let worker = SyncWorker::new(
            pool.clone(),
            queue_repo.clone(),
            photo_repo.clone(),
            annotation_repo.clone(),
            conflict_repo.clone(),
            remote,
            connectivity.subscribe(),
            config.sync.clone(),
        );
        let (worker_join, handle) = worker.start();

        let capture = Arc::new(CapturePipelineImpl::new(
            pool.clone(),
            photo_repo.clone(),
            annotation_repo.clone(),
            queue_repo.clone(),
            config.compression.clone(),
            handle.clone(),
        ));
        let annotations = Arc::new(AnnotationEngineImpl::new(
            pool.clone(),
            annotation_repo,
            photo_repo,
            queue_repo,
            handle.clone(),
        ));

        Ok(Self {
            pool,
            capture,
            annotations,
            conflict_repo,
            connectivity,
            worker: handle,
            worker_join: Some(worker_join),
        })
    }

    pub fn capture(&self) -> &Arc<dyn CapturePipeline> {
        &self.capture
    }

    pub fn annotations(&self) -> &Arc<dyn AnnotationEngine> {
        &self.annotations
    }

    /// Report a connectivity transition from the host shell.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Snapshot of queue depth, connectivity and conflict counts.
    pub async fn sync_status(&self) -> Option<SyncStatusReport> {
        self.worker.status().await
    }

    /// Drain the queue immediately; returns the number of jobs started.
    pub async fn sync_now(&self) -> Option<usize> {
        self.worker.process_now().await
    }

    /// Conflicts awaiting manual review. Never pruned automatically.
    pub async fn conflicts(&self) -> ServiceResult<Vec<ConflictRecord>> {
        self.conflict_repo
            .list_unreviewed()
            .await
            .map_err(ServiceError::Domain)
    }

    pub async fn mark_conflict_reviewed(&self, conflict_id: Uuid) -> ServiceResult<()> {
        self.conflict_repo
            .mark_reviewed(conflict_id)
            .await
            .map_err(ServiceError::Domain)
    }

    /// Stop the worker and close the store.
    pub async fn shutdown(mut self) {
        self.worker.shutdown().await;
        if let Some(join) = self.worker_join.take() {
            let _ = join.await;
        }
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::annotation::types::{AnnotationGeometry, AnnotationKind};
    use crate::domains::photo::types::CaptureMetadata;
    use crate::domains::sync::types::SyncTaskStatus;
    use crate::errors::{SyncError, ValidationError};
    use crate::types::RecordStatus;
    use image::ImageOutputFormat;
    use sqlx::Row;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Remote that counts calls and always succeeds.
    #[derive(Default)]
    struct CountingRemote {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RemoteSyncApi for CountingRemote {
        async fn create_photo(
            &self,
            photo: &domains::photo::types::CapturedPhoto,
            _blob: &[u8],
        ) -> Result<String, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("remote-{}", photo.id))
        }

        async fn create_annotation(
            &self,
            annotation: &domains::annotation::types::Annotation,
            _photo_remote_id: &str,
        ) -> Result<String, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("remote-ann-{}", annotation.id))
        }

        async fn delete_photo(&self, _remote_id: &str, _key: Uuid) -> Result<(), SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_annotation(&self, _remote_id: &str, _key: Uuid) -> Result<(), SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::DynamicImage::new_rgb8(32, 32);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageOutputFormat::Png).unwrap();
        out.into_inner()
    }

    fn offline_config() -> CoreConfig {
        CoreConfig {
            db_path: ":memory:".to_string(),
            start_online: false,
            ..CoreConfig::default()
        }
    }

    async fn offline_core(remote: Arc<CountingRemote>) -> FacilityPhotoCore {
        FacilityPhotoCore::initialize_with_remote(offline_config(), remote)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn capture_pairs_photo_with_create_task() {
        let remote = Arc::new(CountingRemote::default());
        let core = offline_core(remote.clone()).await;

        let photo = core
            .capture()
            .capture(png_bytes(), CaptureMetadata::default())
            .await
            .unwrap();
        assert_eq!(photo.status, RecordStatus::PendingUpload);

        let row = sqlx::query("SELECT status FROM sync_tasks WHERE entity_id = ?")
            .bind(photo.id.to_string())
            .fetch_one(&core.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("status"), SyncTaskStatus::Pending.as_str());

        // Offline: nothing has reached the remote.
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn delete_before_upload_cancels_without_network() {
        let remote = Arc::new(CountingRemote::default());
        let core = offline_core(remote.clone()).await;

        let photo = core
            .capture()
            .capture(png_bytes(), CaptureMetadata::default())
            .await
            .unwrap();
        let annotation = core
            .annotations()
            .add_annotation(
                photo.id,
                AnnotationGeometry {
                    kind: AnnotationKind::Text,
                    anchor_x: 5.0,
                    anchor_y: 5.0,
                    properties: None,
                },
                Some("leaking".to_string()),
            )
            .await
            .unwrap();

        core.capture().delete_photo(photo.id).await.unwrap();

        // Photo, annotation and every task are gone; nothing was sent.
        assert!(core.capture().get_photo(photo.id).await.is_err());
        assert!(core.annotations().get_annotation(annotation.id).await.is_err());

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_tasks")
            .fetch_one(&core.pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn annotating_a_failed_photo_is_refused() {
        let remote = Arc::new(CountingRemote::default());
        let core = offline_core(remote).await;

        let photo = core
            .capture()
            .capture(png_bytes(), CaptureMetadata::default())
            .await
            .unwrap();

        sqlx::query("UPDATE photos SET status = 'failed' WHERE id = ?")
            .bind(photo.id.to_string())
            .execute(&core.pool)
            .await
            .unwrap();

        let result = core
            .annotations()
            .add_annotation(
                photo.id,
                AnnotationGeometry {
                    kind: AnnotationKind::Shape,
                    anchor_x: 1.0,
                    anchor_y: 1.0,
                    properties: None,
                },
                None,
            )
            .await;
        assert!(matches!(
            result,
            Err(ServiceError::Domain(DomainError::Validation(
                ValidationError::Relationship(_)
            )))
        ));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn quota_exhaustion_refuses_capture() {
        let remote = Arc::new(CountingRemote::default());
        let config = CoreConfig {
            db_path: ":memory:".to_string(),
            storage_quota_bytes: 16,
            start_online: false,
            ..CoreConfig::default()
        };
        let core = FacilityPhotoCore::initialize_with_remote(config, remote)
            .await
            .unwrap();

        let result = core
            .capture()
            .capture(png_bytes(), CaptureMetadata::default())
            .await;
        assert!(matches!(
            result,
            Err(ServiceError::Domain(DomainError::StorageQuotaExceeded { .. }))
        ));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn unsupported_content_fails_validation() {
        let remote = Arc::new(CountingRemote::default());
        let core = offline_core(remote).await;

        let result = core
            .capture()
            .capture(b"PK\x03\x04 not a picture".to_vec(), CaptureMetadata::default())
            .await;
        assert!(matches!(
            result,
            Err(ServiceError::Domain(DomainError::Validation(
                ValidationError::UnsupportedImageType(_)
            )))
        ));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn offline_capture_reaches_synced_after_reconnect() {
        let remote = Arc::new(CountingRemote::default());
        let config = CoreConfig {
            db_path: ":memory:".to_string(),
            start_online: false,
            sync: SyncWorkerConfig {
                poll_interval: std::time::Duration::from_millis(25),
                base_retry_delay: std::time::Duration::from_millis(10),
                ..SyncWorkerConfig::default()
            },
            ..CoreConfig::default()
        };
        let core = FacilityPhotoCore::initialize_with_remote(config, remote.clone())
            .await
            .unwrap();

        let photo = core
            .capture()
            .capture(png_bytes(), CaptureMetadata::default())
            .await
            .unwrap();

        core.set_online(true);

        let mut synced = false;
        for _ in 0..200 {
            let current = core.capture().get_photo(photo.id).await.unwrap();
            if current.status == RecordStatus::Synced {
                assert_eq!(current.remote_id, Some(format!("remote-{}", photo.id)));
                synced = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(synced, "photo never reached synced");
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);

        let status = core.sync_status().await.unwrap();
        assert!(status.last_successful_sync_at.is_some());
        assert_eq!(status.pending_tasks, 0);

        core.shutdown().await;
    }
}
