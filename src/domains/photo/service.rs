use crate::domains::annotation::repository::AnnotationRepository;
use crate::domains::photo::repository::PhotoRepository;
use crate::domains::photo::types::{
    CaptureEvent, CaptureMetadata, CaptureSource, CaptureSourceError, CapturedPhoto,
    CompressionSettings,
};
use crate::domains::sync::repository::SyncQueueRepository;
use crate::domains::sync::types::{EntityKind, SyncOperation, SyncTask};
use crate::domains::sync::worker::SyncWorkerHandle;
use crate::errors::{DbError, DomainError, DomainResult, ServiceError, ServiceResult, ValidationError};
use crate::types::{RecordStatus, StorageUsage};
use crate::validation::Validate;
use async_trait::async_trait;
use chrono::Utc;
use image::imageops::FilterType;
use image::ImageOutputFormat;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

const MIN_RECOMPRESS_DIMENSION: u32 = 320;

/// Turns a raw image acquisition into a persisted, locally addressable
/// record, paired atomically with its create sync task.
#[async_trait]
pub trait CapturePipeline: Send + Sync {
    /// Validate, compress and persist a capture. Returns the record
    /// synchronously; all network activity is deferred to the sync worker.
    async fn capture(&self, raw: Vec<u8>, meta: CaptureMetadata) -> ServiceResult<CapturedPhoto>;

    /// Acquire from a camera or file picker, then capture. Acquisition
    /// failures surface immediately and are not retried.
    async fn capture_from_source(
        &self,
        source: &dyn CaptureSource,
        meta: CaptureMetadata,
    ) -> ServiceResult<CapturedPhoto>;

    /// Remove a photo. A never-uploaded photo is cancelled and discarded
    /// locally without any network call; a synced photo (and its synced
    /// annotations) get remote delete tasks that jump the queue.
    async fn delete_photo(&self, id: Uuid) -> ServiceResult<()>;

    /// Manual retry of a terminally failed photo: its task re-enters
    /// `pending` with a reset attempt counter, along with any of its
    /// annotations that failed alongside it.
    async fn retry_photo(&self, id: Uuid) -> ServiceResult<()>;

    async fn get_photo(&self, id: Uuid) -> ServiceResult<CapturedPhoto>;

    async fn photo_blob(&self, id: Uuid) -> ServiceResult<Option<Vec<u8>>>;

    async fn list_photos(&self, status: Option<RecordStatus>)
        -> ServiceResult<Vec<CapturedPhoto>>;

    /// Photos still waiting to reach the remote store.
    async fn pending_photos(&self) -> ServiceResult<Vec<CapturedPhoto>>;

    async fn storage_usage(&self) -> ServiceResult<StorageUsage>;

    /// Capture lifecycle events for the UI layer.
    fn subscribe_events(&self) -> broadcast::Receiver<CaptureEvent>;
}

pub struct CapturePipelineImpl {
    pool: SqlitePool,
    photo_repo: Arc<dyn PhotoRepository>,
    annotation_repo: Arc<dyn AnnotationRepository>,
    queue_repo: Arc<dyn SyncQueueRepository>,
    compression: CompressionSettings,
    events: broadcast::Sender<CaptureEvent>,
    worker: SyncWorkerHandle,
}

impl CapturePipelineImpl {
    pub fn new(
        pool: SqlitePool,
        photo_repo: Arc<dyn PhotoRepository>,
        annotation_repo: Arc<dyn AnnotationRepository>,
        queue_repo: Arc<dyn SyncQueueRepository>,
        compression: CompressionSettings,
        worker: SyncWorkerHandle,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            pool,
            photo_repo,
            annotation_repo,
            queue_repo,
            compression,
            events,
            worker,
        }
    }

    /// Make room for `needed` bytes, evicting oldest synced blobs first.
    async fn ensure_quota(&self, needed: u64) -> ServiceResult<()> {
        let usage = self.photo_repo.storage_usage().await.map_err(ServiceError::Domain)?;
        if usage.available_bytes() >= needed {
            return Ok(());
        }

        self.photo_repo
            .evict_synced_for(needed)
            .await
            .map_err(ServiceError::Domain)?;

        let usage = self.photo_repo.storage_usage().await.map_err(ServiceError::Domain)?;
        if usage.available_bytes() < needed {
            return Err(ServiceError::Domain(DomainError::StorageQuotaExceeded {
                needed_bytes: needed,
                available_bytes: usage.available_bytes(),
            }));
        }

        Ok(())
    }
}

/// Validate the sniffed content type and compress the image under the byte
/// ceiling. Pure CPU work; runs on the blocking pool.
fn compress_for_storage(
    raw: &[u8],
    settings: &CompressionSettings,
) -> DomainResult<(Vec<u8>, String)> {
    let kind = infer::get(raw).ok_or_else(|| {
        DomainError::Validation(ValidationError::UnsupportedImageType(
            "unrecognized content".to_string(),
        ))
    })?;

    if !kind.mime_type().starts_with("image/") {
        return Err(DomainError::Validation(
            ValidationError::UnsupportedImageType(kind.mime_type().to_string()),
        ));
    }

    // Small JPEGs pass through untouched.
    if kind.mime_type() == mime::IMAGE_JPEG.as_ref() && raw.len() <= settings.max_bytes {
        return Ok((raw.to_vec(), kind.mime_type().to_string()));
    }

    let decoded = image::load_from_memory(raw)
        .map_err(|e| DomainError::Image(format!("failed to decode image: {}", e)))?;

    let mut current = if decoded.width() > settings.max_dimension
        || decoded.height() > settings.max_dimension
    {
        decoded.resize(
            settings.max_dimension,
            settings.max_dimension,
            FilterType::Lanczos3,
        )
    } else {
        decoded
    };

    // Walk quality steps, halving dimensions when quality alone is not
    // enough. The smallest produced encoding is kept as a fallback.
    let mut best: Option<Vec<u8>> = None;
    loop {
        for quality in &settings.quality_steps {
            let mut out = Cursor::new(Vec::new());
            current
                .write_to(&mut out, ImageOutputFormat::Jpeg(*quality))
                .map_err(|e| DomainError::Image(format!("failed to encode JPEG: {}", e)))?;
            let bytes = out.into_inner();

            if bytes.len() <= settings.max_bytes {
                return Ok((bytes, mime::IMAGE_JPEG.to_string()));
            }
            if best.as_ref().map_or(true, |b| bytes.len() < b.len()) {
                best = Some(bytes);
            }
        }

        let next_dim = (current.width().max(current.height())) / 2;
        if next_dim < MIN_RECOMPRESS_DIMENSION {
            break;
        }
        current = current.resize(next_dim, next_dim, FilterType::Lanczos3);
    }

    let bytes = best.ok_or_else(|| DomainError::Image("no encoding produced".to_string()))?;
    log::warn!(
        "Image could not be compressed under {} bytes; storing {} bytes",
        settings.max_bytes,
        bytes.len()
    );
    Ok((bytes, mime::IMAGE_JPEG.to_string()))
}

#[async_trait]
impl CapturePipeline for CapturePipelineImpl {
    async fn capture(&self, raw: Vec<u8>, meta: CaptureMetadata) -> ServiceResult<CapturedPhoto> {
        meta.validate().map_err(ServiceError::Domain)?;

        let settings = self.compression.clone();
        let (blob, mime_type) = tokio::task::spawn_blocking(move || {
            compress_for_storage(&raw, &settings)
        })
        .await
        .map_err(|e| ServiceError::Domain(DomainError::Internal(format!("compression task failed: {}", e))))?
        .map_err(ServiceError::Domain)?;

        self.ensure_quota(blob.len() as u64).await?;

        let checksum = hex::encode(Sha256::digest(&blob));
        let photo = CapturedPhoto {
            id: Uuid::new_v4(),
            checksum,
            mime_type,
            byte_size: blob.len() as i64,
            blob_evicted: false,
            location: meta.location,
            purpose: meta.purpose,
            status: RecordStatus::PendingUpload,
            remote_id: None,
            created_at: Utc::now(),
            synced_at: None,
        };
        let task = SyncTask::new(EntityKind::Photo, photo.id, SyncOperation::Create);

        // The photo and its create task land atomically; no photo ever
        // exists without a matching task.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ServiceError::Domain(DomainError::Database(DbError::from(e))))?;
        self.photo_repo
            .create_with_tx(&photo, &blob, &mut tx)
            .await
            .map_err(ServiceError::Domain)?;
        self.queue_repo
            .enqueue_with_tx(&task, &mut tx)
            .await
            .map_err(ServiceError::Domain)?;
        tx.commit()
            .await
            .map_err(|e| ServiceError::Domain(DomainError::Database(DbError::from(e))))?;

        log::info!(
            "Captured photo {} ({} bytes, purpose {:?})",
            photo.id,
            photo.byte_size,
            photo.purpose
        );

        let _ = self.events.send(CaptureEvent::Captured { photo_id: photo.id });
        self.worker.nudge().await;

        Ok(photo)
    }

    async fn capture_from_source(
        &self,
        source: &dyn CaptureSource,
        meta: CaptureMetadata,
    ) -> ServiceResult<CapturedPhoto> {
        let raw = source.acquire().await.map_err(|e| match e {
            CaptureSourceError::PermissionDenied(msg) => ServiceError::PermissionDenied(msg),
            CaptureSourceError::Unavailable(msg) => ServiceError::ServiceUnavailable(msg),
        })?;

        self.capture(raw, meta).await
    }

    async fn delete_photo(&self, id: Uuid) -> ServiceResult<()> {
        let photo = self.photo_repo.find_by_id(id).await.map_err(ServiceError::Domain)?;
        let annotations = self
            .annotation_repo
            .list_for_photo(id)
            .await
            .map_err(ServiceError::Domain)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ServiceError::Domain(DomainError::Database(DbError::from(e))))?;

        if photo.remote_id.is_none() {
            let cancelled = self
                .queue_repo
                .cancel_pending_create_with_tx(id, &mut tx)
                .await
                .map_err(ServiceError::Domain)?;

            if cancelled {
                // Nothing ever reached the remote: cancel the create and
                // discard locally. No delete task, no network call.
                for annotation in &annotations {
                    self.queue_repo
                        .delete_for_entity_with_tx(annotation.id, &mut tx)
                        .await
                        .map_err(ServiceError::Domain)?;
                    self.annotation_repo
                        .delete_with_tx(annotation.id, &mut tx)
                        .await
                        .map_err(ServiceError::Domain)?;
                }
                self.queue_repo
                    .delete_for_entity_with_tx(id, &mut tx)
                    .await
                    .map_err(ServiceError::Domain)?;
                self.photo_repo
                    .delete_with_tx(id, &mut tx)
                    .await
                    .map_err(ServiceError::Domain)?;
                tx.commit()
                    .await
                    .map_err(|e| ServiceError::Domain(DomainError::Database(DbError::from(e))))?;

                log::info!("Cancelled unsent photo {} before upload", id);
                let _ = self.events.send(CaptureEvent::Deleted { photo_id: id });
                return Ok(());
            }
            // The create is in flight; let it finish and race the delete
            // task behind it.
        }

        for annotation in &annotations {
            if annotation.remote_id.is_none() {
                let cancelled = self
                    .queue_repo
                    .cancel_pending_create_with_tx(annotation.id, &mut tx)
                    .await
                    .map_err(ServiceError::Domain)?;
                if cancelled {
                    self.queue_repo
                        .delete_for_entity_with_tx(annotation.id, &mut tx)
                        .await
                        .map_err(ServiceError::Domain)?;
                    self.annotation_repo
                        .delete_with_tx(annotation.id, &mut tx)
                        .await
                        .map_err(ServiceError::Domain)?;
                    continue;
                }
            }
            let task = SyncTask::new(EntityKind::Annotation, annotation.id, SyncOperation::Delete);
            self.queue_repo
                .enqueue_with_tx(&task, &mut tx)
                .await
                .map_err(ServiceError::Domain)?;
        }

        let task = SyncTask::new(EntityKind::Photo, id, SyncOperation::Delete);
        self.queue_repo
            .enqueue_with_tx(&task, &mut tx)
            .await
            .map_err(ServiceError::Domain)?;
        tx.commit()
            .await
            .map_err(|e| ServiceError::Domain(DomainError::Database(DbError::from(e))))?;

        log::info!("Enqueued remote delete for photo {}", id);
        let _ = self.events.send(CaptureEvent::Deleted { photo_id: id });
        self.worker.nudge().await;

        Ok(())
    }

    async fn retry_photo(&self, id: Uuid) -> ServiceResult<()> {
        let photo = self.photo_repo.find_by_id(id).await.map_err(ServiceError::Domain)?;
        if !photo.status.is_terminal() {
            return Err(ServiceError::Domain(DomainError::Validation(
                ValidationError::invalid_value(
                    "photo.status",
                    "only failed or conflicted photos can be retried",
                ),
            )));
        }

        let annotations = self
            .annotation_repo
            .list_for_photo(id)
            .await
            .map_err(ServiceError::Domain)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ServiceError::Domain(DomainError::Database(DbError::from(e))))?;

        self.queue_repo
            .reset_for_manual_retry_with_tx(id, &mut tx)
            .await
            .map_err(ServiceError::Domain)?;
        self.photo_repo
            .update_status_with_tx(id, RecordStatus::PendingUpload, &mut tx)
            .await
            .map_err(ServiceError::Domain)?;

        // Annotations that failed alongside the photo ride along on the
        // same retry.
        for annotation in &annotations {
            if annotation.status == RecordStatus::Failed {
                let reset = self
                    .queue_repo
                    .reset_for_manual_retry_with_tx(annotation.id, &mut tx)
                    .await
                    .map_err(ServiceError::Domain)?;
                if reset {
                    self.annotation_repo
                        .update_status_with_tx(annotation.id, RecordStatus::PendingUpload, &mut tx)
                        .await
                        .map_err(ServiceError::Domain)?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| ServiceError::Domain(DomainError::Database(DbError::from(e))))?;

        log::info!("Manual retry requested for photo {}", id);
        self.worker.nudge().await;
        Ok(())
    }

    async fn get_photo(&self, id: Uuid) -> ServiceResult<CapturedPhoto> {
        self.photo_repo.find_by_id(id).await.map_err(ServiceError::Domain)
    }

    async fn photo_blob(&self, id: Uuid) -> ServiceResult<Option<Vec<u8>>> {
        self.photo_repo.load_blob(id).await.map_err(ServiceError::Domain)
    }

    async fn list_photos(
        &self,
        status: Option<RecordStatus>,
    ) -> ServiceResult<Vec<CapturedPhoto>> {
        self.photo_repo
            .list_by_status(status)
            .await
            .map_err(ServiceError::Domain)
    }

    async fn pending_photos(&self) -> ServiceResult<Vec<CapturedPhoto>> {
        let all = self
            .photo_repo
            .list_by_status(None)
            .await
            .map_err(ServiceError::Domain)?;
        Ok(all
            .into_iter()
            .filter(|p| {
                matches!(
                    p.status,
                    RecordStatus::PendingUpload | RecordStatus::Queued | RecordStatus::Syncing
                )
            })
            .collect())
    }

    async fn storage_usage(&self) -> ServiceResult<StorageUsage> {
        self.photo_repo.storage_usage().await.map_err(ServiceError::Domain)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }
}
