use crate::domains::annotation::repository::AnnotationRepository;
use crate::domains::annotation::types::{
    Annotation, AnnotationGeometry, MAX_ANNOTATION_TEXT_LENGTH,
};
use crate::domains::photo::repository::PhotoRepository;
use crate::domains::sync::repository::SyncQueueRepository;
use crate::domains::sync::types::{EntityKind, SyncOperation, SyncTask};
use crate::domains::sync::worker::SyncWorkerHandle;
use crate::errors::{DbError, DomainError, ServiceError, ServiceResult, ValidationError};
use crate::types::RecordStatus;
use crate::validation::{Validate, ValidationBuilder};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// Attaches user-drawn markup to photos. Annotations are persisted and
/// synced independently of their photo, but never ahead of it.
#[async_trait]
pub trait AnnotationEngine: Send + Sync {
    /// Create an annotation anchored on a photo. Refused when the photo is
    /// in a terminal failure state.
    async fn add_annotation(
        &self,
        photo_id: Uuid,
        geometry: AnnotationGeometry,
        text: Option<String>,
    ) -> ServiceResult<Annotation>;

    /// Remove an annotation. A never-uploaded annotation is cancelled and
    /// discarded locally; a synced one gets a remote delete task.
    async fn remove_annotation(&self, id: Uuid) -> ServiceResult<()>;

    /// Manual retry of a terminally failed annotation.
    async fn retry_annotation(&self, id: Uuid) -> ServiceResult<()>;

    async fn get_annotation(&self, id: Uuid) -> ServiceResult<Annotation>;

    async fn list_for_photo(&self, photo_id: Uuid) -> ServiceResult<Vec<Annotation>>;
}

pub struct AnnotationEngineImpl {
    pool: SqlitePool,
    annotation_repo: Arc<dyn AnnotationRepository>,
    photo_repo: Arc<dyn PhotoRepository>,
    queue_repo: Arc<dyn SyncQueueRepository>,
    worker: SyncWorkerHandle,
}

impl AnnotationEngineImpl {
    pub fn new(
        pool: SqlitePool,
        annotation_repo: Arc<dyn AnnotationRepository>,
        photo_repo: Arc<dyn PhotoRepository>,
        queue_repo: Arc<dyn SyncQueueRepository>,
        worker: SyncWorkerHandle,
    ) -> Self {
        Self {
            pool,
            annotation_repo,
            photo_repo,
            queue_repo,
            worker,
        }
    }
}

#[async_trait]
impl AnnotationEngine for AnnotationEngineImpl {
    async fn add_annotation(
        &self,
        photo_id: Uuid,
        geometry: AnnotationGeometry,
        text: Option<String>,
    ) -> ServiceResult<Annotation> {
        geometry.validate().map_err(ServiceError::Domain)?;
        ValidationBuilder::new("text", text.clone())
            .max_length(MAX_ANNOTATION_TEXT_LENGTH)
            .validate()
            .map_err(ServiceError::Domain)?;

        let photo = self
            .photo_repo
            .find_by_id(photo_id)
            .await
            .map_err(ServiceError::Domain)?;

        if photo.status.is_terminal() {
            return Err(ServiceError::Domain(DomainError::Validation(
                ValidationError::relationship(
                    "cannot annotate a photo that failed to sync; retry or discard it first",
                ),
            )));
        }

        let annotation = Annotation {
            id: Uuid::new_v4(),
            photo_id,
            geometry,
            text,
            status: RecordStatus::PendingUpload,
            remote_id: None,
            created_at: Utc::now(),
            synced_at: None,
        };
        let task = SyncTask::new(EntityKind::Annotation, annotation.id, SyncOperation::Create);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ServiceError::Domain(DomainError::Database(DbError::from(e))))?;
        self.annotation_repo
            .create_with_tx(&annotation, &mut tx)
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
            "Added {} annotation {} on photo {}",
            annotation.geometry.kind.as_str(),
            annotation.id,
            photo_id
        );
        self.worker.nudge().await;

        Ok(annotation)
    }

    async fn remove_annotation(&self, id: Uuid) -> ServiceResult<()> {
        let annotation = self
            .annotation_repo
            .find_by_id(id)
            .await
            .map_err(ServiceError::Domain)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ServiceError::Domain(DomainError::Database(DbError::from(e))))?;

        if annotation.remote_id.is_none() {
            let cancelled = self
                .queue_repo
                .cancel_pending_create_with_tx(id, &mut tx)
                .await
                .map_err(ServiceError::Domain)?;
            if cancelled {
                self.queue_repo
                    .delete_for_entity_with_tx(id, &mut tx)
                    .await
                    .map_err(ServiceError::Domain)?;
                self.annotation_repo
                    .delete_with_tx(id, &mut tx)
                    .await
                    .map_err(ServiceError::Domain)?;
                tx.commit()
                    .await
                    .map_err(|e| ServiceError::Domain(DomainError::Database(DbError::from(e))))?;

                log::info!("Cancelled unsent annotation {} before upload", id);
                return Ok(());
            }
        }

        let task = SyncTask::new(EntityKind::Annotation, id, SyncOperation::Delete);
        self.queue_repo
            .enqueue_with_tx(&task, &mut tx)
            .await
            .map_err(ServiceError::Domain)?;
        tx.commit()
            .await
            .map_err(|e| ServiceError::Domain(DomainError::Database(DbError::from(e))))?;

        log::info!("Enqueued remote delete for annotation {}", id);
        self.worker.nudge().await;

        Ok(())
    }

    async fn retry_annotation(&self, id: Uuid) -> ServiceResult<()> {
        let annotation = self
            .annotation_repo
            .find_by_id(id)
            .await
            .map_err(ServiceError::Domain)?;
        if !annotation.status.is_terminal() {
            return Err(ServiceError::Domain(DomainError::Validation(
                ValidationError::invalid_value(
                    "annotation.status",
                    "only failed or conflicted annotations can be retried",
                ),
            )));
        }

        // Pointless to requeue under a parent that cannot sync.
        let photo = self
            .photo_repo
            .find_by_id(annotation.photo_id)
            .await
            .map_err(ServiceError::Domain)?;
        if photo.status.is_terminal() && annotation.remote_id.is_none() {
            return Err(ServiceError::Domain(DomainError::Validation(
                ValidationError::relationship("retry the parent photo first"),
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ServiceError::Domain(DomainError::Database(DbError::from(e))))?;
        self.queue_repo
            .reset_for_manual_retry_with_tx(id, &mut tx)
            .await
            .map_err(ServiceError::Domain)?;
        self.annotation_repo
            .update_status_with_tx(id, RecordStatus::PendingUpload, &mut tx)
            .await
            .map_err(ServiceError::Domain)?;
        tx.commit()
            .await
            .map_err(|e| ServiceError::Domain(DomainError::Database(DbError::from(e))))?;

        log::info!("Manual retry requested for annotation {}", id);
        self.worker.nudge().await;
        Ok(())
    }

    async fn get_annotation(&self, id: Uuid) -> ServiceResult<Annotation> {
        self.annotation_repo
            .find_by_id(id)
            .await
            .map_err(ServiceError::Domain)
    }

    async fn list_for_photo(&self, photo_id: Uuid) -> ServiceResult<Vec<Annotation>> {
        self.annotation_repo
            .list_for_photo(photo_id)
            .await
            .map_err(ServiceError::Domain)
    }
}
