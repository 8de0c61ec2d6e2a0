use crate::domains::annotation::types::{Annotation, AnnotationRow};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::types::RecordStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

/// Annotation collection of the durable local store.
#[async_trait]
pub trait AnnotationRepository: Send + Sync {
    async fn create_with_tx(
        &self,
        annotation: &Annotation,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;

    async fn find_by_id(&self, id: Uuid) -> DomainResult<Annotation>;

    async fn list_for_photo(&self, photo_id: Uuid) -> DomainResult<Vec<Annotation>>;

    async fn update_status(&self, id: Uuid, status: RecordStatus) -> DomainResult<()>;

    async fn update_status_with_tx(
        &self,
        id: Uuid,
        status: RecordStatus,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;

    /// Flip to `synced` and record the remote id, exactly once.
    async fn mark_synced_with_tx(
        &self,
        id: Uuid,
        remote_id: &str,
        synced_at: DateTime<Utc>,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;

    async fn delete_with_tx(&self, id: Uuid, tx: &mut Transaction<'_, Sqlite>)
        -> DomainResult<()>;

    /// Fail every not-yet-synced annotation of a photo whose upload ended
    /// in terminal failure. Returns the number of annotations touched.
    async fn fail_unsynced_for_photo_with_tx(
        &self,
        photo_id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<u64>;
}

pub struct SqliteAnnotationRepository {
    pool: SqlitePool,
}

impl SqliteAnnotationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn entity_name() -> &'static str {
        "annotation"
    }
}

#[async_trait]
impl AnnotationRepository for SqliteAnnotationRepository {
    async fn create_with_tx(
        &self,
        annotation: &Annotation,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        let properties = annotation
            .geometry
            .properties
            .as_ref()
            .map(|v| {
                serde_json::to_string(v).map_err(|e| {
                    DomainError::Internal(format!("failed to serialize annotation properties: {}", e))
                })
            })
            .transpose()?;

        query(
            r#"INSERT INTO annotations (
                id, photo_id, kind, anchor_x, anchor_y, properties,
                text, status, remote_id, created_at, synced_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(annotation.id.to_string())
        .bind(annotation.photo_id.to_string())
        .bind(annotation.geometry.kind.as_str())
        .bind(annotation.geometry.anchor_x)
        .bind(annotation.geometry.anchor_y)
        .bind(properties)
        .bind(annotation.text.clone())
        .bind(annotation.status.as_str())
        .bind(annotation.remote_id.clone())
        .bind(annotation.created_at.to_rfc3339())
        .bind(annotation.synced_at.map(|dt| dt.to_rfc3339()))
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> DomainResult<Annotation> {
        let row = query_as::<_, AnnotationRow>("SELECT * FROM annotations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)
            .map_err(DomainError::Database)?
            .ok_or_else(|| DomainError::EntityNotFound(Self::entity_name().to_string(), id))?;

        Annotation::try_from(row)
    }

    async fn list_for_photo(&self, photo_id: Uuid) -> DomainResult<Vec<Annotation>> {
        let rows = query_as::<_, AnnotationRow>(
            "SELECT * FROM annotations WHERE photo_id = ? ORDER BY created_at ASC",
        )
        .bind(photo_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        rows.into_iter().map(Annotation::try_from).collect()
    }

    async fn update_status(&self, id: Uuid, status: RecordStatus) -> DomainResult<()> {
        let result = query("UPDATE annotations SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)
            .map_err(DomainError::Database)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound(
                Self::entity_name().to_string(),
                id,
            ));
        }

        Ok(())
    }

    async fn update_status_with_tx(
        &self,
        id: Uuid,
        status: RecordStatus,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        query("UPDATE annotations SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)
            .map_err(DomainError::Database)?;

        Ok(())
    }

    async fn mark_synced_with_tx(
        &self,
        id: Uuid,
        remote_id: &str,
        synced_at: DateTime<Utc>,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        let result = query(
            r#"UPDATE annotations SET status = 'synced', remote_id = ?, synced_at = ?
            WHERE id = ? AND remote_id IS NULL"#,
        )
        .bind(remote_id)
        .bind(synced_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Database(DbError::Conflict(format!(
                "remote_id already set for annotation {}",
                id
            ))));
        }

        Ok(())
    }

    async fn delete_with_tx(
        &self,
        id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        query("DELETE FROM annotations WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)
            .map_err(DomainError::Database)?;

        Ok(())
    }

    async fn fail_unsynced_for_photo_with_tx(
        &self,
        photo_id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<u64> {
        let result = query(
            r#"UPDATE annotations SET status = 'failed'
            WHERE photo_id = ? AND status IN ('pending_upload', 'queued', 'syncing')"#,
        )
        .bind(photo_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(result.rows_affected())
    }
}
