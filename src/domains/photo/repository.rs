use crate::domains::photo::types::{CapturedPhoto, PhotoRow};
use crate::domains::sync::types::parse_uuid;
use crate::errors::{DbError, DomainError, DomainResult};
use crate::types::{RecordStatus, StorageUsage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

/// Photo collection of the durable local store.
#[async_trait]
pub trait PhotoRepository: Send + Sync {
    async fn create_with_tx(
        &self,
        photo: &CapturedPhoto,
        blob: &[u8],
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;

    async fn find_by_id(&self, id: Uuid) -> DomainResult<CapturedPhoto>;

    /// The stored blob, or None once evicted.
    async fn load_blob(&self, id: Uuid) -> DomainResult<Option<Vec<u8>>>;

    async fn list_by_status(&self, status: Option<RecordStatus>) -> DomainResult<Vec<CapturedPhoto>>;

    /// Reverse index: ids of annotations anchored to this photo, in
    /// creation order.
    async fn annotation_ids(&self, photo_id: Uuid) -> DomainResult<Vec<Uuid>>;

    async fn update_status(&self, id: Uuid, status: RecordStatus) -> DomainResult<()>;

    async fn update_status_with_tx(
        &self,
        id: Uuid,
        status: RecordStatus,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;

    /// Flip to `synced` and record the remote id. The remote id is set
    /// exactly once; a second write is a conflict.
    async fn mark_synced_with_tx(
        &self,
        id: Uuid,
        remote_id: &str,
        synced_at: DateTime<Utc>,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;

    async fn delete_with_tx(&self, id: Uuid, tx: &mut Transaction<'_, Sqlite>)
        -> DomainResult<()>;

    async fn storage_usage(&self) -> DomainResult<StorageUsage>;

    /// Evict oldest synced blobs until `needed_bytes` fit under quota.
    /// Returns the bytes actually freed; never touches unsynced photos.
    async fn evict_synced_for(&self, needed_bytes: u64) -> DomainResult<u64>;
}

pub struct SqlitePhotoRepository {
    pool: SqlitePool,
    quota_bytes: u64,
}

impl SqlitePhotoRepository {
    pub fn new(pool: SqlitePool, quota_bytes: u64) -> Self {
        Self { pool, quota_bytes }
    }

    fn entity_name() -> &'static str {
        "photo"
    }
}

#[async_trait]
impl PhotoRepository for SqlitePhotoRepository {
    async fn create_with_tx(
        &self,
        photo: &CapturedPhoto,
        blob: &[u8],
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        query(
            r#"INSERT INTO photos (
                id, blob, blob_evicted, checksum, mime_type, byte_size,
                latitude, longitude, purpose, status, remote_id, created_at, synced_at
            ) VALUES (?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(photo.id.to_string())
        .bind(blob)
        .bind(photo.checksum.clone())
        .bind(photo.mime_type.clone())
        .bind(photo.byte_size)
        .bind(photo.location.map(|l| l.latitude))
        .bind(photo.location.map(|l| l.longitude))
        .bind(photo.purpose.clone())
        .bind(photo.status.as_str())
        .bind(photo.remote_id.clone())
        .bind(photo.created_at.to_rfc3339())
        .bind(photo.synced_at.map(|dt| dt.to_rfc3339()))
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> DomainResult<CapturedPhoto> {
        let row = query_as::<_, PhotoRow>(
            r#"SELECT id, checksum, mime_type, byte_size, blob_evicted, latitude,
                longitude, purpose, status, remote_id, created_at, synced_at
            FROM photos WHERE id = ?"#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?
        .ok_or_else(|| DomainError::EntityNotFound(Self::entity_name().to_string(), id))?;

        CapturedPhoto::try_from(row)
    }

    async fn load_blob(&self, id: Uuid) -> DomainResult<Option<Vec<u8>>> {
        let blob = query_scalar::<_, Option<Vec<u8>>>("SELECT blob FROM photos WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)
            .map_err(DomainError::Database)?
            .ok_or_else(|| DomainError::EntityNotFound(Self::entity_name().to_string(), id))?;

        Ok(blob)
    }

    async fn list_by_status(
        &self,
        status: Option<RecordStatus>,
    ) -> DomainResult<Vec<CapturedPhoto>> {
        let rows = match status {
            Some(status) => {
                query_as::<_, PhotoRow>(
                    r#"SELECT id, checksum, mime_type, byte_size, blob_evicted, latitude,
                        longitude, purpose, status, remote_id, created_at, synced_at
                    FROM photos WHERE status = ? ORDER BY created_at ASC"#,
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                query_as::<_, PhotoRow>(
                    r#"SELECT id, checksum, mime_type, byte_size, blob_evicted, latitude,
                        longitude, purpose, status, remote_id, created_at, synced_at
                    FROM photos ORDER BY created_at ASC"#,
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        rows.into_iter().map(CapturedPhoto::try_from).collect()
    }

    async fn annotation_ids(&self, photo_id: Uuid) -> DomainResult<Vec<Uuid>> {
        let ids = query_scalar::<_, String>(
            "SELECT id FROM annotations WHERE photo_id = ? ORDER BY created_at ASC",
        )
        .bind(photo_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        ids.iter()
            .map(|s| parse_uuid(s, "annotations.id"))
            .collect()
    }

    async fn update_status(&self, id: Uuid, status: RecordStatus) -> DomainResult<()> {
        let result = query("UPDATE photos SET status = ? WHERE id = ?")
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
        query("UPDATE photos SET status = ? WHERE id = ?")
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
            r#"UPDATE photos SET status = 'synced', remote_id = ?, synced_at = ?
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
                "remote_id already set for photo {}",
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
        query("DELETE FROM photos WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)
            .map_err(DomainError::Database)?;

        Ok(())
    }

    async fn storage_usage(&self) -> DomainResult<StorageUsage> {
        let used = query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(byte_size), 0) FROM photos WHERE blob_evicted = 0",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(StorageUsage {
            used_bytes: used.max(0) as u64,
            quota_bytes: self.quota_bytes,
        })
    }

    async fn evict_synced_for(&self, needed_bytes: u64) -> DomainResult<u64> {
        let usage = self.storage_usage().await?;
        if usage.available_bytes() >= needed_bytes {
            return Ok(0);
        }
        let mut to_free = needed_bytes - usage.available_bytes();
        let mut freed: u64 = 0;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))?;

        loop {
            let candidate = query_as::<_, (String, i64)>(
                r#"SELECT id, byte_size FROM photos
                WHERE status = 'synced' AND blob_evicted = 0
                ORDER BY created_at ASC LIMIT 1"#,
            )
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::from)
            .map_err(DomainError::Database)?;

            let (id, byte_size) = match candidate {
                Some(c) => c,
                None => break,
            };

            query("UPDATE photos SET blob = NULL, blob_evicted = 1 WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)
                .map_err(DomainError::Database)?;

            log::info!("Evicted synced photo blob {} ({} bytes)", id, byte_size);

            let size = byte_size.max(0) as u64;
            freed += size;
            if size >= to_free {
                break;
            }
            to_free -= size;
        }

        tx.commit()
            .await
            .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))?;

        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DbConnection;
    use crate::db_migration::initialize_database;
    use crate::domains::photo::types::CapturedPhoto;

    async fn setup() -> SqlitePool {
        let pool = DbConnection::open_in_memory().await.unwrap();
        initialize_database(&pool).await.unwrap();
        pool
    }

    fn photo_with(status: RecordStatus, byte_size: i64) -> CapturedPhoto {
        CapturedPhoto {
            id: Uuid::new_v4(),
            checksum: "deadbeef".to_string(),
            mime_type: "image/jpeg".to_string(),
            byte_size,
            blob_evicted: false,
            location: None,
            purpose: Some("equipment_condition".to_string()),
            status,
            remote_id: if status == RecordStatus::Synced {
                Some("rem-1".to_string())
            } else {
                None
            },
            created_at: Utc::now(),
            synced_at: None,
        }
    }

    async fn insert(pool: &SqlitePool, repo: &SqlitePhotoRepository, photo: &CapturedPhoto) {
        let blob = vec![0u8; photo.byte_size as usize];
        let mut tx = pool.begin().await.unwrap();
        repo.create_with_tx(photo, &blob, &mut tx).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn create_and_load_round_trip() {
        let pool = setup().await;
        let repo = SqlitePhotoRepository::new(pool.clone(), 10_000);
        let photo = photo_with(RecordStatus::PendingUpload, 100);
        insert(&pool, &repo, &photo).await;

        let found = repo.find_by_id(photo.id).await.unwrap();
        assert_eq!(found.status, RecordStatus::PendingUpload);
        assert_eq!(found.byte_size, 100);
        assert_eq!(repo.load_blob(photo.id).await.unwrap().unwrap().len(), 100);
    }

    #[tokio::test]
    async fn remote_id_is_set_exactly_once() {
        let pool = setup().await;
        let repo = SqlitePhotoRepository::new(pool.clone(), 10_000);
        let photo = photo_with(RecordStatus::PendingUpload, 10);
        insert(&pool, &repo, &photo).await;

        let mut tx = pool.begin().await.unwrap();
        repo.mark_synced_with_tx(photo.id, "rem-42", Utc::now(), &mut tx)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        let second = repo
            .mark_synced_with_tx(photo.id, "rem-43", Utc::now(), &mut tx)
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn eviction_only_touches_synced_photos() {
        let pool = setup().await;
        let repo = SqlitePhotoRepository::new(pool.clone(), 1_000);

        let synced = photo_with(RecordStatus::Synced, 400);
        let pending = photo_with(RecordStatus::PendingUpload, 400);
        insert(&pool, &repo, &synced).await;
        insert(&pool, &repo, &pending).await;

        // 800 used of 1000; asking for 400 forces eviction of the synced one
        let freed = repo.evict_synced_for(400).await.unwrap();
        assert_eq!(freed, 400);

        let synced = repo.find_by_id(synced.id).await.unwrap();
        assert!(synced.blob_evicted);
        assert!(repo.load_blob(synced.id).await.unwrap().is_none());

        let pending = repo.find_by_id(pending.id).await.unwrap();
        assert!(!pending.blob_evicted);

        // Nothing synced remains; a further request frees nothing
        let freed = repo.evict_synced_for(1_000).await.unwrap();
        assert_eq!(freed, 0);
    }

    #[tokio::test]
    async fn annotation_ids_list_in_creation_order() {
        use crate::domains::annotation::repository::{
            AnnotationRepository, SqliteAnnotationRepository,
        };
        use crate::domains::annotation::types::{Annotation, AnnotationGeometry, AnnotationKind};

        let pool = setup().await;
        let repo = SqlitePhotoRepository::new(pool.clone(), 10_000);
        let ann_repo = SqliteAnnotationRepository::new(pool.clone());

        let photo = photo_with(RecordStatus::PendingUpload, 10);
        insert(&pool, &repo, &photo).await;

        let mut expected = Vec::new();
        for i in 0..3 {
            let annotation = Annotation {
                id: Uuid::new_v4(),
                photo_id: photo.id,
                geometry: AnnotationGeometry {
                    kind: AnnotationKind::Freehand,
                    anchor_x: i as f64,
                    anchor_y: 0.0,
                    properties: None,
                },
                text: None,
                status: RecordStatus::PendingUpload,
                remote_id: None,
                created_at: Utc::now() + chrono::Duration::milliseconds(i),
                synced_at: None,
            };
            let mut tx = pool.begin().await.unwrap();
            ann_repo.create_with_tx(&annotation, &mut tx).await.unwrap();
            tx.commit().await.unwrap();
            expected.push(annotation.id);
        }

        assert_eq!(repo.annotation_ids(photo.id).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn committed_writes_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("photos.db");
        let db_path = db_path.to_str().unwrap();

        let photo = photo_with(RecordStatus::PendingUpload, 64);
        {
            let pool = DbConnection::open(db_path).await.unwrap();
            initialize_database(&pool).await.unwrap();
            let repo = SqlitePhotoRepository::new(pool.clone(), 10_000);
            insert(&pool, &repo, &photo).await;
            pool.close().await;
        }

        let pool = DbConnection::open(db_path).await.unwrap();
        initialize_database(&pool).await.unwrap();
        let repo = SqlitePhotoRepository::new(pool.clone(), 10_000);

        let found = repo.find_by_id(photo.id).await.unwrap();
        assert_eq!(found.checksum, photo.checksum);
        assert_eq!(repo.load_blob(photo.id).await.unwrap().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn usage_ignores_evicted_blobs() {
        let pool = setup().await;
        let repo = SqlitePhotoRepository::new(pool.clone(), 1_000);

        let synced = photo_with(RecordStatus::Synced, 600);
        insert(&pool, &repo, &synced).await;
        assert_eq!(repo.storage_usage().await.unwrap().used_bytes, 600);

        repo.evict_synced_for(600).await.unwrap();
        assert_eq!(repo.storage_usage().await.unwrap().used_bytes, 0);
    }
}
