use crate::domains::sync::types::{
    ConflictRecord, ConflictRecordRow, SyncTask, SyncTaskRow, SyncTaskStatus,
};
use crate::errors::{DbError, DomainError, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

/// Durable, ordered queue of pending remote mutations.
///
/// Tasks are drained in creation order per entity; independent entities may
/// be reordered for throughput. Deletes carry a higher priority than
/// creates so removed content never uploads first.
#[async_trait]
pub trait SyncQueueRepository: Send + Sync {
    async fn enqueue_with_tx(
        &self,
        task: &SyncTask,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;

    async fn find_by_id(&self, task_id: Uuid) -> DomainResult<SyncTask>;

    /// Tasks eligible to run now: `pending` or due `retry_wait`, no task of
    /// the same entity in flight, and annotation creates gated on their
    /// parent photo having synced.
    async fn find_ready(&self, limit: u32, now: DateTime<Utc>) -> DomainResult<Vec<SyncTask>>;

    /// Atomically claim a ready task. Returns false if another claim won.
    async fn claim(&self, task_id: Uuid) -> DomainResult<bool>;

    /// Remove a not-yet-synced create task for an entity (user cancelled
    /// before upload). Returns false when the task is in flight or synced.
    async fn cancel_pending_create_with_tx(
        &self,
        entity_id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<bool>;

    async fn mark_synced_with_tx(
        &self,
        task_id: Uuid,
        completed_at: DateTime<Utc>,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;

    /// Park a task for retry after a computed backoff delay.
    async fn mark_retry_wait(
        &self,
        task_id: Uuid,
        attempts: i64,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> DomainResult<()>;

    /// Requeue an in-flight task as immediately pending (used when a local
    /// write must win a version race, attempts preserved).
    async fn mark_pending(&self, task_id: Uuid, attempts: i64, error: &str) -> DomainResult<()>;

    async fn mark_failed_with_tx(
        &self,
        task_id: Uuid,
        attempts: i64,
        error: &str,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;

    async fn mark_conflict_with_tx(
        &self,
        task_id: Uuid,
        error: &str,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;

    /// Fail still-queued annotation create tasks for a photo whose own
    /// create ended in terminal failure.
    async fn fail_dependent_annotation_creates_with_tx(
        &self,
        photo_id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<u64>;

    /// Reset a terminal-failed task to `pending` for a manual user retry.
    async fn reset_for_manual_retry_with_tx(
        &self,
        entity_id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<bool>;

    /// Clear outstanding backoff delays so a reconnect drains immediately.
    /// Attempt counters are preserved.
    async fn clear_retry_delays(&self) -> DomainResult<u64>;

    /// Requeue tasks left `in_flight` by a previous session that ended
    /// before their outcome was recorded. Idempotency keys make the rerun
    /// safe.
    async fn recover_stale_in_flight(&self) -> DomainResult<u64>;

    async fn count_by_status(&self, status: SyncTaskStatus) -> DomainResult<i64>;

    /// Remove terminal tasks attached to an entity being purged locally.
    async fn delete_for_entity_with_tx(
        &self,
        entity_id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;
}

/// Persisted conflict review list.
#[async_trait]
pub trait ConflictLogRepository: Send + Sync {
    async fn append_with_tx(
        &self,
        record: &ConflictRecord,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;

    async fn list_unreviewed(&self) -> DomainResult<Vec<ConflictRecord>>;

    async fn mark_reviewed(&self, conflict_id: Uuid) -> DomainResult<()>;

    async fn count_unreviewed(&self) -> DomainResult<i64>;
}

pub struct SqliteSyncQueueRepository {
    pool: SqlitePool,
}

impl SqliteSyncQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncQueueRepository for SqliteSyncQueueRepository {
    async fn enqueue_with_tx(
        &self,
        task: &SyncTask,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        query(
            r#"INSERT INTO sync_tasks (
                id, entity_kind, entity_id, operation, status,
                priority, attempts, next_retry_at, last_error, created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(task.entity_kind.as_str())
        .bind(task.entity_id.to_string())
        .bind(task.operation.as_str())
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.attempts)
        .bind(task.next_retry_at.map(|dt| dt.to_rfc3339()))
        .bind(task.last_error.clone())
        .bind(task.created_at.to_rfc3339())
        .bind(task.completed_at.map(|dt| dt.to_rfc3339()))
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(())
    }

    async fn find_by_id(&self, task_id: Uuid) -> DomainResult<SyncTask> {
        let row = query_as::<_, SyncTaskRow>("SELECT * FROM sync_tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)
            .map_err(DomainError::Database)?
            .ok_or_else(|| {
                DomainError::Database(DbError::NotFound(
                    "sync_task".to_string(),
                    task_id.to_string(),
                ))
            })?;

        SyncTask::try_from(row)
    }

    async fn find_ready(&self, limit: u32, now: DateTime<Utc>) -> DomainResult<Vec<SyncTask>> {
        let rows = query_as::<_, SyncTaskRow>(
            r#"SELECT t.* FROM sync_tasks t
            WHERE t.status IN ('pending', 'retry_wait')
              AND (t.next_retry_at IS NULL OR t.next_retry_at <= ?)
              AND NOT EXISTS (
                  SELECT 1 FROM sync_tasks held
                  WHERE held.entity_id = t.entity_id AND held.status = 'in_flight'
              )
              AND NOT (
                  t.entity_kind = 'annotation' AND t.operation = 'create'
                  AND NOT EXISTS (
                      SELECT 1 FROM annotations a
                      JOIN photos p ON p.id = a.photo_id
                      WHERE a.id = t.entity_id AND p.status = 'synced'
                  )
              )
            ORDER BY t.priority DESC, t.created_at ASC
            LIMIT ?"#,
        )
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        rows.into_iter().map(SyncTask::try_from).collect()
    }

    async fn claim(&self, task_id: Uuid) -> DomainResult<bool> {
        let result = query(
            "UPDATE sync_tasks SET status = 'in_flight' WHERE id = ? AND status IN ('pending', 'retry_wait')",
        )
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel_pending_create_with_tx(
        &self,
        entity_id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<bool> {
        // In-flight and synced creates cannot be cancelled; the caller
        // falls back to enqueueing a delete.
        let blocked = query_scalar::<_, i64>(
            r#"SELECT COUNT(*) FROM sync_tasks
            WHERE entity_id = ? AND operation = 'create' AND status IN ('in_flight', 'synced')"#,
        )
        .bind(entity_id.to_string())
        .fetch_one(&mut **tx)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        if blocked > 0 {
            return Ok(false);
        }

        query(
            r#"DELETE FROM sync_tasks
            WHERE entity_id = ? AND operation = 'create'
              AND status IN ('pending', 'retry_wait', 'failed', 'conflict')"#,
        )
        .bind(entity_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(true)
    }

    async fn mark_synced_with_tx(
        &self,
        task_id: Uuid,
        completed_at: DateTime<Utc>,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        query(
            r#"UPDATE sync_tasks
            SET status = 'synced', next_retry_at = NULL, last_error = NULL, completed_at = ?
            WHERE id = ?"#,
        )
        .bind(completed_at.to_rfc3339())
        .bind(task_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(())
    }

    async fn mark_retry_wait(
        &self,
        task_id: Uuid,
        attempts: i64,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> DomainResult<()> {
        query(
            r#"UPDATE sync_tasks
            SET status = 'retry_wait', attempts = ?, next_retry_at = ?, last_error = ?
            WHERE id = ?"#,
        )
        .bind(attempts)
        .bind(next_retry_at.to_rfc3339())
        .bind(error)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(())
    }

    async fn mark_pending(&self, task_id: Uuid, attempts: i64, error: &str) -> DomainResult<()> {
        query(
            r#"UPDATE sync_tasks
            SET status = 'pending', attempts = ?, next_retry_at = NULL, last_error = ?
            WHERE id = ?"#,
        )
        .bind(attempts)
        .bind(error)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(())
    }

    async fn mark_failed_with_tx(
        &self,
        task_id: Uuid,
        attempts: i64,
        error: &str,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        query(
            r#"UPDATE sync_tasks
            SET status = 'failed', attempts = ?, next_retry_at = NULL, last_error = ?, completed_at = ?
            WHERE id = ?"#,
        )
        .bind(attempts)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(())
    }

    async fn mark_conflict_with_tx(
        &self,
        task_id: Uuid,
        error: &str,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        query(
            r#"UPDATE sync_tasks
            SET status = 'conflict', next_retry_at = NULL, last_error = ?, completed_at = ?
            WHERE id = ?"#,
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(())
    }

    async fn fail_dependent_annotation_creates_with_tx(
        &self,
        photo_id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<u64> {
        let result = query(
            r#"UPDATE sync_tasks
            SET status = 'failed', next_retry_at = NULL,
                last_error = 'parent photo failed to sync', completed_at = ?
            WHERE entity_kind = 'annotation' AND operation = 'create'
              AND status IN ('pending', 'retry_wait')
              AND entity_id IN (SELECT id FROM annotations WHERE photo_id = ?)"#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(photo_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(result.rows_affected())
    }

    async fn reset_for_manual_retry_with_tx(
        &self,
        entity_id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<bool> {
        let result = query(
            r#"UPDATE sync_tasks
            SET status = 'pending', attempts = 0, next_retry_at = NULL,
                last_error = NULL, completed_at = NULL
            WHERE entity_id = ? AND status IN ('failed', 'conflict')"#,
        )
        .bind(entity_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_retry_delays(&self) -> DomainResult<u64> {
        let result = query(
            "UPDATE sync_tasks SET next_retry_at = NULL, status = 'pending' WHERE status = 'retry_wait'",
        )
        .execute(&self.pool)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(result.rows_affected())
    }

    async fn recover_stale_in_flight(&self) -> DomainResult<u64> {
        let result = query("UPDATE sync_tasks SET status = 'pending' WHERE status = 'in_flight'")
            .execute(&self.pool)
            .await
            .map_err(DbError::from)
            .map_err(DomainError::Database)?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self, status: SyncTaskStatus) -> DomainResult<i64> {
        query_scalar::<_, i64>("SELECT COUNT(*) FROM sync_tasks WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)
            .map_err(DomainError::Database)
    }

    async fn delete_for_entity_with_tx(
        &self,
        entity_id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        query("DELETE FROM sync_tasks WHERE entity_id = ?")
            .bind(entity_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)
            .map_err(DomainError::Database)?;

        Ok(())
    }
}

pub struct SqliteConflictLogRepository {
    pool: SqlitePool,
}

impl SqliteConflictLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConflictLogRepository for SqliteConflictLogRepository {
    async fn append_with_tx(
        &self,
        record: &ConflictRecord,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        query(
            r#"INSERT INTO sync_conflicts (
                id, entity_kind, entity_id, reason, local_timestamp,
                remote_timestamp, message, detected_at, reviewed
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(record.entity_kind.as_str())
        .bind(record.entity_id.to_string())
        .bind(record.reason.as_str())
        .bind(record.local_timestamp.to_rfc3339())
        .bind(record.remote_timestamp.map(|dt| dt.to_rfc3339()))
        .bind(record.message.clone())
        .bind(record.detected_at.to_rfc3339())
        .bind(record.reviewed as i64)
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        Ok(())
    }

    async fn list_unreviewed(&self) -> DomainResult<Vec<ConflictRecord>> {
        let rows = query_as::<_, ConflictRecordRow>(
            "SELECT * FROM sync_conflicts WHERE reviewed = 0 ORDER BY detected_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)
        .map_err(DomainError::Database)?;

        rows.into_iter().map(ConflictRecord::try_from).collect()
    }

    async fn mark_reviewed(&self, conflict_id: Uuid) -> DomainResult<()> {
        let result = query("UPDATE sync_conflicts SET reviewed = 1 WHERE id = ?")
            .bind(conflict_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)
            .map_err(DomainError::Database)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Database(DbError::NotFound(
                "sync_conflict".to_string(),
                conflict_id.to_string(),
            )));
        }

        Ok(())
    }

    async fn count_unreviewed(&self) -> DomainResult<i64> {
        query_scalar::<_, i64>("SELECT COUNT(*) FROM sync_conflicts WHERE reviewed = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)
            .map_err(DomainError::Database)
    }
}
