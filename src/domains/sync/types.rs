use crate::errors::{DomainError, RemoteRejection, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Which local collection a sync task refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Photo,
    Annotation,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Photo => "photo",
            EntityKind::Annotation => "annotation",
        }
    }
}

impl FromStr for EntityKind {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "photo" => Ok(EntityKind::Photo),
            "annotation" => Ok(EntityKind::Annotation),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid EntityKind string: {}",
                s
            )))),
        }
    }
}

/// The remote mutation a task carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }
}

impl FromStr for SyncOperation {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(SyncOperation::Create),
            "update" => Ok(SyncOperation::Update),
            "delete" => Ok(SyncOperation::Delete),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid SyncOperation string: {}",
                s
            )))),
        }
    }
}

/// Task state machine:
/// `pending → in_flight → {synced | retry_wait | failed | conflict}`,
/// `retry_wait → in_flight` once the backoff delay elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTaskStatus {
    Pending,
    InFlight,
    RetryWait,
    Synced,
    Failed,
    Conflict,
}

impl SyncTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTaskStatus::Pending => "pending",
            SyncTaskStatus::InFlight => "in_flight",
            SyncTaskStatus::RetryWait => "retry_wait",
            SyncTaskStatus::Synced => "synced",
            SyncTaskStatus::Failed => "failed",
            SyncTaskStatus::Conflict => "conflict",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncTaskStatus::Synced | SyncTaskStatus::Failed | SyncTaskStatus::Conflict
        )
    }
}

impl FromStr for SyncTaskStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncTaskStatus::Pending),
            "in_flight" => Ok(SyncTaskStatus::InFlight),
            "retry_wait" => Ok(SyncTaskStatus::RetryWait),
            "synced" => Ok(SyncTaskStatus::Synced),
            "failed" => Ok(SyncTaskStatus::Failed),
            "conflict" => Ok(SyncTaskStatus::Conflict),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid SyncTaskStatus string: {}",
                s
            )))),
        }
    }
}

/// Queue priority. User-initiated deletes jump ahead of pending creates so
/// content the user already removed is never uploaded first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPriority {
    UserDelete = 10,
    Normal = 5,
}

impl From<SyncPriority> for i64 {
    fn from(priority: SyncPriority) -> Self {
        match priority {
            SyncPriority::UserDelete => 10,
            SyncPriority::Normal => 5,
        }
    }
}

/// A single pending remote mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub operation: SyncOperation,
    pub status: SyncTaskStatus,
    pub priority: i64,
    pub attempts: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncTask {
    pub fn new(entity_kind: EntityKind, entity_id: Uuid, operation: SyncOperation) -> Self {
        let priority = match operation {
            SyncOperation::Delete => SyncPriority::UserDelete,
            _ => SyncPriority::Normal,
        };
        Self {
            id: Uuid::new_v4(),
            entity_kind,
            entity_id,
            operation,
            status: SyncTaskStatus::Pending,
            priority: priority.into(),
            attempts: 0,
            next_retry_at: None,
            last_error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Why an entity landed in the conflict review list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    TargetMissing,
    VersionMismatch,
    RemoteDeleted,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::TargetMissing => "target_missing",
            ConflictReason::VersionMismatch => "version_mismatch",
            ConflictReason::RemoteDeleted => "remote_deleted",
        }
    }
}

impl FromStr for ConflictReason {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "target_missing" => Ok(ConflictReason::TargetMissing),
            "version_mismatch" => Ok(ConflictReason::VersionMismatch),
            "remote_deleted" => Ok(ConflictReason::RemoteDeleted),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid ConflictReason string: {}",
                s
            )))),
        }
    }
}

/// Entry in the user-visible conflict review list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub reason: ConflictReason,
    pub local_timestamp: DateTime<Utc>,
    pub remote_timestamp: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub reviewed: bool,
}

impl ConflictRecord {
    pub fn new(
        entity_kind: EntityKind,
        entity_id: Uuid,
        reason: ConflictReason,
        local_timestamp: DateTime<Utc>,
        remote_timestamp: Option<DateTime<Utc>>,
        rejection: &RemoteRejection,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_kind,
            entity_id,
            reason,
            local_timestamp,
            remote_timestamp,
            message: Some(rejection.to_string()),
            detected_at: Utc::now(),
            reviewed: false,
        }
    }
}

/// Connectivity as reported by the host shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

/// Session-wide sync state snapshot, reported to the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusReport {
    pub connectivity: Connectivity,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub active_task_count: usize,
    pub pending_tasks: i64,
    pub retry_wait_tasks: i64,
    pub failed_tasks: i64,
    pub conflict_tasks: i64,
    pub unreviewed_conflicts: i64,
}

/// Tuning knobs for the sync worker.
#[derive(Debug, Clone)]
pub struct SyncWorkerConfig {
    /// Attempts before a task is parked as `failed`.
    pub max_attempts: i64,
    /// First retry delay; doubles per attempt.
    pub base_retry_delay: Duration,
    /// Ceiling for the computed backoff delay.
    pub max_retry_delay: Duration,
    /// Per-request timeout; an expired call counts as a transient failure.
    pub request_timeout: Duration,
    /// Concurrent remote calls for independent tasks.
    pub max_concurrent_uploads: usize,
    /// Queue poll interval while idle.
    pub poll_interval: Duration,
    /// Tasks claimed per drain pass.
    pub drain_batch_size: u32,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(60),
            max_concurrent_uploads: 3,
            poll_interval: Duration::from_secs(15),
            drain_batch_size: 16,
        }
    }
}

pub(crate) fn parse_uuid(uuid_str: &str, field_name: &str) -> Result<Uuid, DomainError> {
    Uuid::parse_str(uuid_str).map_err(|_| {
        DomainError::Validation(ValidationError::format(
            field_name,
            &format!("Invalid UUID format: {}", uuid_str),
        ))
    })
}

pub(crate) fn parse_datetime(dt_str: &str, field_name: &str) -> Result<DateTime<Utc>, DomainError> {
    DateTime::parse_from_rfc3339(dt_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            DomainError::Validation(ValidationError::format(
                field_name,
                &format!("Invalid RFC3339 format: {}", dt_str),
            ))
        })
}

pub(crate) fn parse_optional_datetime(
    dt_str: Option<String>,
    field_name: &str,
) -> Result<Option<DateTime<Utc>>, DomainError> {
    dt_str.map(|s| parse_datetime(&s, field_name)).transpose()
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncTaskRow {
    pub id: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub operation: String,
    pub status: String,
    pub priority: i64,
    pub attempts: i64,
    pub next_retry_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl TryFrom<SyncTaskRow> for SyncTask {
    type Error = DomainError;
    fn try_from(row: SyncTaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "sync_tasks.id")?,
            entity_kind: EntityKind::from_str(&row.entity_kind)?,
            entity_id: parse_uuid(&row.entity_id, "sync_tasks.entity_id")?,
            operation: SyncOperation::from_str(&row.operation)?,
            status: SyncTaskStatus::from_str(&row.status)?,
            priority: row.priority,
            attempts: row.attempts,
            next_retry_at: parse_optional_datetime(row.next_retry_at, "sync_tasks.next_retry_at")?,
            last_error: row.last_error,
            created_at: parse_datetime(&row.created_at, "sync_tasks.created_at")?,
            completed_at: parse_optional_datetime(row.completed_at, "sync_tasks.completed_at")?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ConflictRecordRow {
    pub id: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub reason: String,
    pub local_timestamp: String,
    pub remote_timestamp: Option<String>,
    pub message: Option<String>,
    pub detected_at: String,
    pub reviewed: i64,
}

impl TryFrom<ConflictRecordRow> for ConflictRecord {
    type Error = DomainError;
    fn try_from(row: ConflictRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "sync_conflicts.id")?,
            entity_kind: EntityKind::from_str(&row.entity_kind)?,
            entity_id: parse_uuid(&row.entity_id, "sync_conflicts.entity_id")?,
            reason: ConflictReason::from_str(&row.reason)?,
            local_timestamp: parse_datetime(
                &row.local_timestamp,
                "sync_conflicts.local_timestamp",
            )?,
            remote_timestamp: parse_optional_datetime(
                row.remote_timestamp,
                "sync_conflicts.remote_timestamp",
            )?,
            message: row.message,
            detected_at: parse_datetime(&row.detected_at, "sync_conflicts.detected_at")?,
            reviewed: row.reviewed != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_tasks_outrank_creates() {
        let create = SyncTask::new(EntityKind::Photo, Uuid::new_v4(), SyncOperation::Create);
        let delete = SyncTask::new(EntityKind::Photo, Uuid::new_v4(), SyncOperation::Delete);
        assert!(delete.priority > create.priority);
    }

    #[test]
    fn task_status_round_trips() {
        for s in [
            "pending",
            "in_flight",
            "retry_wait",
            "synced",
            "failed",
            "conflict",
        ] {
            assert_eq!(SyncTaskStatus::from_str(s).unwrap().as_str(), s);
        }
    }
}
