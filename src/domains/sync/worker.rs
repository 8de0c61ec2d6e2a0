//! Background worker draining the sync queue against the remote store.
//!
//! A single coordinating loop claims ready tasks and fans each out to a
//! spawned job bounded by a counting semaphore. A task only runs while its
//! entity holds a lease, so no two mutations of the same entity are ever in
//! flight together.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domains::annotation::repository::AnnotationRepository;
use crate::domains::photo::repository::PhotoRepository;
use crate::domains::sync::conflict::{ConflictDisposition, ConflictResolver};
use crate::domains::sync::repository::{ConflictLogRepository, SyncQueueRepository};
use crate::domains::sync::types::{
    ConflictRecord, Connectivity, EntityKind, SyncOperation, SyncTask, SyncTaskStatus,
    SyncStatusReport, SyncWorkerConfig,
};
use crate::domains::sync::remote::RemoteSyncApi;
use crate::errors::{DbError, DomainError, DomainResult, SyncError};
use crate::types::RecordStatus;

/// Messages accepted by the worker loop.
#[derive(Debug)]
pub enum SyncWorkerMessage {
    /// Drain the queue immediately, reporting how many jobs started.
    ProcessNow {
        response: oneshot::Sender<usize>,
    },
    /// Fire-and-forget wake from a service that just enqueued work.
    Nudge,
    /// Current session sync state.
    GetStatus {
        response: oneshot::Sender<SyncStatusReport>,
    },
    /// Stop the loop and abort outstanding jobs.
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Cheap clone handle for talking to a running worker.
#[derive(Clone)]
pub struct SyncWorkerHandle {
    sender: mpsc::Sender<SyncWorkerMessage>,
}

impl SyncWorkerHandle {
    /// Wake the worker after enqueueing. Best effort; a stopped worker
    /// drains on its next start.
    pub async fn nudge(&self) {
        let _ = self.sender.send(SyncWorkerMessage::Nudge).await;
    }

    pub async fn process_now(&self) -> Option<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SyncWorkerMessage::ProcessNow { response: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn status(&self) -> Option<SyncStatusReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SyncWorkerMessage::GetStatus { response: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SyncWorkerMessage::Shutdown { response: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// Everything a spawned task job needs, cloneable into the job.
#[derive(Clone)]
struct TaskContext {
    pool: SqlitePool,
    queue_repo: Arc<dyn SyncQueueRepository>,
    photo_repo: Arc<dyn PhotoRepository>,
    annotation_repo: Arc<dyn AnnotationRepository>,
    conflict_repo: Arc<dyn ConflictLogRepository>,
    remote: Arc<dyn RemoteSyncApi>,
    resolver: ConflictResolver,
    config: SyncWorkerConfig,
    last_successful_sync: Arc<RwLock<Option<DateTime<Utc>>>>,
}

pub struct SyncWorker {
    ctx: TaskContext,
    connectivity: watch::Receiver<Connectivity>,
    message_receiver: Option<mpsc::Receiver<SyncWorkerMessage>>,
    message_sender: mpsc::Sender<SyncWorkerMessage>,
    semaphore: Arc<Semaphore>,
    /// Entity ids with an in-flight task (the lease set).
    leases: Arc<Mutex<HashSet<Uuid>>>,
    active_jobs: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl SyncWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        queue_repo: Arc<dyn SyncQueueRepository>,
        photo_repo: Arc<dyn PhotoRepository>,
        annotation_repo: Arc<dyn AnnotationRepository>,
        conflict_repo: Arc<dyn ConflictLogRepository>,
        remote: Arc<dyn RemoteSyncApi>,
        connectivity: watch::Receiver<Connectivity>,
        config: SyncWorkerConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(100);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_uploads));

        Self {
            ctx: TaskContext {
                pool,
                queue_repo,
                photo_repo,
                annotation_repo,
                conflict_repo,
                remote,
                resolver: ConflictResolver::new(),
                config,
                last_successful_sync: Arc::new(RwLock::new(None)),
            },
            connectivity,
            message_receiver: Some(receiver),
            message_sender: sender,
            semaphore,
            leases: Arc::new(Mutex::new(HashSet::new())),
            active_jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn handle(&self) -> SyncWorkerHandle {
        SyncWorkerHandle {
            sender: self.message_sender.clone(),
        }
    }

    /// Start the coordinating loop. There is exactly one loop per queue;
    /// the returned handle is the only way to reach it.
    pub fn start(mut self) -> (JoinHandle<()>, SyncWorkerHandle) {
        let handle = self.handle();
        let mut receiver = self
            .message_receiver
            .take()
            .expect("Receiver should be available");

        let join = tokio::spawn(async move {
            self.run(&mut receiver).await;
            log::info!("Sync worker shut down");
        });

        (join, handle)
    }

    async fn run(&mut self, receiver: &mut mpsc::Receiver<SyncWorkerMessage>) {
        log::info!(
            "Starting sync worker (max {} concurrent uploads, {} attempts)",
            self.ctx.config.max_concurrent_uploads,
            self.ctx.config.max_attempts
        );

        let mut interval = tokio::time::interval(self.ctx.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut connectivity = self.connectivity.clone();
        let mut watch_alive = true;
        let mut shutdown_response: Option<oneshot::Sender<()>> = None;

        loop {
            tokio::select! {
                message = receiver.recv() => {
                    match message {
                        Some(SyncWorkerMessage::ProcessNow { response }) => {
                            let started = self.drain().await;
                            let _ = response.send(started);
                        }
                        Some(SyncWorkerMessage::Nudge) => {
                            self.drain().await;
                        }
                        Some(SyncWorkerMessage::GetStatus { response }) => {
                            let _ = response.send(self.status_report().await);
                        }
                        Some(SyncWorkerMessage::Shutdown { response }) => {
                            shutdown_response = Some(response);
                            break;
                        }
                        None => break,
                    }
                }
                _ = interval.tick() => {
                    self.drain().await;
                }
                changed = connectivity.changed(), if watch_alive => {
                    match changed {
                        Ok(()) => {
                            let online = connectivity.borrow_and_update().is_online();
                            if online {
                                // Bypass outstanding backoff delays; attempt
                                // counters are preserved.
                                match self.ctx.queue_repo.clear_retry_delays().await {
                                    Ok(cleared) if cleared > 0 => {
                                        log::info!("Connectivity restored; released {} waiting tasks", cleared)
                                    }
                                    Ok(_) => {}
                                    Err(e) => log::error!("Failed to release waiting tasks: {}", e),
                                }
                                self.drain().await;
                            }
                        }
                        Err(_) => watch_alive = false,
                    }
                }
            }
        }

        // In-flight calls are abandoned; their tasks stay `in_flight` and
        // are recovered as stale on the next session.
        let mut jobs = self.active_jobs.lock().await;
        for (task_id, job) in jobs.drain() {
            log::warn!("Aborting in-flight sync job for task {}", task_id);
            job.abort();
        }
        drop(jobs);

        if let Some(response) = shutdown_response {
            let _ = response.send(());
        }
    }

    /// Claim ready tasks and fan them out. Returns the number of jobs
    /// started this pass.
    async fn drain(&self) -> usize {
        if !self.connectivity.borrow().is_online() {
            return 0;
        }

        let ready = match self
            .ctx
            .queue_repo
            .find_ready(self.ctx.config.drain_batch_size, Utc::now())
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                log::error!("Failed to read sync queue: {}", e);
                return 0;
            }
        };

        let mut started = 0;
        for task in ready {
            if !self.try_start_job(task).await {
                continue;
            }
            started += 1;
        }

        if started > 0 {
            log::debug!("Started {} sync jobs", started);
        }
        started
    }

    async fn try_start_job(&self, task: SyncTask) -> bool {
        {
            let mut leases = self.leases.lock().await;
            if leases.contains(&task.entity_id) {
                return false;
            }
            match self.ctx.queue_repo.claim(task.id).await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    log::error!("Failed to claim task {}: {}", task.id, e);
                    return false;
                }
            }
            leases.insert(task.entity_id);
        }

        // Uploads flip the entity to `syncing` while the lease is held.
        if matches!(task.operation, SyncOperation::Create | SyncOperation::Update) {
            if let Err(e) = set_entity_status(&self.ctx, task.entity_kind, task.entity_id, RecordStatus::Syncing).await {
                log::warn!("Failed to mark {} {} syncing: {}", task.entity_kind.as_str(), task.entity_id, e);
            }
        }

        let ctx = self.ctx.clone();
        let semaphore = self.semaphore.clone();
        let leases = self.leases.clone();
        let active_jobs = self.active_jobs.clone();
        let task_id = task.id;
        let entity_id = task.entity_id;

        let job = tokio::spawn(async move {
            // Bound concurrent remote calls.
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            execute_task(&ctx, task).await;

            leases.lock().await.remove(&entity_id);
            active_jobs.lock().await.remove(&task_id);
        });

        self.active_jobs.lock().await.insert(task_id, job);
        true
    }

    async fn status_report(&self) -> SyncStatusReport {
        let count = |status| async move {
            self.ctx
                .queue_repo
                .count_by_status(status)
                .await
                .unwrap_or_default()
        };

        let connectivity = *self.connectivity.borrow();
        SyncStatusReport {
            connectivity,
            last_successful_sync_at: *self.ctx.last_successful_sync.read().await,
            active_task_count: self.leases.lock().await.len(),
            pending_tasks: count(SyncTaskStatus::Pending).await,
            retry_wait_tasks: count(SyncTaskStatus::RetryWait).await,
            failed_tasks: count(SyncTaskStatus::Failed).await,
            conflict_tasks: count(SyncTaskStatus::Conflict).await,
            unreviewed_conflicts: self
                .ctx
                .conflict_repo
                .count_unreviewed()
                .await
                .unwrap_or_default(),
        }
    }
}

/// What a remote attempt produced.
enum RemoteOutcome {
    Created(String),
    Deleted,
    /// The task was satisfied without a remote call (e.g. a delete whose
    /// create never ran).
    LocalOnly,
}

async fn execute_task(ctx: &TaskContext, task: SyncTask) {
    let result = run_remote_op(ctx, &task).await;

    let ack = match result {
        Ok(RemoteOutcome::Created(remote_id)) => ack_upload_success(ctx, &task, &remote_id).await,
        Ok(RemoteOutcome::Deleted) | Ok(RemoteOutcome::LocalOnly) => {
            ack_delete_success(ctx, &task).await
        }
        Err(SyncError::Rejected {
            rejection,
            ..
        }) => handle_rejection(ctx, &task, &rejection).await,
        Err(transient) => handle_transient(ctx, &task, &transient).await,
    };

    if let Err(e) = ack {
        // The task stays claimed; stale-recovery on restart re-runs it.
        log::error!("Failed to record outcome of task {}: {}", task.id, e);
    }
}

async fn run_remote_op(ctx: &TaskContext, task: &SyncTask) -> Result<RemoteOutcome, SyncError> {
    let timeout = ctx.config.request_timeout;

    match (task.entity_kind, task.operation) {
        (EntityKind::Photo, SyncOperation::Create) | (EntityKind::Photo, SyncOperation::Update) => {
            let photo = ctx
                .photo_repo
                .find_by_id(task.entity_id)
                .await
                .map_err(|e| SyncError::Other(e.to_string()))?;
            let blob = ctx
                .photo_repo
                .load_blob(task.entity_id)
                .await
                .map_err(|e| SyncError::Other(e.to_string()))?
                .ok_or_else(|| SyncError::Other("photo blob unavailable".to_string()))?;

            let remote_id = with_timeout(timeout, ctx.remote.create_photo(&photo, &blob)).await?;
            Ok(RemoteOutcome::Created(remote_id))
        }
        (EntityKind::Photo, SyncOperation::Delete) => {
            let photo = ctx
                .photo_repo
                .find_by_id(task.entity_id)
                .await
                .map_err(|e| SyncError::Other(e.to_string()))?;

            match photo.remote_id {
                Some(remote_id) => {
                    with_timeout(timeout, ctx.remote.delete_photo(&remote_id, task.entity_id))
                        .await?;
                    Ok(RemoteOutcome::Deleted)
                }
                // The create never succeeded; nothing remote to delete.
                None => Ok(RemoteOutcome::LocalOnly),
            }
        }
        (EntityKind::Annotation, SyncOperation::Create)
        | (EntityKind::Annotation, SyncOperation::Update) => {
            let annotation = ctx
                .annotation_repo
                .find_by_id(task.entity_id)
                .await
                .map_err(|e| SyncError::Other(e.to_string()))?;
            let photo = ctx
                .photo_repo
                .find_by_id(annotation.photo_id)
                .await
                .map_err(|e| SyncError::Other(e.to_string()))?;
            let photo_remote_id = photo
                .remote_id
                .ok_or_else(|| SyncError::Other("parent photo has no remote id".to_string()))?;

            let remote_id = with_timeout(
                timeout,
                ctx.remote.create_annotation(&annotation, &photo_remote_id),
            )
            .await?;
            Ok(RemoteOutcome::Created(remote_id))
        }
        (EntityKind::Annotation, SyncOperation::Delete) => {
            let annotation = ctx
                .annotation_repo
                .find_by_id(task.entity_id)
                .await
                .map_err(|e| SyncError::Other(e.to_string()))?;

            match annotation.remote_id {
                Some(remote_id) => {
                    with_timeout(
                        timeout,
                        ctx.remote.delete_annotation(&remote_id, task.entity_id),
                    )
                    .await?;
                    Ok(RemoteOutcome::Deleted)
                }
                None => Ok(RemoteOutcome::LocalOnly),
            }
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(timeout.as_secs())),
    }
}

/// Task synced; record the remote id (create) or just the status (update)
/// and the entity flip in one transaction.
async fn ack_upload_success(ctx: &TaskContext, task: &SyncTask, remote_id: &str) -> DomainResult<()> {
    let now = Utc::now();
    let mut tx = ctx
        .pool
        .begin()
        .await
        .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))?;

    ctx.queue_repo.mark_synced_with_tx(task.id, now, &mut tx).await?;

    match (task.entity_kind, task.operation) {
        (EntityKind::Photo, SyncOperation::Create) => {
            ctx.photo_repo
                .mark_synced_with_tx(task.entity_id, remote_id, now, &mut tx)
                .await?;
        }
        (EntityKind::Annotation, SyncOperation::Create) => {
            ctx.annotation_repo
                .mark_synced_with_tx(task.entity_id, remote_id, now, &mut tx)
                .await?;
        }
        (EntityKind::Photo, _) => {
            ctx.photo_repo
                .update_status_with_tx(task.entity_id, RecordStatus::Synced, &mut tx)
                .await?;
        }
        (EntityKind::Annotation, _) => {
            ctx.annotation_repo
                .update_status_with_tx(task.entity_id, RecordStatus::Synced, &mut tx)
                .await?;
        }
    }

    tx.commit()
        .await
        .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))?;

    *ctx.last_successful_sync.write().await = Some(now);
    log::info!(
        "Synced {} {} (remote id {})",
        task.entity_kind.as_str(),
        task.entity_id,
        remote_id
    );
    Ok(())
}

/// Delete confirmed (or satisfied locally): retire the task and purge the
/// local row.
async fn ack_delete_success(ctx: &TaskContext, task: &SyncTask) -> DomainResult<()> {
    let now = Utc::now();
    let mut tx = ctx
        .pool
        .begin()
        .await
        .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))?;

    ctx.queue_repo.mark_synced_with_tx(task.id, now, &mut tx).await?;
    ctx.queue_repo
        .cancel_pending_create_with_tx(task.entity_id, &mut tx)
        .await?;

    match task.entity_kind {
        EntityKind::Photo => {
            ctx.photo_repo.delete_with_tx(task.entity_id, &mut tx).await?;
        }
        EntityKind::Annotation => {
            ctx.annotation_repo
                .delete_with_tx(task.entity_id, &mut tx)
                .await?;
        }
    }

    tx.commit()
        .await
        .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))?;

    *ctx.last_successful_sync.write().await = Some(now);
    log::info!("Removed {} {}", task.entity_kind.as_str(), task.entity_id);
    Ok(())
}

async fn handle_rejection(
    ctx: &TaskContext,
    task: &SyncTask,
    rejection: &crate::errors::RemoteRejection,
) -> DomainResult<()> {
    let local_timestamp = entity_timestamp(ctx, task).await?;
    let disposition = ctx.resolver.resolve(task.operation, rejection, local_timestamp);

    match disposition {
        ConflictDisposition::AlreadySatisfied => ack_delete_success(ctx, task).await,
        ConflictDisposition::RetryLocalWins => {
            let attempts = task.attempts + 1;
            if attempts >= ctx.config.max_attempts {
                mark_terminal_failure(ctx, task, attempts, "version race retries exhausted").await
            } else {
                log::info!(
                    "Local write wins version race for {} {}; resubmitting",
                    task.entity_kind.as_str(),
                    task.entity_id
                );
                ctx.queue_repo
                    .mark_pending(task.id, attempts, &rejection.to_string())
                    .await?;
                set_entity_status(ctx, task.entity_kind, task.entity_id, RecordStatus::Queued).await
            }
        }
        ConflictDisposition::MarkConflict(reason) => {
            let remote_timestamp = match rejection {
                crate::errors::RemoteRejection::VersionMismatch { remote_timestamp } => {
                    Some(*remote_timestamp)
                }
                crate::errors::RemoteRejection::RemoteDeleted { remote_timestamp } => {
                    *remote_timestamp
                }
                crate::errors::RemoteRejection::TargetMissing { .. } => None,
            };
            let record = ConflictRecord::new(
                task.entity_kind,
                task.entity_id,
                reason,
                local_timestamp,
                remote_timestamp,
                rejection,
            );

            let mut tx = ctx
                .pool
                .begin()
                .await
                .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))?;

            ctx.queue_repo
                .mark_conflict_with_tx(task.id, &rejection.to_string(), &mut tx)
                .await?;
            ctx.conflict_repo.append_with_tx(&record, &mut tx).await?;

            match task.entity_kind {
                EntityKind::Photo => {
                    ctx.photo_repo
                        .update_status_with_tx(task.entity_id, RecordStatus::Conflict, &mut tx)
                        .await?;
                    // Annotations can never follow a conflicted photo.
                    ctx.queue_repo
                        .fail_dependent_annotation_creates_with_tx(task.entity_id, &mut tx)
                        .await?;
                    ctx.annotation_repo
                        .fail_unsynced_for_photo_with_tx(task.entity_id, &mut tx)
                        .await?;
                }
                EntityKind::Annotation => {
                    ctx.annotation_repo
                        .update_status_with_tx(task.entity_id, RecordStatus::Conflict, &mut tx)
                        .await?;
                }
            }

            tx.commit()
                .await
                .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))?;

            log::warn!(
                "Conflict on {} {}: {}",
                task.entity_kind.as_str(),
                task.entity_id,
                rejection
            );
            Ok(())
        }
    }
}

async fn handle_transient(ctx: &TaskContext, task: &SyncTask, error: &SyncError) -> DomainResult<()> {
    let attempts = task.attempts + 1;

    if attempts >= ctx.config.max_attempts {
        log::warn!(
            "Task {} for {} {} failed after {} attempts: {}",
            task.id,
            task.entity_kind.as_str(),
            task.entity_id,
            attempts,
            error
        );
        return mark_terminal_failure(ctx, task, attempts, &error.to_string()).await;
    }

    let delay = compute_backoff(attempts, &ctx.config);
    let next_retry_at = Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));

    log::debug!(
        "Task {} attempt {} failed ({}); retrying in {:?}",
        task.id,
        attempts,
        error,
        delay
    );

    ctx.queue_repo
        .mark_retry_wait(task.id, attempts, next_retry_at, &error.to_string())
        .await?;
    set_entity_status(ctx, task.entity_kind, task.entity_id, RecordStatus::Queued).await
}

/// Terminal failure: park the task and entity as `failed`, cascading onto
/// annotation creates that depended on a failed photo create.
async fn mark_terminal_failure(
    ctx: &TaskContext,
    task: &SyncTask,
    attempts: i64,
    error: &str,
) -> DomainResult<()> {
    let mut tx = ctx
        .pool
        .begin()
        .await
        .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))?;

    ctx.queue_repo
        .mark_failed_with_tx(task.id, attempts, error, &mut tx)
        .await?;

    match task.entity_kind {
        EntityKind::Photo => {
            ctx.photo_repo
                .update_status_with_tx(task.entity_id, RecordStatus::Failed, &mut tx)
                .await?;
            if task.operation == SyncOperation::Create {
                ctx.queue_repo
                    .fail_dependent_annotation_creates_with_tx(task.entity_id, &mut tx)
                    .await?;
                ctx.annotation_repo
                    .fail_unsynced_for_photo_with_tx(task.entity_id, &mut tx)
                    .await?;
            }
        }
        EntityKind::Annotation => {
            ctx.annotation_repo
                .update_status_with_tx(task.entity_id, RecordStatus::Failed, &mut tx)
                .await?;
        }
    }

    tx.commit()
        .await
        .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))
}

async fn set_entity_status(
    ctx: &TaskContext,
    entity_kind: EntityKind,
    entity_id: Uuid,
    status: RecordStatus,
) -> DomainResult<()> {
    match entity_kind {
        EntityKind::Photo => ctx.photo_repo.update_status(entity_id, status).await,
        EntityKind::Annotation => ctx.annotation_repo.update_status(entity_id, status).await,
    }
}

async fn entity_timestamp(ctx: &TaskContext, task: &SyncTask) -> DomainResult<DateTime<Utc>> {
    match task.entity_kind {
        EntityKind::Photo => Ok(ctx.photo_repo.find_by_id(task.entity_id).await?.created_at),
        EntityKind::Annotation => Ok(ctx
            .annotation_repo
            .find_by_id(task.entity_id)
            .await?
            .created_at),
    }
}

/// Exponential backoff with uniform jitter: `base * 2^(attempts-1)` capped
/// at the max delay, plus up to half that again of jitter.
fn compute_backoff(attempts: i64, config: &SyncWorkerConfig) -> Duration {
    use rand::Rng;

    let exponent = (attempts - 1).clamp(0, 16) as u32;
    let base_ms = config.base_retry_delay.as_millis() as u64;
    let capped_ms = base_ms
        .saturating_mul(1u64 << exponent)
        .min(config.max_retry_delay.as_millis() as u64);

    let jitter_ms = if capped_ms > 0 {
        rand::rng().random_range(0..=capped_ms / 2)
    } else {
        0
    };

    Duration::from_millis(capped_ms + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DbConnection;
    use crate::db_migration::initialize_database;
    use crate::domains::annotation::repository::SqliteAnnotationRepository;
    use crate::domains::annotation::types::{Annotation, AnnotationGeometry, AnnotationKind};
    use crate::domains::photo::repository::SqlitePhotoRepository;
    use crate::domains::photo::types::CapturedPhoto;
    use crate::domains::sync::network::ConnectivityMonitor;
    use crate::domains::sync::repository::{
        SqliteConflictLogRepository, SqliteSyncQueueRepository,
    };
    use crate::errors::RemoteRejection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Scripted remote endpoint. `photo_failures` transient errors are
    /// served before photo creates start succeeding.
    #[derive(Default)]
    struct MockRemote {
        photo_failures: AtomicUsize,
        reject_photos_with: StdMutex<Option<RemoteRejection>>,
        created_photo_ids: StdMutex<Vec<Uuid>>,
        created_annotation_ids: StdMutex<Vec<Uuid>>,
        deleted_remote_ids: StdMutex<Vec<String>>,
    }

    impl MockRemote {
        fn failing_times(n: usize) -> Self {
            let mock = Self::default();
            mock.photo_failures.store(n, Ordering::SeqCst);
            mock
        }

        fn rejecting(rejection: RemoteRejection) -> Self {
            let mock = Self::default();
            *mock.reject_photos_with.lock().unwrap() = Some(rejection);
            mock
        }

        fn unique_photo_creates(&self) -> usize {
            let ids = self.created_photo_ids.lock().unwrap();
            let mut unique: Vec<_> = ids.clone();
            unique.sort();
            unique.dedup();
            unique.len()
        }
    }

    #[async_trait::async_trait]
    impl RemoteSyncApi for MockRemote {
        async fn create_photo(&self, photo: &CapturedPhoto, _blob: &[u8]) -> Result<String, SyncError> {
            if let Some(rejection) = self.reject_photos_with.lock().unwrap().clone() {
                return Err(SyncError::Rejected {
                    entity_kind: "photo".to_string(),
                    entity_id: photo.id,
                    rejection,
                });
            }

            // The client id is the idempotency key: remember every attempt.
            self.created_photo_ids.lock().unwrap().push(photo.id);

            let remaining = self.photo_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.photo_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SyncError::Network("connection reset".to_string()));
            }

            Ok(format!("remote-{}", photo.id))
        }

        async fn create_annotation(
            &self,
            annotation: &Annotation,
            _photo_remote_id: &str,
        ) -> Result<String, SyncError> {
            self.created_annotation_ids.lock().unwrap().push(annotation.id);
            Ok(format!("remote-ann-{}", annotation.id))
        }

        async fn delete_photo(&self, remote_id: &str, _key: Uuid) -> Result<(), SyncError> {
            self.deleted_remote_ids.lock().unwrap().push(remote_id.to_string());
            Ok(())
        }

        async fn delete_annotation(&self, remote_id: &str, _key: Uuid) -> Result<(), SyncError> {
            self.deleted_remote_ids.lock().unwrap().push(remote_id.to_string());
            Ok(())
        }
    }

    struct TestEnv {
        pool: SqlitePool,
        queue_repo: Arc<SqliteSyncQueueRepository>,
        photo_repo: Arc<SqlitePhotoRepository>,
        annotation_repo: Arc<SqliteAnnotationRepository>,
        conflict_repo: Arc<SqliteConflictLogRepository>,
        monitor: ConnectivityMonitor,
        remote: Arc<MockRemote>,
    }

    async fn test_env(remote: MockRemote) -> TestEnv {
        let _ = env_logger::builder().is_test(true).try_init();
        let pool = DbConnection::open_in_memory().await.unwrap();
        initialize_database(&pool).await.unwrap();
        TestEnv {
            queue_repo: Arc::new(SqliteSyncQueueRepository::new(pool.clone())),
            photo_repo: Arc::new(SqlitePhotoRepository::new(pool.clone(), u64::MAX)),
            annotation_repo: Arc::new(SqliteAnnotationRepository::new(pool.clone())),
            conflict_repo: Arc::new(SqliteConflictLogRepository::new(pool.clone())),
            monitor: ConnectivityMonitor::new(Connectivity::Offline),
            remote: Arc::new(remote),
            pool,
        }
    }

    fn fast_config() -> SyncWorkerConfig {
        SyncWorkerConfig {
            max_attempts: 3,
            base_retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(50),
            request_timeout: Duration::from_secs(5),
            max_concurrent_uploads: 3,
            poll_interval: Duration::from_millis(25),
            drain_batch_size: 16,
        }
    }

    fn start_worker(env: &TestEnv) -> (JoinHandle<()>, SyncWorkerHandle) {
        SyncWorker::new(
            env.pool.clone(),
            env.queue_repo.clone(),
            env.photo_repo.clone(),
            env.annotation_repo.clone(),
            env.conflict_repo.clone(),
            env.remote.clone(),
            env.monitor.subscribe(),
            fast_config(),
        )
        .start()
    }

    async fn insert_photo(env: &TestEnv, photo: &CapturedPhoto) -> SyncTask {
        let task = SyncTask::new(EntityKind::Photo, photo.id, SyncOperation::Create);
        let mut tx = env.pool.begin().await.unwrap();
        env.photo_repo
            .create_with_tx(photo, &[1, 2, 3], &mut tx)
            .await
            .unwrap();
        env.queue_repo.enqueue_with_tx(&task, &mut tx).await.unwrap();
        tx.commit().await.unwrap();
        task
    }

    fn offline_photo() -> CapturedPhoto {
        CapturedPhoto {
            id: Uuid::new_v4(),
            checksum: "cafe".to_string(),
            mime_type: "image/jpeg".to_string(),
            byte_size: 3,
            blob_evicted: false,
            location: None,
            purpose: Some("equipment_condition".to_string()),
            status: RecordStatus::PendingUpload,
            remote_id: None,
            created_at: Utc::now(),
            synced_at: None,
        }
    }

    /// Poll until `predicate` holds or the deadline passes.
    async fn wait_until<F, Fut>(mut predicate: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if predicate().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within deadline");
    }

    #[tokio::test]
    async fn offline_capture_syncs_once_online() {
        let env = test_env(MockRemote::default()).await;
        let photo = offline_photo();
        insert_photo(&env, &photo).await;

        let (_join, handle) = start_worker(&env);

        // Offline: nothing moves.
        assert_eq!(handle.process_now().await, Some(0));
        let stored = env.photo_repo.find_by_id(photo.id).await.unwrap();
        assert_eq!(stored.status, RecordStatus::PendingUpload);

        env.monitor.set_online(true);

        let repo = env.photo_repo.clone();
        let id = photo.id;
        wait_until(|| {
            let repo = repo.clone();
            async move {
                repo.find_by_id(id)
                    .await
                    .map(|p| p.status == RecordStatus::Synced)
                    .unwrap_or(false)
            }
        })
        .await;

        let synced = env.photo_repo.find_by_id(photo.id).await.unwrap();
        assert_eq!(synced.remote_id, Some(format!("remote-{}", photo.id)));
        assert!(synced.synced_at.is_some());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn lost_response_retry_reuses_the_idempotency_key() {
        let env = test_env(MockRemote::failing_times(1)).await;
        let photo = offline_photo();
        insert_photo(&env, &photo).await;
        env.monitor.set_online(true);

        let (_join, handle) = start_worker(&env);

        let repo = env.photo_repo.clone();
        let id = photo.id;
        wait_until(|| {
            let repo = repo.clone();
            async move {
                repo.find_by_id(id)
                    .await
                    .map(|p| p.status == RecordStatus::Synced)
                    .unwrap_or(false)
            }
        })
        .await;

        // Two attempts hit the remote, both carrying the same client id:
        // exactly one remote record exists.
        assert_eq!(env.remote.created_photo_ids.lock().unwrap().len(), 2);
        assert_eq!(env.remote.unique_photo_creates(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn attempts_exhausted_parks_task_as_failed() {
        let env = test_env(MockRemote::failing_times(100)).await;
        let photo = offline_photo();
        let task = insert_photo(&env, &photo).await;
        env.monitor.set_online(true);

        let (_join, handle) = start_worker(&env);

        let repo = env.photo_repo.clone();
        let id = photo.id;
        wait_until(|| {
            let repo = repo.clone();
            async move {
                repo.find_by_id(id)
                    .await
                    .map(|p| p.status == RecordStatus::Failed)
                    .unwrap_or(false)
            }
        })
        .await;

        let parked = env.queue_repo.find_by_id(task.id).await.unwrap();
        assert_eq!(parked.status, SyncTaskStatus::Failed);
        assert_eq!(parked.attempts, fast_config().max_attempts);

        // The photo is still present and actionable.
        assert!(env.photo_repo.find_by_id(photo.id).await.is_ok());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn rejection_routes_to_conflict_review_list() {
        let env = test_env(MockRemote::rejecting(RemoteRejection::TargetMissing {
            detail: Some("equipment deleted".to_string()),
        }))
        .await;
        let photo = offline_photo();
        let task = insert_photo(&env, &photo).await;
        env.monitor.set_online(true);

        let (_join, handle) = start_worker(&env);

        let repo = env.photo_repo.clone();
        let id = photo.id;
        wait_until(|| {
            let repo = repo.clone();
            async move {
                repo.find_by_id(id)
                    .await
                    .map(|p| p.status == RecordStatus::Conflict)
                    .unwrap_or(false)
            }
        })
        .await;

        let parked = env.queue_repo.find_by_id(task.id).await.unwrap();
        assert_eq!(parked.status, SyncTaskStatus::Conflict);

        let review = env.conflict_repo.list_unreviewed().await.unwrap();
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].entity_id, photo.id);

        // Conflicted tasks are excluded from further automatic retries.
        let ready = env.queue_repo.find_ready(10, Utc::now()).await.unwrap();
        assert!(ready.is_empty());

        env.conflict_repo.mark_reviewed(review[0].id).await.unwrap();
        assert_eq!(env.conflict_repo.count_unreviewed().await.unwrap(), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn annotation_waits_for_parent_photo() {
        let env = test_env(MockRemote::default()).await;
        let photo = offline_photo();
        insert_photo(&env, &photo).await;

        let annotation = Annotation {
            id: Uuid::new_v4(),
            photo_id: photo.id,
            geometry: AnnotationGeometry {
                kind: AnnotationKind::Arrow,
                anchor_x: 10.0,
                anchor_y: 20.0,
                properties: None,
            },
            text: Some("broken valve".to_string()),
            status: RecordStatus::PendingUpload,
            remote_id: None,
            created_at: Utc::now(),
            synced_at: None,
        };
        let ann_task = SyncTask::new(EntityKind::Annotation, annotation.id, SyncOperation::Create);
        let mut tx = env.pool.begin().await.unwrap();
        env.annotation_repo
            .create_with_tx(&annotation, &mut tx)
            .await
            .unwrap();
        env.queue_repo.enqueue_with_tx(&ann_task, &mut tx).await.unwrap();
        tx.commit().await.unwrap();

        // While the photo is unsynced the annotation task is not ready.
        let ready = env.queue_repo.find_ready(10, Utc::now()).await.unwrap();
        assert!(ready.iter().all(|t| t.entity_id != annotation.id));

        env.monitor.set_online(true);
        let (_join, handle) = start_worker(&env);

        let repo = env.annotation_repo.clone();
        let id = annotation.id;
        wait_until(|| {
            let repo = repo.clone();
            async move {
                repo.find_by_id(id)
                    .await
                    .map(|a| a.status == RecordStatus::Synced)
                    .unwrap_or(false)
            }
        })
        .await;

        // Both synced; the annotation upload never raced its parent.
        assert_eq!(env.remote.created_annotation_ids.lock().unwrap().len(), 1);
        let photo_row = env.photo_repo.find_by_id(photo.id).await.unwrap();
        assert_eq!(photo_row.status, RecordStatus::Synced);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn delete_without_remote_id_never_calls_the_remote() {
        let env = test_env(MockRemote::default()).await;
        let photo = offline_photo();

        // A delete task against a photo whose create never succeeded.
        let mut tx = env.pool.begin().await.unwrap();
        env.photo_repo
            .create_with_tx(&photo, &[1, 2, 3], &mut tx)
            .await
            .unwrap();
        let delete_task = SyncTask::new(EntityKind::Photo, photo.id, SyncOperation::Delete);
        env.queue_repo
            .enqueue_with_tx(&delete_task, &mut tx)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        env.monitor.set_online(true);
        let (_join, handle) = start_worker(&env);

        let repo = env.photo_repo.clone();
        let id = photo.id;
        wait_until(|| {
            let repo = repo.clone();
            async move { repo.find_by_id(id).await.is_err() }
        })
        .await;

        assert!(env.remote.deleted_remote_ids.lock().unwrap().is_empty());
        assert!(env.remote.created_photo_ids.lock().unwrap().is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_bypasses_backoff_delays() {
        let env = test_env(MockRemote::failing_times(1)).await;
        let photo = offline_photo();
        let task = insert_photo(&env, &photo).await;

        // Park the task deep in retry_wait.
        env.queue_repo
            .mark_retry_wait(
                task.id,
                1,
                Utc::now() + chrono::Duration::hours(1),
                "connection reset",
            )
            .await
            .unwrap();

        // The worker observes the offline → online edge, which releases
        // the waiting task without resetting its attempt counter.
        let (_join, handle) = start_worker(&env);
        env.monitor.set_online(true);

        let repo = env.photo_repo.clone();
        let id = photo.id;
        wait_until(|| {
            let repo = repo.clone();
            async move {
                repo.find_by_id(id)
                    .await
                    .map(|p| p.status == RecordStatus::Synced)
                    .unwrap_or(false)
            }
        })
        .await;

        // Attempt counter survived the bypass.
        let synced = env.queue_repo.find_by_id(task.id).await.unwrap();
        assert!(synced.attempts >= 1);

        handle.shutdown().await;
    }

    #[test]
    fn backoff_grows_and_respects_the_cap() {
        let config = SyncWorkerConfig {
            base_retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(300),
            ..SyncWorkerConfig::default()
        };

        let first = compute_backoff(1, &config);
        assert!(first >= Duration::from_secs(5));
        assert!(first <= Duration::from_millis(7_500));

        let fourth = compute_backoff(4, &config);
        assert!(fourth >= Duration::from_secs(40));

        // Far past the cap, delay stays bounded by max + half jitter.
        let huge = compute_backoff(30, &config);
        assert!(huge <= Duration::from_secs(450));
    }
}
