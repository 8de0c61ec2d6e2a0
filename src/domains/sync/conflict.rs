use crate::domains::sync::types::{ConflictReason, SyncOperation};
use crate::errors::RemoteRejection;
use chrono::{DateTime, Utc};

/// What the sync manager should do with a rejected task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDisposition {
    /// Park the entity as `conflict`, append it to the review list and stop
    /// retrying automatically.
    MarkConflict(ConflictReason),
    /// Local write is newer; resubmit the task (normal attempt accounting
    /// still applies).
    RetryLocalWins,
    /// The remote already reflects the intent of this task (e.g. deleting a
    /// record that is already gone); complete it as synced.
    AlreadySatisfied,
}

/// Deterministic policy over structured remote rejections.
///
/// Same rejection + same timestamps always yields the same disposition:
/// missing targets and remote deletes park the entity for review, version
/// races resolve last-write-wins with remote winning exact ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(
        &self,
        operation: SyncOperation,
        rejection: &RemoteRejection,
        local_timestamp: DateTime<Utc>,
    ) -> ConflictDisposition {
        match rejection {
            RemoteRejection::TargetMissing { .. } => {
                // Deleting something already gone is success, not conflict.
                if operation == SyncOperation::Delete {
                    ConflictDisposition::AlreadySatisfied
                } else {
                    ConflictDisposition::MarkConflict(ConflictReason::TargetMissing)
                }
            }
            RemoteRejection::RemoteDeleted { .. } => {
                // Remote wins deletes unconditionally.
                if operation == SyncOperation::Delete {
                    ConflictDisposition::AlreadySatisfied
                } else {
                    ConflictDisposition::MarkConflict(ConflictReason::RemoteDeleted)
                }
            }
            RemoteRejection::VersionMismatch { remote_timestamp } => {
                if operation == SyncOperation::Delete {
                    return ConflictDisposition::MarkConflict(ConflictReason::VersionMismatch);
                }
                if local_timestamp > *remote_timestamp {
                    ConflictDisposition::RetryLocalWins
                } else {
                    // Remote newer, or an exact tie: remote wins.
                    ConflictDisposition::MarkConflict(ConflictReason::VersionMismatch)
                }
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn target_missing_parks_creates() {
        let resolver = ConflictResolver::new();
        let rejection = RemoteRejection::TargetMissing { detail: None };
        assert_eq!(
            resolver.resolve(SyncOperation::Create, &rejection, ts(100)),
            ConflictDisposition::MarkConflict(ConflictReason::TargetMissing)
        );
    }

    #[test]
    fn deleting_a_missing_target_is_satisfied() {
        let resolver = ConflictResolver::new();
        let rejection = RemoteRejection::TargetMissing { detail: None };
        assert_eq!(
            resolver.resolve(SyncOperation::Delete, &rejection, ts(100)),
            ConflictDisposition::AlreadySatisfied
        );
    }

    #[test]
    fn newer_local_write_wins_version_race() {
        let resolver = ConflictResolver::new();
        let rejection = RemoteRejection::VersionMismatch {
            remote_timestamp: ts(50),
        };
        assert_eq!(
            resolver.resolve(SyncOperation::Update, &rejection, ts(100)),
            ConflictDisposition::RetryLocalWins
        );
    }

    #[test]
    fn older_local_write_loses_version_race() {
        let resolver = ConflictResolver::new();
        let rejection = RemoteRejection::VersionMismatch {
            remote_timestamp: ts(200),
        };
        assert_eq!(
            resolver.resolve(SyncOperation::Update, &rejection, ts(100)),
            ConflictDisposition::MarkConflict(ConflictReason::VersionMismatch)
        );
    }

    #[test]
    fn timestamp_tie_goes_to_remote() {
        let resolver = ConflictResolver::new();
        let rejection = RemoteRejection::VersionMismatch {
            remote_timestamp: ts(100),
        };
        assert_eq!(
            resolver.resolve(SyncOperation::Update, &rejection, ts(100)),
            ConflictDisposition::MarkConflict(ConflictReason::VersionMismatch)
        );
    }

    #[test]
    fn remote_delete_wins_unconditionally() {
        let resolver = ConflictResolver::new();
        let rejection = RemoteRejection::RemoteDeleted {
            remote_timestamp: Some(ts(1)),
        };
        // Even a much newer local update loses to a remote delete.
        assert_eq!(
            resolver.resolve(SyncOperation::Update, &rejection, ts(1_000_000)),
            ConflictDisposition::MarkConflict(ConflictReason::RemoteDeleted)
        );
    }

    #[test]
    fn disposition_is_deterministic() {
        let resolver = ConflictResolver::new();
        let rejection = RemoteRejection::VersionMismatch {
            remote_timestamp: ts(100),
        };
        let first = resolver.resolve(SyncOperation::Update, &rejection, ts(100));
        for _ in 0..10 {
            assert_eq!(
                resolver.resolve(SyncOperation::Update, &rejection, ts(100)),
                first
            );
        }
    }
}
