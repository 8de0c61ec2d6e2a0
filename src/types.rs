use crate::errors::{DomainError, ValidationError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Sync lifecycle status shared by photos and annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Captured locally, create task not yet attempted
    PendingUpload,
    /// Waiting on a retry delay
    Queued,
    /// A sync task for this record is in flight
    Syncing,
    Synced,
    Failed,
    Conflict,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::PendingUpload => "pending_upload",
            RecordStatus::Queued => "queued",
            RecordStatus::Syncing => "syncing",
            RecordStatus::Synced => "synced",
            RecordStatus::Failed => "failed",
            RecordStatus::Conflict => "conflict",
        }
    }

    /// Terminal states require explicit user action (retry or discard)
    /// before the record moves again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Failed | RecordStatus::Conflict)
    }
}

impl FromStr for RecordStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_upload" => Ok(RecordStatus::PendingUpload),
            "queued" => Ok(RecordStatus::Queued),
            "syncing" => Ok(RecordStatus::Syncing),
            "synced" => Ok(RecordStatus::Synced),
            "failed" => Ok(RecordStatus::Failed),
            "conflict" => Ok(RecordStatus::Conflict),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid RecordStatus string: {}",
                s
            )))),
        }
    }
}

impl From<RecordStatus> for String {
    fn from(status: RecordStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Geographic coordinate attached to a capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Local store usage snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
}

impl StorageUsage {
    pub fn available_bytes(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.used_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_status_round_trips() {
        for s in [
            "pending_upload",
            "queued",
            "syncing",
            "synced",
            "failed",
            "conflict",
        ] {
            assert_eq!(RecordStatus::from_str(s).unwrap().as_str(), s);
        }
        assert!(RecordStatus::from_str("uploading").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(RecordStatus::Failed.is_terminal());
        assert!(RecordStatus::Conflict.is_terminal());
        assert!(!RecordStatus::Syncing.is_terminal());
    }
}
