use crate::domains::sync::types::{parse_datetime, parse_optional_datetime, parse_uuid};
use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::types::{GeoPoint, RecordStatus};
use crate::validation::{Validate, ValidationBuilder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

pub const MAX_PURPOSE_LENGTH: usize = 255;

/// A locally captured photo. The blob itself is loaded separately through
/// the repository so listings stay cheap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedPhoto {
    pub id: Uuid,
    /// sha256 of the stored (compressed) blob, hex-encoded.
    pub checksum: String,
    pub mime_type: String,
    pub byte_size: i64,
    /// Set when the blob was dropped to reclaim quota. Only synced photos
    /// are ever evicted.
    pub blob_evicted: bool,
    pub location: Option<GeoPoint>,
    pub purpose: Option<String>,
    pub status: RecordStatus,
    pub remote_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Caller-supplied metadata for a capture.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub location: Option<GeoPoint>,
    /// Free-form tag describing the intended downstream use
    /// (e.g. "equipment_condition", "work_order_evidence").
    pub purpose: Option<String>,
}

impl Validate for CaptureMetadata {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("purpose", self.purpose.clone())
            .max_length(MAX_PURPOSE_LENGTH)
            .not_blank()
            .validate()?;

        if let Some(loc) = &self.location {
            ValidationBuilder::new("location.latitude", Some(loc.latitude))
                .range(-90.0, 90.0)
                .validate()?;
            ValidationBuilder::new("location.longitude", Some(loc.longitude))
                .range(-180.0, 180.0)
                .validate()?;
        }

        Ok(())
    }
}

/// Output limits for the capture compression pass.
#[derive(Debug, Clone)]
pub struct CompressionSettings {
    /// Byte ceiling for the stored blob.
    pub max_bytes: usize,
    /// Longest edge after downscaling.
    pub max_dimension: u32,
    /// JPEG qualities tried in order until the ceiling is met.
    pub quality_steps: Vec<u8>,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            max_bytes: 1_000_000,
            max_dimension: 2048,
            quality_steps: vec![85, 75, 65, 50, 40],
        }
    }
}

/// Events published by the capture pipeline for the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CaptureEvent {
    Captured { photo_id: Uuid },
    Deleted { photo_id: Uuid },
}

/// How a raw image acquisition can fail before the pipeline sees bytes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CaptureSourceError {
    #[error("access denied: {0}")]
    PermissionDenied(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Camera or file-picker abstraction owned by the host shell.
#[async_trait::async_trait]
pub trait CaptureSource: Send + Sync {
    async fn acquire(&self) -> Result<Vec<u8>, CaptureSourceError>;
}

#[derive(Debug, Clone, FromRow)]
pub struct PhotoRow {
    pub id: String,
    pub checksum: String,
    pub mime_type: String,
    pub byte_size: i64,
    pub blob_evicted: i64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub purpose: Option<String>,
    pub status: String,
    pub remote_id: Option<String>,
    pub created_at: String,
    pub synced_at: Option<String>,
}

impl TryFrom<PhotoRow> for CapturedPhoto {
    type Error = DomainError;
    fn try_from(row: PhotoRow) -> Result<Self, Self::Error> {
        let location = match (row.latitude, row.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint {
                latitude,
                longitude,
            }),
            (None, None) => None,
            _ => {
                return Err(DomainError::Validation(ValidationError::entity(
                    "photo location must carry both latitude and longitude",
                )))
            }
        };

        Ok(Self {
            id: parse_uuid(&row.id, "photos.id")?,
            checksum: row.checksum,
            mime_type: row.mime_type,
            byte_size: row.byte_size,
            blob_evicted: row.blob_evicted != 0,
            location,
            purpose: row.purpose,
            status: RecordStatus::from_str(&row.status)?,
            remote_id: row.remote_id,
            created_at: parse_datetime(&row.created_at, "photos.created_at")?,
            synced_at: parse_optional_datetime(row.synced_at, "photos.synced_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_rejects_out_of_range_location() {
        let meta = CaptureMetadata {
            location: Some(GeoPoint {
                latitude: 120.0,
                longitude: 0.0,
            }),
            purpose: None,
        };
        assert!(meta.validate().is_err());
    }

    #[test]
    fn metadata_rejects_blank_purpose() {
        let meta = CaptureMetadata {
            location: None,
            purpose: Some("   ".to_string()),
        };
        assert!(meta.validate().is_err());
    }

    #[test]
    fn row_requires_paired_coordinates() {
        let row = PhotoRow {
            id: Uuid::new_v4().to_string(),
            checksum: "abc".to_string(),
            mime_type: "image/jpeg".to_string(),
            byte_size: 10,
            blob_evicted: 0,
            latitude: Some(1.0),
            longitude: None,
            purpose: None,
            status: "pending_upload".to_string(),
            remote_id: None,
            created_at: Utc::now().to_rfc3339(),
            synced_at: None,
        };
        assert!(CapturedPhoto::try_from(row).is_err());
    }
}
