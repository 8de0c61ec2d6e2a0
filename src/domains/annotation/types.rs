use crate::domains::sync::types::{parse_datetime, parse_optional_datetime, parse_uuid};
use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::types::RecordStatus;
use crate::validation::Validate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

pub const MAX_ANNOTATION_TEXT_LENGTH: usize = 2_000;

/// Markup kinds supported by the annotation canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Freehand,
    Text,
    Arrow,
    Shape,
}

impl AnnotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationKind::Freehand => "freehand",
            AnnotationKind::Text => "text",
            AnnotationKind::Arrow => "arrow",
            AnnotationKind::Shape => "shape",
        }
    }
}

impl FromStr for AnnotationKind {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "freehand" => Ok(AnnotationKind::Freehand),
            "text" => Ok(AnnotationKind::Text),
            "arrow" => Ok(AnnotationKind::Arrow),
            "shape" => Ok(AnnotationKind::Shape),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid AnnotationKind string: {}",
                s
            )))),
        }
    }
}

/// Where and what the markup is: anchor coordinates in image space plus a
/// free-form properties payload (stroke widths, path points, colors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationGeometry {
    pub kind: AnnotationKind,
    pub anchor_x: f64,
    pub anchor_y: f64,
    pub properties: Option<serde_json::Value>,
}

impl Validate for AnnotationGeometry {
    fn validate(&self) -> DomainResult<()> {
        if !self.anchor_x.is_finite() || !self.anchor_y.is_finite() {
            return Err(DomainError::Validation(ValidationError::invalid_value(
                "geometry.anchor",
                "anchor coordinates must be finite",
            )));
        }
        Ok(())
    }
}

/// User-drawn markup anchored on a photo. Holds a non-owning reference to
/// the photo id; the photo does not own annotation lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: Uuid,
    pub photo_id: Uuid,
    pub geometry: AnnotationGeometry,
    pub text: Option<String>,
    pub status: RecordStatus,
    pub remote_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct AnnotationRow {
    pub id: String,
    pub photo_id: String,
    pub kind: String,
    pub anchor_x: f64,
    pub anchor_y: f64,
    pub properties: Option<String>,
    pub text: Option<String>,
    pub status: String,
    pub remote_id: Option<String>,
    pub created_at: String,
    pub synced_at: Option<String>,
}

impl TryFrom<AnnotationRow> for Annotation {
    type Error = DomainError;
    fn try_from(row: AnnotationRow) -> Result<Self, Self::Error> {
        let properties = row
            .properties
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| {
                    DomainError::Validation(ValidationError::format(
                        "annotations.properties",
                        &format!("invalid JSON: {}", e),
                    ))
                })
            })
            .transpose()?;

        Ok(Self {
            id: parse_uuid(&row.id, "annotations.id")?,
            photo_id: parse_uuid(&row.photo_id, "annotations.photo_id")?,
            geometry: AnnotationGeometry {
                kind: AnnotationKind::from_str(&row.kind)?,
                anchor_x: row.anchor_x,
                anchor_y: row.anchor_y,
                properties,
            },
            text: row.text,
            status: RecordStatus::from_str(&row.status)?,
            remote_id: row.remote_id,
            created_at: parse_datetime(&row.created_at, "annotations.created_at")?,
            synced_at: parse_optional_datetime(row.synced_at, "annotations.synced_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_rejects_non_finite_anchor() {
        let geometry = AnnotationGeometry {
            kind: AnnotationKind::Arrow,
            anchor_x: f64::NAN,
            anchor_y: 0.0,
            properties: None,
        };
        assert!(geometry.validate().is_err());
    }

    #[test]
    fn kind_round_trips() {
        for s in ["freehand", "text", "arrow", "shape"] {
            assert_eq!(AnnotationKind::from_str(s).unwrap().as_str(), s);
        }
        assert!(AnnotationKind::from_str("circle").is_err());
    }
}
