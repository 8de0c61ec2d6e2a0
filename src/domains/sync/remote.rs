use crate::domains::annotation::types::Annotation;
use crate::domains::photo::types::CapturedPhoto;
use crate::errors::{RemoteRejection, SyncError, SyncResult};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Remote store consumed by the sync manager.
///
/// Every call carries the entity's client-generated id as an idempotency
/// key, so a retry after a lost response never creates a duplicate remote
/// record. A 409-class response surfaces as a structured rejection for the
/// conflict resolver; any other failure is transient.
#[async_trait]
pub trait RemoteSyncApi: Send + Sync {
    /// Upload a photo; returns the remote identifier.
    async fn create_photo(&self, photo: &CapturedPhoto, blob: &[u8]) -> SyncResult<String>;

    /// Upload an annotation for an already-synced photo; returns the remote
    /// identifier.
    async fn create_annotation(
        &self,
        annotation: &Annotation,
        photo_remote_id: &str,
    ) -> SyncResult<String>;

    async fn delete_photo(&self, remote_id: &str, idempotency_key: Uuid) -> SyncResult<()>;

    async fn delete_annotation(&self, remote_id: &str, idempotency_key: Uuid) -> SyncResult<()>;
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

/// HTTP implementation backed by the maintenance backend.
pub struct HttpRemoteSyncApi {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpRemoteSyncApi {
    pub fn new(base_url: &str, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> SyncError {
        if e.is_timeout() {
            SyncError::Timeout(self.request_timeout.as_secs())
        } else {
            SyncError::Network(e.to_string())
        }
    }

    /// Triage a non-2xx response: 409/410 carry a structured rejection,
    /// everything else is transient and will be retried.
    async fn rejection_or_transient(
        response: Response,
        entity_kind: &str,
        entity_id: Uuid,
    ) -> SyncError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status == StatusCode::CONFLICT || status == StatusCode::GONE {
            let rejection = serde_json::from_str::<RemoteRejection>(&body).unwrap_or_else(|_| {
                warn!(
                    "Unparseable rejection body for {} {}: {}",
                    entity_kind, entity_id, body
                );
                RemoteRejection::TargetMissing {
                    detail: Some(body.clone()),
                }
            });
            return SyncError::Rejected {
                entity_kind: entity_kind.to_string(),
                entity_id,
                rejection,
            };
        }

        if status.is_server_error() {
            SyncError::ServerError(format!("{}: {}", status, body))
        } else {
            SyncError::Network(format!("{}: {}", status, body))
        }
    }
}

#[async_trait]
impl RemoteSyncApi for HttpRemoteSyncApi {
    async fn create_photo(&self, photo: &CapturedPhoto, blob: &[u8]) -> SyncResult<String> {
        debug!("Uploading photo {} ({} bytes)", photo.id, blob.len());

        let metadata = json!({
            "client_id": photo.id,
            "checksum": photo.checksum,
            "purpose": photo.purpose,
            "location": photo.location,
            "created_at": photo.created_at,
        });

        let part = Part::bytes(blob.to_vec())
            .file_name(format!("{}.jpg", photo.id))
            .mime_str(&photo.mime_type)
            .map_err(|e| SyncError::Other(format!("invalid mime type: {}", e)))?;

        let form = Form::new()
            .part("photo", part)
            .text("metadata", metadata.to_string());

        let response = self
            .client
            .post(format!("{}/photos", self.base_url))
            .header(IDEMPOTENCY_HEADER, photo.id.to_string())
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            let created = response
                .json::<CreatedResponse>()
                .await
                .map_err(|e| SyncError::ServerError(format!("invalid create response: {}", e)))?;
            Ok(created.id)
        } else {
            Err(Self::rejection_or_transient(response, "photo", photo.id).await)
        }
    }

    async fn create_annotation(
        &self,
        annotation: &Annotation,
        photo_remote_id: &str,
    ) -> SyncResult<String> {
        debug!(
            "Uploading annotation {} for remote photo {}",
            annotation.id, photo_remote_id
        );

        let body = json!({
            "client_id": annotation.id,
            "kind": annotation.geometry.kind.as_str(),
            "position": { "x": annotation.geometry.anchor_x, "y": annotation.geometry.anchor_y },
            "properties": annotation.geometry.properties,
            "text": annotation.text,
            "created_at": annotation.created_at,
        });

        let response = self
            .client
            .post(format!(
                "{}/photos/{}/annotations",
                self.base_url, photo_remote_id
            ))
            .header(IDEMPOTENCY_HEADER, annotation.id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            let created = response
                .json::<CreatedResponse>()
                .await
                .map_err(|e| SyncError::ServerError(format!("invalid create response: {}", e)))?;
            Ok(created.id)
        } else {
            Err(Self::rejection_or_transient(response, "annotation", annotation.id).await)
        }
    }

    async fn delete_photo(&self, remote_id: &str, idempotency_key: Uuid) -> SyncResult<()> {
        debug!("Deleting remote photo {}", remote_id);

        let response = self
            .client
            .delete(format!("{}/photos/{}", self.base_url, remote_id))
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::rejection_or_transient(response, "photo", idempotency_key).await)
        }
    }

    async fn delete_annotation(&self, remote_id: &str, idempotency_key: Uuid) -> SyncResult<()> {
        debug!("Deleting remote annotation {}", remote_id);

        let response = self
            .client
            .delete(format!("{}/annotations/{}", self.base_url, remote_id))
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::rejection_or_transient(response, "annotation", idempotency_key).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_body_round_trips() {
        let body = r#"{"reason":"version_mismatch","remote_timestamp":"2026-01-01T00:00:00Z"}"#;
        let rejection: RemoteRejection = serde_json::from_str(body).unwrap();
        assert!(matches!(rejection, RemoteRejection::VersionMismatch { .. }));

        let body = r#"{"reason":"target_missing","detail":"equipment 17 deleted"}"#;
        let rejection: RemoteRejection = serde_json::from_str(body).unwrap();
        assert!(matches!(rejection, RemoteRejection::TargetMissing { .. }));
    }
}
