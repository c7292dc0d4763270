//! Error types for the Depot server

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Storage backend errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Multipart upload not found: {0}")]
    UploadNotFound(String),

    #[error("Multipart upload rejected: {0}")]
    MultipartFailed(String),

    /// The stored part does not match the reference passed to completion
    #[error("Part {part_number} rejected: {reason}")]
    PartRejected { part_number: u32, reason: String },

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 SDK error: {0}")]
    SdkError(String),
}

impl StorageError {
    /// Whether the failure is transient and the call may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) | Self::Timeout(_) | Self::SdkError(_) => true,
            Self::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidInput
            ),
            Self::BucketNotFound(_)
            | Self::UploadNotFound(_)
            | Self::MultipartFailed(_)
            | Self::PartRejected { .. }
            | Self::InvalidKey(_) => false,
        }
    }
}

/// Error response body shared by every route
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            AppError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                match e {
                    StorageError::BucketNotFound(bucket) => {
                        (StatusCode::NOT_FOUND, "NOT_FOUND", format!("Bucket not found: {}", bucket))
                    }
                    StorageError::Timeout(_) => (
                        StatusCode::GATEWAY_TIMEOUT,
                        "STORAGE_TIMEOUT",
                        "Storage backend timed out".to_string(),
                    ),
                    _ => (
                        StatusCode::BAD_GATEWAY,
                        "STORAGE_BACKEND_ERROR",
                        "Storage error".to_string(),
                    ),
                }
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "Database error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code,
            details: None,
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StorageError::SdkError("throttled".into()).is_retryable());
        assert!(StorageError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!StorageError::UploadNotFound("abc".into()).is_retryable());
        assert!(!StorageError::MultipartFailed("bad order".into()).is_retryable());
        assert!(!StorageError::PartRejected {
            part_number: 2,
            reason: "etag".into()
        }
        .is_retryable());

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(!StorageError::Io(missing).is_retryable());
        let interrupted = std::io::Error::new(std::io::ErrorKind::Interrupted, "again");
        assert!(StorageError::Io(interrupted).is_retryable());
    }

    #[test]
    fn test_not_found_status() {
        let response = AppError::NotFound("object".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = AppError::Unauthorized("missing".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_storage_failures_map_to_gateway_statuses() {
        let response = AppError::from(StorageError::Timeout(Duration::from_secs(60))).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let response = AppError::from(StorageError::SdkError("reset".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = AppError::from(sqlx::Error::RowNotFound).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
