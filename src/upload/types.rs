//! Upload types for chunked, resumable uploads

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage::{CompletedObject, MultipartHandle, PartReference};

// ============================================================================
// Constants
// ============================================================================

/// Default chunk size: 5MB (the smallest non-final S3 part)
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum chunk size: 64MB
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum file size: 50GB
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024 * 1024;

/// Maximum parts per multipart upload
pub const MAX_PARTS: u64 = 10_000;

/// Session expiry time: 24 hours
pub const SESSION_EXPIRY_HOURS: i64 = 24;

/// How long a completed session keeps its result: 1 hour
pub const COMPLETED_RETENTION_SECS: i64 = 3600;

/// Number of chunks needed to cover `size` bytes
pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size)
}

// ============================================================================
// Initiate Types
// ============================================================================

/// Request to initiate a chunked upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    /// Original file name
    pub file_name: String,

    /// Total file size in bytes
    pub size: u64,

    /// MIME type of the file (guessed from the name when empty)
    #[serde(default)]
    pub mime_type: String,

    /// Optional: chunk size (defaults to the configured size)
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

/// Response to an initiate request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub session_id: Uuid,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Chunk Types
// ============================================================================

/// One accepted chunk of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    /// 0-based chunk index
    pub index: u64,
    pub size: u64,
    /// Hex SHA-256 of the chunk bytes
    pub digest: String,
    pub part: PartReference,
    pub accepted_at: DateTime<Utc>,
}

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub chunk_index: u64,
    pub part_reference: PartReference,
    pub accepted: bool,
    /// True when the chunk had already been accepted with the same digest
    pub duplicate: bool,
    pub chunks_received: u64,
    pub total_chunks: u64,
    pub complete: bool,
}

/// A chunk the client still has to send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingChunk {
    pub chunk_index: u64,
    /// First byte offset of the chunk
    pub start: u64,
    /// One past the last byte offset
    pub end: u64,
    pub expected_size: u64,
}

// ============================================================================
// Finalize Types
// ============================================================================

/// Response after finalizing an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub object_id: String,
    pub object_key: String,
    pub etag: String,
    pub size: u64,
}

/// Upload progress for status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub session_id: Uuid,
    pub file_name: String,
    pub size: u64,
    pub status: SessionStatus,
    pub chunk_size: u64,
    pub chunks_received: u64,
    pub total_chunks: u64,
    pub bytes_received: u64,
    pub progress: f64,
    pub missing: Vec<u64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<FinalizeResponse>,
}

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Unique session ID
    pub id: Uuid,

    /// Owning user
    pub user_id: String,

    /// Original file name
    pub file_name: String,

    /// Declared total size in bytes
    pub file_size: u64,

    /// MIME type
    pub mime_type: String,

    /// Chunk size used for this upload
    pub chunk_size: u64,

    /// ceil(file_size / chunk_size)
    pub total_chunks: u64,

    /// Backend key the object is assembled under
    pub object_key: String,

    /// Backend multipart upload id
    pub multipart_upload_id: String,

    /// Accepted chunks keyed by index
    pub chunks: BTreeMap<u64, ChunkRecord>,

    /// Current status
    pub status: SessionStatus,

    /// Session creation time
    pub created_at: DateTime<Utc>,

    /// Last mutation time
    pub updated_at: DateTime<Utc>,

    /// Session expiry time
    pub expires_at: DateTime<Utc>,

    /// When the current finalize claim was taken
    #[serde(default)]
    pub finalize_started_at: Option<DateTime<Utc>>,

    /// Object produced by backend completion. Once set, a retried finalize
    /// uses it instead of completing the multipart upload again.
    #[serde(default)]
    pub assembled: Option<CompletedObject>,

    /// Whether finalize has already charged the object to the user's quota
    #[serde(default)]
    pub quota_charged: bool,

    /// Finalize outcome, kept while a completed session is retained
    #[serde(default)]
    pub result: Option<FinalizeResponse>,

    /// Optimistic concurrency version, bumped on every stored mutation
    pub version: u64,
}

impl UploadSession {
    /// Create a new upload session around an open multipart handle
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        user_id: &str,
        file_name: &str,
        file_size: u64,
        mime_type: &str,
        chunk_size: u64,
        handle: MultipartHandle,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();

        Self {
            id,
            user_id: user_id.to_string(),
            file_name: file_name.to_string(),
            file_size,
            mime_type: mime_type.to_string(),
            chunk_size,
            total_chunks: chunk_count(file_size, chunk_size),
            object_key: handle.object_key,
            multipart_upload_id: handle.upload_id,
            chunks: BTreeMap::new(),
            status: SessionStatus::Initiated,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            finalize_started_at: None,
            assembled: None,
            quota_charged: false,
            result: None,
            version: 0,
        }
    }

    /// Check if session has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Backend handle for this session's multipart upload
    pub fn multipart_handle(&self) -> MultipartHandle {
        MultipartHandle {
            object_key: self.object_key.clone(),
            upload_id: self.multipart_upload_id.clone(),
        }
    }

    pub fn accepted_count(&self) -> u64 {
        self.chunks.len() as u64
    }

    /// Check if all chunks have been received
    pub fn is_complete(&self) -> bool {
        self.accepted_count() == self.total_chunks
    }

    /// Sum of accepted chunk sizes
    pub fn bytes_received(&self) -> u64 {
        self.chunks.values().map(|c| c.size).sum()
    }

    /// Expected byte length of chunk `index`
    pub fn expected_chunk_size(&self, index: u64) -> u64 {
        if index + 1 == self.total_chunks {
            self.file_size - (self.total_chunks - 1) * self.chunk_size
        } else {
            self.chunk_size
        }
    }

    /// Calculate progress percentage
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        (self.accepted_count() as f64 / self.total_chunks as f64) * 100.0
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, no chunk accepted yet
    Initiated,
    /// Receiving chunks
    Uploading,
    /// A finalize call owns the session
    Finalizing,
    /// Object assembled and registered
    Completed,
    /// Cancelled by the user or the system
    Aborted,
    /// TTL elapsed before finalize
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Uploading => "uploading",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        }
    }

    /// Whether chunks may still be accepted
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, Self::Initiated | Self::Uploading)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Quota exceeded: {required} bytes required, {available} available")]
    QuotaExceeded {
        required: u64,
        available: u64,
        used: u64,
        limit: u64,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Cannot {operation} session {session_id} in state {status}")]
    InvalidState {
        session_id: String,
        status: SessionStatus,
        operation: &'static str,
    },

    #[error("Chunk index out of range: {index} (total chunks: {total_chunks})")]
    IndexOutOfRange { index: u64, total_chunks: u64 },

    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch { index: u64, expected: u64, actual: u64 },

    #[error("Chunk {index} digest mismatch: claimed {claimed}, computed {actual}")]
    ChunkIntegrityError {
        index: u64,
        claimed: String,
        actual: String,
    },

    #[error("Upload incomplete, missing chunks: {missing:?}")]
    IncompleteUpload { missing: Vec<u64> },

    #[error("Assembled object is {actual} bytes, declared {declared}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session {0} is being updated concurrently, retry")]
    SessionContention(String),

    #[error("Storage backend error: {0}")]
    StorageBackendError(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::IndexOutOfRange { .. } => StatusCode::BAD_REQUEST,
            Self::ChunkSizeMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::ChunkIntegrityError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::IncompleteUpload { .. } => StatusCode::CONFLICT,
            Self::SizeMismatch { .. } => StatusCode::CONFLICT,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::SessionContention(_) => StatusCode::CONFLICT,
            Self::StorageBackendError(StorageError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Self::StorageBackendError(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::IndexOutOfRange { .. } => "INDEX_OUT_OF_RANGE",
            Self::ChunkSizeMismatch { .. } => "CHUNK_SIZE_MISMATCH",
            Self::ChunkIntegrityError { .. } => "CHUNK_INTEGRITY_ERROR",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::SizeMismatch { .. } => "SIZE_MISMATCH",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::SessionContention(_) => "SESSION_CONTENTION",
            Self::StorageBackendError(_) => "STORAGE_BACKEND_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Structured detail a client can act on
    pub fn details(&self) -> Option<serde_json::Value> {
        use serde_json::json;
        match self {
            Self::QuotaExceeded {
                required,
                available,
                used,
                limit,
            } => Some(json!({
                "required": required,
                "available": available,
                "used": used,
                "limit": limit,
            })),
            Self::InvalidState { status, operation, .. } => Some(json!({
                "status": status,
                "operation": operation,
            })),
            Self::IndexOutOfRange { index, total_chunks } => Some(json!({
                "index": index,
                "validRange": [0, total_chunks.saturating_sub(1)],
                "totalChunks": total_chunks,
            })),
            Self::ChunkSizeMismatch { index, expected, actual } => Some(json!({
                "index": index,
                "expected": expected,
                "actual": actual,
            })),
            Self::ChunkIntegrityError { index, claimed, actual } => Some(json!({
                "index": index,
                "claimed": claimed,
                "computed": actual,
            })),
            Self::IncompleteUpload { missing } => Some(json!({ "missing": missing })),
            Self::SizeMismatch { declared, actual } => Some(json!({
                "declared": declared,
                "actual": actual,
            })),
            Self::StorageBackendError(StorageError::PartRejected { part_number, .. }) => Some(json!({
                "retryable": false,
                "partNumber": part_number,
                "chunkIndex": part_number.saturating_sub(1),
            })),
            Self::StorageBackendError(e) => Some(json!({ "retryable": e.is_retryable() })),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
