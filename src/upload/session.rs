//! Upload Session Manager
//!
//! Owns the session lifecycle:
//! - Initiate behind a quota check, opening a backend multipart upload
//! - Idempotent chunk acceptance with per-session optimistic versioning
//! - Abort and the background sweep of expired sessions

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::UploadConfig;
use crate::quota::QuotaService;
use crate::storage::{MultipartHandle, RetryPolicy, StorageAdapter};

use super::digest::verify_chunk;
use super::resume;
use super::store::SessionStore;
use super::types::{
    chunk_count, ChunkRecord, ChunkUploadResponse, InitiateRequest, InitiateResponse, MissingChunk,
    SessionStatus, SessionStatusResponse, UploadError, UploadSession,
};

/// Compare-and-swap attempts before a mutation gives up
const MAX_UPDATE_ATTEMPTS: usize = 16;

/// Expired sessions handled per sweep pass
const SWEEP_BATCH: usize = 500;

/// Result of applying a change to a freshly loaded session
pub(crate) enum Mutation<T> {
    /// Persist the modified session, then return the value
    Commit(T),
    /// Nothing to persist
    Skip(T),
}

// ============================================================================
// Session Manager
// ============================================================================

/// Manages upload sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    store: Arc<dyn SessionStore>,
    storage: Arc<dyn StorageAdapter>,
    quota: QuotaService,
    config: UploadConfig,
    retry: RetryPolicy,
    /// Wall-clock bound on one finalize; a claim twice this old is stale
    finalize_budget: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        storage: Arc<dyn StorageAdapter>,
        quota: QuotaService,
        config: UploadConfig,
        retry: RetryPolicy,
        finalize_budget: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                store,
                storage,
                quota,
                config,
                retry,
                finalize_budget,
            }),
        }
    }

    pub(crate) fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.inner.storage
    }

    pub(crate) fn quota(&self) -> &QuotaService {
        &self.inner.quota
    }

    pub(crate) fn retry(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub(crate) fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    pub(crate) fn finalize_budget(&self) -> Duration {
        self.inner.finalize_budget
    }

    /// Whether a finalize claim on `session` was abandoned by its owner
    pub(crate) fn claim_is_stale(&self, session: &UploadSession, now: DateTime<Utc>) -> bool {
        let Some(started) = session.finalize_started_at else {
            return true;
        };
        let limit = chrono::Duration::from_std(self.inner.finalize_budget * 2)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        now - started > limit
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Create a new upload session
    pub async fn initiate(
        &self,
        user_id: &str,
        request: &InitiateRequest,
    ) -> Result<InitiateResponse, UploadError> {
        let config = &self.inner.config;
        let file_name = request.file_name.trim();
        let chunk_size = request.chunk_size.unwrap_or(config.default_chunk_size);

        if file_name.is_empty() {
            return Err(UploadError::InvalidRequest("fileName must not be empty".into()));
        }
        if request.size == 0 {
            return Err(UploadError::InvalidRequest("size must be greater than 0".into()));
        }
        if chunk_size == 0 {
            return Err(UploadError::InvalidRequest("chunkSize must be greater than 0".into()));
        }
        if chunk_size > config.max_chunk_size {
            return Err(UploadError::InvalidRequest(format!(
                "chunkSize {} exceeds the maximum of {}",
                chunk_size, config.max_chunk_size
            )));
        }
        if request.size > config.max_file_size {
            return Err(UploadError::InvalidRequest(format!(
                "size {} exceeds the maximum of {}",
                request.size, config.max_file_size
            )));
        }
        let total_chunks = chunk_count(request.size, chunk_size);
        if total_chunks > config.max_parts {
            return Err(UploadError::InvalidRequest(format!(
                "{} chunks exceeds the maximum of {} parts, use a chunkSize of at least {}",
                total_chunks,
                config.max_parts,
                request.size.div_ceil(config.max_parts)
            )));
        }

        let check = self.inner.quota.check_quota(user_id, request.size).await?;
        if !check.has_quota {
            tracing::info!(
                user_id,
                required = check.required,
                available = check.available,
                "Upload refused by quota"
            );
            return Err(UploadError::QuotaExceeded {
                required: check.required,
                available: check.available,
                used: check.used,
                limit: check.limit,
            });
        }

        let mime_type = if request.mime_type.trim().is_empty() {
            mime_guess::from_path(file_name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        } else {
            request.mime_type.trim().to_string()
        };

        let id = Uuid::new_v4();
        let object_key = object_key(user_id, id, file_name);
        let storage = &self.inner.storage;
        let handle = self
            .inner
            .retry
            .run("initiate_multipart", || storage.initiate_multipart(&object_key, &mime_type))
            .await?;

        let session = UploadSession::new(
            id,
            user_id,
            file_name,
            request.size,
            &mime_type,
            chunk_size,
            handle.clone(),
            config.session_ttl(),
        );

        if let Err(e) = self.inner.store.insert(&session).await {
            // Don't leave an unreachable multipart upload behind
            if let Err(abort_err) = storage.abort_multipart(&handle).await {
                tracing::warn!(session_id = %id, error = %abort_err, "Failed to abort orphaned multipart upload");
            }
            return Err(e);
        }

        tracing::info!(
            session_id = %id,
            user_id,
            file_name = %session.file_name,
            file_size = session.file_size,
            chunk_size,
            total_chunks,
            backend = storage.name(),
            "Created upload session"
        );

        Ok(InitiateResponse {
            session_id: id,
            chunk_size,
            total_chunks,
            expires_at: session.expires_at,
        })
    }

    /// Get a live session by ID
    pub async fn get_session(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))
    }

    /// Progress, missing indices and, once completed, the finalize result
    pub async fn status(&self, id: Uuid) -> Result<SessionStatusResponse, UploadError> {
        let session = self.get_session(id).await?;

        Ok(SessionStatusResponse {
            session_id: session.id,
            file_name: session.file_name.clone(),
            size: session.file_size,
            status: session.status,
            chunk_size: session.chunk_size,
            chunks_received: session.accepted_count(),
            total_chunks: session.total_chunks,
            bytes_received: session.bytes_received(),
            progress: session.progress(),
            missing: resume::missing_indices(&session),
            created_at: session.created_at,
            expires_at: session.expires_at,
            result: session.result.clone(),
        })
    }

    /// Chunks the client still has to send, with their byte ranges
    pub async fn compute_missing(&self, id: Uuid) -> Result<Vec<MissingChunk>, UploadError> {
        let session = self.get_session(id).await?;
        Ok(resume::compute_missing(&session))
    }

    // ========================================================================
    // Chunk Acceptance
    // ========================================================================

    /// Verify and store one chunk.
    ///
    /// Re-sending an accepted chunk with the same digest returns the recorded
    /// part without calling the backend again.
    pub async fn accept_chunk(
        &self,
        id: Uuid,
        index: u64,
        data: &[u8],
        claimed_digest: &str,
    ) -> Result<ChunkUploadResponse, UploadError> {
        let session = self.get_session(id).await?;
        ensure_accepts_chunks(&session)?;

        if index >= session.total_chunks {
            return Err(UploadError::IndexOutOfRange {
                index,
                total_chunks: session.total_chunks,
            });
        }

        let expected = session.expected_chunk_size(index);
        if data.len() as u64 != expected {
            return Err(UploadError::ChunkSizeMismatch {
                index,
                expected,
                actual: data.len() as u64,
            });
        }

        let digest = verify_chunk(index, data, claimed_digest)?;

        if let Some(existing) = session.chunks.get(&index) {
            if existing.digest == digest {
                tracing::debug!(session_id = %id, chunk_index = index, "Duplicate chunk ignored");
                return Ok(chunk_response(&session, existing, true));
            }
        }

        let handle = session.multipart_handle();
        let part_number = part_number(index)?;
        let storage = &self.inner.storage;
        let part = self
            .inner
            .retry
            .run("upload_part", || storage.upload_part(&handle, part_number, data))
            .await?;

        let record = ChunkRecord {
            index,
            size: expected,
            digest,
            part,
            accepted_at: Utc::now(),
        };

        let response = self
            .mutate(id, |session| {
                ensure_accepts_chunks(session)?;

                if let Some(existing) = session.chunks.get(&index) {
                    if existing.digest == record.digest {
                        return Ok(Mutation::Skip(chunk_response(session, existing, true)));
                    }
                }

                session.chunks.insert(index, record.clone());
                session.status = SessionStatus::Uploading;
                Ok(Mutation::Commit(chunk_response(session, &record, false)))
            })
            .await?;

        tracing::debug!(
            session_id = %id,
            chunk_index = index,
            part_number,
            duplicate = response.duplicate,
            chunks_received = response.chunks_received,
            total_chunks = response.total_chunks,
            "Accepted chunk"
        );

        Ok(response)
    }

    // ========================================================================
    // Abort and Expiry
    // ========================================================================

    /// Cancel a session and discard its uploaded parts.
    ///
    /// Aborting a missing or already-aborted session succeeds.
    pub async fn abort(&self, id: Uuid) -> Result<(), UploadError> {
        let now = Utc::now();
        let claimed = self
            .mutate(id, |session| match session.status {
                SessionStatus::Completed => Err(invalid_state(session, "abort")),
                SessionStatus::Finalizing if !self.claim_is_stale(session, now) => {
                    Err(invalid_state(session, "abort"))
                }
                SessionStatus::Aborted | SessionStatus::Expired => Ok(Mutation::Skip(None)),
                _ => {
                    session.status = SessionStatus::Aborted;
                    // Hidden from readers at once; the sweep finishes the job
                    // if the backend abort below fails
                    session.expires_at = now;
                    Ok(Mutation::Commit(Some(session.multipart_handle())))
                }
            })
            .await;

        let handle = match claimed {
            Ok(Some(handle)) => handle,
            Ok(None) | Err(UploadError::SessionNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        match self.discard(id, &handle).await {
            Ok(()) => tracing::info!(session_id = %id, "Upload session aborted"),
            Err(e) => tracing::warn!(
                session_id = %id,
                error = %e,
                "Backend abort failed, left for the expiry sweep"
            ),
        }

        Ok(())
    }

    /// Abort the backend upload and drop the session record
    async fn discard(&self, id: Uuid, handle: &MultipartHandle) -> Result<(), UploadError> {
        let storage = &self.inner.storage;
        self.inner
            .retry
            .run("abort_multipart", || storage.abort_multipart(handle))
            .await?;
        self.inner.store.delete(id).await?;
        Ok(())
    }

    /// Clean up expired sessions
    ///
    /// Returns the number of session records removed
    pub async fn cleanup_expired(&self) -> Result<usize, UploadError> {
        let now = Utc::now();
        let expired = self.inner.store.list_expired(now, SWEEP_BATCH).await?;
        let mut removed = 0;

        for mut session in expired {
            let id = session.id;

            match session.status {
                SessionStatus::Completed => {
                    if self.inner.store.delete(id).await? {
                        removed += 1;
                    }
                    continue;
                }
                SessionStatus::Finalizing if !self.claim_is_stale(&session, now) => continue,
                SessionStatus::Aborted | SessionStatus::Expired => {}
                _ => {
                    let expected = session.version;
                    session.status = SessionStatus::Expired;
                    session.version += 1;
                    session.updated_at = now;
                    if !self.inner.store.update(&session, expected).await? {
                        // Touched concurrently; look again next pass
                        continue;
                    }
                }
            }

            match self.discard(id, &session.multipart_handle()).await {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!(
                        session_id = %id,
                        file_name = %session.file_name,
                        "Cleaned up expired session"
                    );
                }
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to clean up expired session"),
            }
        }

        if removed > 0 {
            tracing::info!(count = removed, "Cleaned up expired upload sessions");
        }

        Ok(removed)
    }

    /// Start background cleanup task
    pub fn start_cleanup_task(self) -> tokio::task::JoinHandle<()> {
        let period = self.inner.config.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;
                if let Err(e) = self.cleanup_expired().await {
                    tracing::error!(error = %e, "Expired session sweep failed");
                }
            }
        })
    }

    // ========================================================================
    // Versioned Updates
    // ========================================================================

    /// Load the session, apply `change`, and store it if the version is
    /// unchanged. Reloads and reapplies on conflict.
    pub(crate) async fn mutate<T, F>(&self, id: Uuid, mut change: F) -> Result<T, UploadError>
    where
        F: FnMut(&mut UploadSession) -> Result<Mutation<T>, UploadError> + Send,
        T: Send,
    {
        for attempt in 0..MAX_UPDATE_ATTEMPTS {
            let mut session = self.get_session(id).await?;
            let expected = session.version;

            let value = match change(&mut session)? {
                Mutation::Skip(value) => return Ok(value),
                Mutation::Commit(value) => value,
            };

            session.version = expected + 1;
            session.updated_at = Utc::now();
            if self.inner.store.update(&session, expected).await? {
                return Ok(value);
            }

            tracing::debug!(session_id = %id, attempt, "Session version conflict, retrying");
            tokio::task::yield_now().await;
        }

        tracing::warn!(session_id = %id, "Giving up on contended session update");
        Err(UploadError::SessionContention(id.to_string()))
    }
}

/// Backend key the assembled object is stored under
pub fn object_key(user_id: &str, session_id: Uuid, file_name: &str) -> String {
    format!(
        "objects/{}/{}/{}",
        urlencoding::encode(user_id),
        session_id,
        urlencoding::encode(file_name)
    )
}

/// Backend part number for a chunk index (parts start at 1)
fn part_number(index: u64) -> Result<u32, UploadError> {
    u32::try_from(index + 1)
        .map_err(|_| UploadError::InvalidRequest(format!("chunk index {} is too large", index)))
}

pub(crate) fn invalid_state(session: &UploadSession, operation: &'static str) -> UploadError {
    UploadError::InvalidState {
        session_id: session.id.to_string(),
        status: session.status,
        operation,
    }
}

fn ensure_accepts_chunks(session: &UploadSession) -> Result<(), UploadError> {
    // An assembled session has no multipart upload left to add parts to
    if session.status.accepts_chunks() && session.assembled.is_none() {
        Ok(())
    } else {
        Err(invalid_state(session, "accept chunk"))
    }
}

fn chunk_response(session: &UploadSession, record: &ChunkRecord, duplicate: bool) -> ChunkUploadResponse {
    ChunkUploadResponse {
        chunk_index: record.index,
        part_reference: record.part.clone(),
        accepted: true,
        duplicate,
        chunks_received: session.accepted_count(),
        total_chunks: session.total_chunks,
        complete: session.is_complete(),
    }
}

// ============================================================================
// Tests
// ============================================================================
