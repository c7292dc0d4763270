//! Finalization: assemble the uploaded parts into the stored object
//!
//! A finalize first claims the session by moving it to `Finalizing`, which
//! makes late chunk uploads fail fast. Any failure after the claim returns
//! the session to `Uploading` so the client can fix the problem and retry.
//!
//! Backend completion consumes the multipart upload, so the assembled object
//! and the quota charge are recorded on the session as they happen. A retry
//! resumes after the last recorded step.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::{NewObject, ObjectRepository};
use crate::error::StorageError;
use crate::storage::{CompletedObject, PartReference};

use super::resume;
use super::session::{invalid_state, Mutation, SessionManager};
use super::types::{FinalizeResponse, SessionStatus, UploadError, UploadSession};

/// Outcome of trying to claim a session for finalization
enum Claim {
    /// This call owns the session and must assemble it
    Owned(Box<UploadSession>),
    /// An earlier finalize already completed it
    Done(FinalizeResponse),
}

/// Drives a session from `Uploading` to `Completed`
#[derive(Clone)]
pub struct FinalizationCoordinator {
    sessions: SessionManager,
    db: SqlitePool,
    /// How long a completed session keeps its result for retried finalizes
    retention: chrono::Duration,
}

impl FinalizationCoordinator {
    pub fn new(sessions: SessionManager, db: SqlitePool, retention: chrono::Duration) -> Self {
        Self {
            sessions,
            db,
            retention,
        }
    }

    /// Complete the multipart upload, charge quota, register the object and
    /// mark the session completed.
    ///
    /// Finalizing an already completed session returns the original result.
    pub async fn finalize(&self, id: Uuid) -> Result<FinalizeResponse, UploadError> {
        let session = self.sessions.get_session(id).await?;
        if let Some(result) = completed_result(&session) {
            return Ok(result);
        }

        // Fail before assembling if the user no longer has room
        if session.status == SessionStatus::Uploading && !session.quota_charged {
            let check = self
                .sessions
                .quota()
                .check_quota(&session.user_id, session.file_size)
                .await?;
            if !check.has_quota {
                return Err(UploadError::QuotaExceeded {
                    required: check.required,
                    available: check.available,
                    used: check.used,
                    limit: check.limit,
                });
            }
        }

        let session = match self.claim(id).await? {
            Claim::Done(result) => return Ok(result),
            Claim::Owned(session) => session,
        };

        tracing::info!(
            session_id = %id,
            user_id = %session.user_id,
            total_chunks = session.total_chunks,
            "Finalizing upload"
        );

        let budget = self.sessions.finalize_budget();
        let outcome = match tokio::time::timeout(budget, self.assemble(&session)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(UploadError::StorageBackendError(StorageError::Timeout(budget))),
        };

        match outcome {
            Ok(response) => {
                tracing::info!(
                    session_id = %id,
                    object_id = %response.object_id,
                    object_key = %response.object_key,
                    size = response.size,
                    "Upload finalized"
                );
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Finalize failed, session reopened");
                if let Err(release_err) = self.release_claim(id, rejected_chunk(&e)).await {
                    tracing::error!(session_id = %id, error = %release_err, "Failed to reopen session");
                }
                Err(e)
            }
        }
    }

    /// Move the session to `Finalizing` if it is complete and not already
    /// claimed by a live finalize
    async fn claim(&self, id: Uuid) -> Result<Claim, UploadError> {
        let now = Utc::now();
        let hold = chrono::Duration::from_std(self.sessions.finalize_budget() * 2)
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        self.sessions
            .mutate(id, |session| {
                if let Some(result) = completed_result(session) {
                    return Ok(Mutation::Skip(Claim::Done(result)));
                }

                match session.status {
                    SessionStatus::Uploading => {}
                    SessionStatus::Finalizing if self.sessions.claim_is_stale(session, now) => {
                        tracing::warn!(session_id = %session.id, "Reclaiming stale finalize");
                    }
                    _ => return Err(invalid_state(session, "finalize")),
                }

                let missing = resume::missing_indices(session);
                if !missing.is_empty() {
                    return Err(UploadError::IncompleteUpload { missing });
                }

                session.status = SessionStatus::Finalizing;
                session.finalize_started_at = Some(now);
                // Must not expire while the assembly is running
                session.expires_at = session.expires_at.max(now + hold);

                Ok(Mutation::Commit(Claim::Owned(Box::new(session.clone()))))
            })
            .await
    }

    async fn assemble(&self, session: &UploadSession) -> Result<FinalizeResponse, UploadError> {
        let completed = match &session.assembled {
            Some(completed) => completed.clone(),
            None => {
                let completed = self.complete(session).await?;
                self.checkpoint(session.id, |s| s.assembled = Some(completed.clone()))
                    .await?;
                completed
            }
        };

        if completed.size != session.file_size {
            tracing::error!(
                session_id = %session.id,
                declared = session.file_size,
                actual = completed.size,
                "Assembled object size does not match declared size"
            );
            return Err(UploadError::SizeMismatch {
                declared: session.file_size,
                actual: completed.size,
            });
        }

        if !session.quota_charged {
            let quota = self.sessions.quota();
            if !quota.reserve(&session.user_id, completed.size).await? {
                // The object exists already; record it and let reconciliation
                // settle the overage
                tracing::warn!(
                    user_id = %session.user_id,
                    session_id = %session.id,
                    size = completed.size,
                    "Quota reservation lost a race, charging over limit"
                );
                quota.charge(&session.user_id, completed.size).await?;
            }
            self.checkpoint(session.id, |s| s.quota_charged = true).await?;
        }

        let object_id = ObjectRepository::new(&self.db)
            .register(&NewObject {
                owner_id: session.user_id.clone(),
                object_key: completed.object_key.clone(),
                size: completed.size,
                mime_type: session.mime_type.clone(),
                etag: completed.etag.clone(),
            })
            .await?;

        let response = FinalizeResponse {
            object_id,
            object_key: completed.object_key,
            etag: completed.etag,
            size: completed.size,
        };

        self.mark_completed(session.id, &response).await?;
        Ok(response)
    }

    /// Complete the multipart upload in part order.
    ///
    /// A backend that no longer knows the upload may have completed it on an
    /// earlier attempt whose outcome was lost; the stored object is used then.
    async fn complete(&self, session: &UploadSession) -> Result<CompletedObject, UploadError> {
        let handle = session.multipart_handle();
        let parts: Vec<PartReference> = session.chunks.values().map(|c| c.part.clone()).collect();
        let storage = self.sessions.storage();

        match self
            .sessions
            .retry()
            .run("complete_multipart", || storage.complete_multipart(&handle, &parts))
            .await
        {
            Ok(completed) => Ok(completed),
            Err(StorageError::UploadNotFound(upload_id)) => {
                match storage.stat_object(&handle.object_key).await? {
                    Some(completed) => {
                        tracing::warn!(
                            session_id = %session.id,
                            object_key = %handle.object_key,
                            "Multipart upload already completed, using stored object"
                        );
                        Ok(completed)
                    }
                    None => Err(StorageError::UploadNotFound(upload_id).into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record finalize progress on the session
    async fn checkpoint<F>(&self, id: Uuid, mut record: F) -> Result<(), UploadError>
    where
        F: FnMut(&mut UploadSession) + Send,
    {
        self.sessions
            .mutate(id, |session| {
                record(session);
                Ok(Mutation::Commit(()))
            })
            .await
    }

    async fn mark_completed(&self, id: Uuid, response: &FinalizeResponse) -> Result<(), UploadError> {
        if self.retention <= chrono::Duration::zero() {
            self.sessions.store().delete(id).await?;
            return Ok(());
        }

        let expires_at = Utc::now() + self.retention;
        self.sessions
            .mutate(id, |session| {
                session.status = SessionStatus::Completed;
                session.finalize_started_at = None;
                session.result = Some(response.clone());
                session.expires_at = expires_at;
                Ok(Mutation::Commit(()))
            })
            .await
    }

    /// Return a claimed session to `Uploading`, forgetting a chunk the
    /// backend rejected so it shows up as missing again
    async fn release_claim(&self, id: Uuid, rejected: Option<u64>) -> Result<(), UploadError> {
        self.sessions
            .mutate(id, |session| {
                if session.status != SessionStatus::Finalizing {
                    return Ok(Mutation::Skip(()));
                }
                session.status = SessionStatus::Uploading;
                session.finalize_started_at = None;
                if let Some(index) = rejected {
                    if session.assembled.is_none() && session.chunks.remove(&index).is_some() {
                        tracing::warn!(session_id = %id, chunk_index = index, "Backend rejected chunk, must be re-sent");
                    }
                }
                Ok(Mutation::Commit(()))
            })
            .await
    }
}

/// Chunk index behind a part the backend refused to assemble
fn rejected_chunk(error: &UploadError) -> Option<u64> {
    match error {
        UploadError::StorageBackendError(StorageError::PartRejected { part_number, .. }) => {
            u64::from(*part_number).checked_sub(1)
        }
        _ => None,
    }
}

fn completed_result(session: &UploadSession) -> Option<FinalizeResponse> {
    match session.status {
        SessionStatus::Completed => session.result.clone(),
        _ => None,
    }
}
