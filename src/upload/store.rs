//! Upload session persistence
//!
//! Sessions are versioned: `update` only applies when the stored version
//! still equals the version the caller read, so concurrent writers to the
//! same session never overwrite each other's chunk bookkeeping.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::types::{UploadError, UploadSession};

/// TTL-aware, versioned session repository
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session
    async fn insert(&self, session: &UploadSession) -> Result<(), UploadError>;

    /// Load a session. Sessions past their expiry are reported as absent.
    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>, UploadError>;

    /// Replace the stored session if its version is still `expected_version`.
    ///
    /// Returns `false` on a version conflict or when the session is gone.
    async fn update(&self, session: &UploadSession, expected_version: u64) -> Result<bool, UploadError>;

    /// Delete a session; returns whether a record existed
    async fn delete(&self, id: Uuid) -> Result<bool, UploadError>;

    /// Sessions whose expiry is at or before `now`, oldest first
    async fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<UploadSession>, UploadError>;

    /// Number of live sessions
    async fn count(&self) -> Result<u64, UploadError>;
}

/// In-process session store for single-node deployments and tests
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, UploadSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &UploadSession) -> Result<(), UploadError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(UploadError::Internal(format!("duplicate session id {}", session.id)));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>, UploadError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id).filter(|s| !s.is_expired()).cloned())
    }

    async fn update(&self, session: &UploadSession, expected_version: u64) -> Result<bool, UploadError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = session.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, UploadError> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.remove(&id).is_some())
    }

    async fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<UploadSession>, UploadError> {
        let sessions = self.sessions.read().await;
        let mut expired: Vec<UploadSession> = sessions
            .values()
            .filter(|s| s.expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|s| s.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn count(&self) -> Result<u64, UploadError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.values().filter(|s| !s.is_expired()).count() as u64)
    }
}
