//! Shared fixtures for unit tests

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use crate::config::{QuotaConfig, UploadConfig};
use crate::db::{create_memory_pool, SqliteSessionStore};
use crate::error::StorageError;
use crate::quota::QuotaService;
use crate::storage::{
    CompletedObject, LocalStorage, MultipartHandle, PartReference, RetryPolicy, StorageAdapter,
};
use crate::upload::{
    compute_digest, FinalizationCoordinator, SessionManager, SessionStore, UploadSession,
};

pub fn sample_session(ttl: chrono::Duration) -> UploadSession {
    UploadSession::new(
        Uuid::new_v4(),
        "u1",
        "notes.txt",
        64,
        "text/plain",
        16,
        MultipartHandle {
            object_key: "objects/u1/notes.txt".to_string(),
            upload_id: Uuid::new_v4().to_string(),
        },
        ttl,
    )
}

/// Deterministic file content
pub fn content(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn digest_of(data: &[u8]) -> String {
    compute_digest(data)
}

/// Bytes of chunk `index` when `data` is split into `chunk_size` pieces
pub fn slice(data: &[u8], chunk_size: u64, index: u64) -> &[u8] {
    let start = (index * chunk_size) as usize;
    let end = (start + chunk_size as usize).min(data.len());
    &data[start..end]
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        call_timeout: Duration::from_secs(5),
    }
}

/// Local storage that counts calls and can inject faults
pub struct CountingStorage {
    inner: LocalStorage,
    pub initiate_calls: AtomicU32,
    pub upload_calls: AtomicU32,
    pub complete_calls: AtomicU32,
    pub abort_calls: AtomicU32,
    /// Upcoming calls to fail with a transient error; `u32::MAX` fails forever
    pub fail_uploads: AtomicU32,
    pub fail_completes: AtomicU32,
    pub fail_aborts: AtomicU32,
    pub complete_delay_ms: AtomicU64,
    /// Sleep after the backend has completed the upload
    pub post_complete_delay_ms: AtomicU64,
    /// Added to the size reported by completion
    pub size_skew: AtomicU64,
}

impl CountingStorage {
    pub fn new(root: &std::path::Path) -> Self {
        Self {
            inner: LocalStorage::new(root),
            initiate_calls: AtomicU32::new(0),
            upload_calls: AtomicU32::new(0),
            complete_calls: AtomicU32::new(0),
            abort_calls: AtomicU32::new(0),
            fail_uploads: AtomicU32::new(0),
            fail_completes: AtomicU32::new(0),
            fail_aborts: AtomicU32::new(0),
            complete_delay_ms: AtomicU64::new(0),
            post_complete_delay_ms: AtomicU64::new(0),
            size_skew: AtomicU64::new(0),
        }
    }
}

fn injected(counter: &AtomicU32) -> Result<(), StorageError> {
    let fail = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n > 0).then(|| if n == u32::MAX { n } else { n - 1 })
        })
        .is_ok();

    if fail {
        Err(StorageError::ConnectionFailed("injected failure".to_string()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for CountingStorage {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn initiate_multipart(
        &self,
        object_key: &str,
        content_type: &str,
    ) -> Result<MultipartHandle, StorageError> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.initiate_multipart(object_key, content_type).await
    }

    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        data: &[u8],
    ) -> Result<PartReference, StorageError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        injected(&self.fail_uploads)?;
        self.inner.upload_part(handle, part_number, data).await
    }

    async fn complete_multipart(
        &self,
        handle: &MultipartHandle,
        parts: &[PartReference],
    ) -> Result<CompletedObject, StorageError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        injected(&self.fail_completes)?;

        let delay = self.complete_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut completed = self.inner.complete_multipart(handle, parts).await?;
        completed.size += self.size_skew.load(Ordering::SeqCst);

        let delay = self.post_complete_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(completed)
    }

    async fn stat_object(&self, object_key: &str) -> Result<Option<CompletedObject>, StorageError> {
        self.inner.stat_object(object_key).await
    }

    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<(), StorageError> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        injected(&self.fail_aborts)?;
        self.inner.abort_multipart(handle).await
    }
}

/// Fully wired upload engine over an in-memory database and a temp dir
pub struct Harness {
    pub pool: SqlitePool,
    pub storage: Arc<CountingStorage>,
    pub store: Arc<dyn SessionStore>,
    pub quota: QuotaService,
    pub sessions: SessionManager,
    pub finalizer: FinalizationCoordinator,
    pub root: TempDir,
}

pub async fn harness() -> Harness {
    harness_with(Duration::from_secs(5), chrono::Duration::hours(1)).await
}

pub async fn harness_with(finalize_budget: Duration, retention: chrono::Duration) -> Harness {
    let root = TempDir::new().unwrap();
    let pool = create_memory_pool().await.unwrap();
    let storage = Arc::new(CountingStorage::new(root.path()));
    let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(pool.clone()));
    let quota = QuotaService::new(pool.clone(), QuotaConfig::default());

    let upload = UploadConfig {
        completed_retention_secs: retention.num_seconds(),
        ..UploadConfig::default()
    };

    let sessions = SessionManager::new(
        store.clone(),
        storage.clone(),
        quota.clone(),
        upload.clone(),
        fast_retry(),
        finalize_budget,
    );
    let finalizer = FinalizationCoordinator::new(sessions.clone(), pool.clone(), upload.completed_retention());

    Harness {
        pool,
        storage,
        store,
        quota,
        sessions,
        finalizer,
        root,
    }
}

impl Harness {
    /// Multipart uploads with staged state on disk
    pub fn staged_uploads(&self) -> usize {
        std::fs::read_dir(self.root.path().join(".multipart"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    /// Move a live session's expiry into the past
    pub async fn force_expire(&self, id: Uuid) {
        let mut session = self.store.get(id).await.unwrap().unwrap();
        let expected = session.version;
        session.expires_at = Utc::now() - chrono::Duration::seconds(1);
        session.version += 1;
        assert!(self.store.update(&session, expected).await.unwrap());
    }

    /// Initiate and upload every chunk of `data`
    pub async fn upload_all(&self, user_id: &str, data: &[u8], chunk_size: u64) -> Uuid {
        let id = self
            .sessions
            .initiate(
                user_id,
                &crate::upload::InitiateRequest {
                    file_name: "upload.bin".to_string(),
                    size: data.len() as u64,
                    mime_type: "application/octet-stream".to_string(),
                    chunk_size: Some(chunk_size),
                },
            )
            .await
            .unwrap()
            .session_id;

        let total = crate::upload::chunk_count(data.len() as u64, chunk_size);
        for index in 0..total {
            let chunk = slice(data, chunk_size, index);
            self.sessions
                .accept_chunk(id, index, chunk, &digest_of(chunk))
                .await
                .unwrap();
        }
        id
    }
}
