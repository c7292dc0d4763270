//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::quota::QuotaService;
use crate::storage::StorageAdapter;
use crate::upload::{FinalizationCoordinator, SessionManager, SessionStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    storage: Arc<dyn StorageAdapter>,
    quota: QuotaService,
    sessions: SessionManager,
    finalizer: FinalizationCoordinator,
}

impl AppState {
    /// Wire the upload engine around a storage backend and session store
    pub fn new(
        config: Config,
        db: SqlitePool,
        storage: Arc<dyn StorageAdapter>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let quota = QuotaService::new(db.clone(), config.quota.clone());
        let sessions = SessionManager::new(
            store,
            storage.clone(),
            quota.clone(),
            config.upload.clone(),
            config.retry.policy(),
            config.retry.finalize_budget(),
        );
        let finalizer = FinalizationCoordinator::new(
            sessions.clone(),
            db.clone(),
            config.upload.completed_retention(),
        );

        Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                storage,
                quota,
                sessions,
                finalizer,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the storage backend
    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.inner.storage
    }

    pub fn quota(&self) -> &QuotaService {
        &self.inner.quota
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn finalizer(&self) -> &FinalizationCoordinator {
        &self.inner.finalizer
    }
}
