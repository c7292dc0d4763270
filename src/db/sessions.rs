//! SQLite-backed upload session store
//!
//! The full session is stored as JSON in `data`; `status`, `version` and
//! `expires_at_ms` are duplicated into columns for filtering and
//! compare-and-swap.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::upload::{SessionStore, UploadError, UploadSession};

/// Session store shared by every server instance pointing at the database
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn encode(session: &UploadSession) -> Result<String, UploadError> {
    serde_json::to_string(session)
        .map_err(|e| UploadError::Internal(format!("Failed to encode session {}: {}", session.id, e)))
}

fn decode(id: &str, data: &str) -> Result<UploadSession, UploadError> {
    serde_json::from_str(data)
        .map_err(|e| UploadError::Internal(format!("Corrupt session record {}: {}", id, e)))
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn insert(&self, session: &UploadSession) -> Result<(), UploadError> {
        let data = encode(session)?;

        sqlx::query(
            r#"
            INSERT INTO upload_sessions (id, user_id, status, version, expires_at_ms, data, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id.to_string())
        .bind(&session.user_id)
        .bind(session.status.as_str())
        .bind(session.version as i64)
        .bind(session.expires_at.timestamp_millis())
        .bind(data)
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<UploadSession>, UploadError> {
        let row = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT id, data FROM upload_sessions
            WHERE id = ? AND expires_at_ms > ?
            "#,
        )
        .bind(id.to_string())
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, data)| decode(&id, &data)).transpose()
    }

    async fn update(&self, session: &UploadSession, expected_version: u64) -> Result<bool, UploadError> {
        let data = encode(session)?;

        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET status = ?, version = ?, expires_at_ms = ?, data = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(session.status.as_str())
        .bind(session.version as i64)
        .bind(session.expires_at.timestamp_millis())
        .bind(data)
        .bind(session.updated_at.to_rfc3339())
        .bind(session.id.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, UploadError> {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<UploadSession>, UploadError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT id, data FROM upload_sessions
            WHERE expires_at_ms <= ?
            ORDER BY expires_at_ms ASC
            LIMIT ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|(id, data)| decode(id, data)).collect()
    }

    async fn count(&self) -> Result<u64, UploadError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM upload_sessions WHERE expires_at_ms > ?",
        )
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }
}
