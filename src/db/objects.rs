//! Registered object database operations

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

/// Object row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub id: String,
    pub owner_id: String,
    pub object_key: String,
    pub size: i64,
    pub mime_type: String,
    pub etag: String,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

/// Input for registering an assembled object
#[derive(Debug, Clone)]
pub struct NewObject {
    pub owner_id: String,
    pub object_key: String,
    pub size: u64,
    pub mime_type: String,
    pub etag: String,
}

/// Object repository
pub struct ObjectRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ObjectRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Register an object and return its id.
    ///
    /// Registering a key that is already live returns the existing id, so a
    /// finalize retried after a lost response does not register twice.
    pub async fn register(&self, object: &NewObject) -> sqlx::Result<String> {
        if let Some(existing) = self.find_live_by_key(&object.object_key).await? {
            return Ok(existing.id);
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO objects (id, owner_id, object_key, size, mime_type, etag, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&object.owner_id)
        .bind(&object.object_key)
        .bind(i64::try_from(object.size).unwrap_or(i64::MAX))
        .bind(&object.mime_type)
        .bind(&object.etag)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool)
        .await?;

        Ok(id)
    }

    /// Get a live object by id
    pub async fn get(&self, id: &str) -> sqlx::Result<Option<StoredObject>> {
        sqlx::query_as::<_, StoredObject>(
            r#"
            SELECT id, owner_id, object_key, size, mime_type, etag, created_at, deleted_at
            FROM objects
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await
    }

    async fn find_live_by_key(&self, object_key: &str) -> sqlx::Result<Option<StoredObject>> {
        sqlx::query_as::<_, StoredObject>(
            r#"
            SELECT id, owner_id, object_key, size, mime_type, etag, created_at, deleted_at
            FROM objects
            WHERE object_key = ? AND deleted_at IS NULL
            "#,
        )
        .bind(object_key)
        .fetch_optional(self.pool)
        .await
    }

    /// List an owner's live objects, newest first
    pub async fn list_for_owner(&self, owner_id: &str) -> sqlx::Result<Vec<StoredObject>> {
        sqlx::query_as::<_, StoredObject>(
            r#"
            SELECT id, owner_id, object_key, size, mime_type, etag, created_at, deleted_at
            FROM objects
            WHERE owner_id = ? AND deleted_at IS NULL
            ORDER BY created_at DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(self.pool)
        .await
    }

    /// Soft-delete an owner's object. Returns the row as it was before the
    /// delete, or `None` if there was no live object to delete.
    pub async fn soft_delete(&self, owner_id: &str, id: &str) -> sqlx::Result<Option<StoredObject>> {
        let Some(object) = self.get(id).await?.filter(|o| o.owner_id == owner_id) else {
            return Ok(None);
        };

        let result = sqlx::query(
            r#"
            UPDATE objects SET deleted_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.pool)
        .await?;

        // Lost a race with another delete
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(object))
    }

    /// Sum of live object sizes for an owner
    pub async fn total_size_for_owner(&self, owner_id: &str) -> sqlx::Result<u64> {
        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(size), 0) FROM objects
            WHERE owner_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(owner_id)
        .fetch_one(self.pool)
        .await?;

        Ok(total.max(0) as u64)
    }

    /// Distinct owners with at least one live object
    pub async fn owners(&self) -> sqlx::Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT owner_id FROM objects WHERE deleted_at IS NULL ORDER BY owner_id",
        )
        .fetch_all(self.pool)
        .await
    }
}
