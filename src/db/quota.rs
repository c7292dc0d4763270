//! Quota ledger database operations
//!
//! Every mutation is a single statement so concurrent reservations and
//! releases for the same user compose without read-modify-write races.

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;

/// Quota ledger row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct QuotaLedgerRow {
    pub user_id: String,
    pub used_bytes: i64,
    pub limit_bytes: i64,
    pub updated_at: String,
}

/// Quota ledger repository
pub struct QuotaRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> QuotaRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the ledger row, creating it with `default_limit` on first use
    pub async fn get_or_create(&self, user_id: &str, default_limit: u64) -> sqlx::Result<QuotaLedgerRow> {
        sqlx::query(
            r#"
            INSERT INTO quota_ledger (user_id, used_bytes, limit_bytes, updated_at)
            VALUES (?, 0, ?, ?)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(to_i64(default_limit))
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool)
        .await?;

        sqlx::query_as::<_, QuotaLedgerRow>(
            r#"
            SELECT user_id, used_bytes, limit_bytes, updated_at
            FROM quota_ledger
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_one(self.pool)
        .await
    }

    /// Atomically add `bytes` to `used`
    pub async fn increment(&self, user_id: &str, bytes: u64, default_limit: u64) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quota_ledger (user_id, used_bytes, limit_bytes, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                used_bytes = used_bytes + excluded.used_bytes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(to_i64(bytes))
        .bind(to_i64(default_limit))
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Atomically subtract `bytes` from `used`, never going below zero
    pub async fn decrement(&self, user_id: &str, bytes: u64) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE quota_ledger
            SET used_bytes = MAX(used_bytes - ?, 0), updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(to_i64(bytes))
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Overwrite `used` with a recomputed value
    pub async fn overwrite_used(&self, user_id: &str, used: u64) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE quota_ledger
            SET used_bytes = ?, updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(to_i64(used))
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Set a user's limit, creating the row if needed
    pub async fn set_limit(&self, user_id: &str, limit: u64) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quota_ledger (user_id, used_bytes, limit_bytes, updated_at)
            VALUES (?, 0, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                limit_bytes = excluded.limit_bytes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(to_i64(limit))
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// All users with a ledger row
    pub async fn users(&self) -> sqlx::Result<Vec<String>> {
        sqlx::query_scalar::<_, String>("SELECT user_id FROM quota_ledger ORDER BY user_id")
            .fetch_all(self.pool)
            .await
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
