//! Shared key-value store
//!
//! The result cache and the rate limiter both back onto this store, which
//! exposes the minimal surface portable to any backend with an atomic
//! increment: `get`, `set_with_ttl`, `incr`, `expire`.
//!
//! The SQLite implementation keeps everything in the `app_kv` table.
//! Expired rows read as absent and are deleted opportunistically; `incr`
//! restarts an expired counter at 1 in the same statement so concurrent
//! increments can never resurrect a stale count.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;

use crate::error::Result;
use crate::types::Timestamp;

/// Minimal key-value surface shared by cache and rate limiter.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value. Expired or missing keys return `None`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value with a TTL, replacing any previous value.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// Atomically increment an integer counter, returning the new value.
    /// Missing and expired keys restart at 1.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Set the TTL on an existing key.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;
}

fn expiry_string(ttl_secs: u64) -> String {
    let expires = Utc::now() + Duration::seconds(ttl_secs as i64);
    Timestamp::from_utc(expires).to_sqlite_string()
}

/// SQLite-backed key-value store over the `app_kv` table.
#[derive(Clone)]
pub struct SqliteKv {
    pool: SqlitePool,
}

impl SqliteKv {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT value, expires_at FROM app_kv WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((value, expires_at)) => {
                let expired = expires_at
                    .as_deref()
                    .and_then(|s| Timestamp::parse(s).ok())
                    .map(|ts| ts.into_inner() <= Utc::now())
                    .unwrap_or(false);

                if expired {
                    // Best effort cleanup; a failed delete only delays reuse
                    let _ = sqlx::query("DELETE FROM app_kv WHERE key = $1")
                        .bind(key)
                        .execute(&self.pool)
                        .await;
                    Ok(None)
                } else {
                    Ok(Some(value))
                }
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_kv (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry_string(ttl_secs))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        // Single-statement upsert keeps the increment atomic at the store.
        // An expired row restarts at 1 with its TTL cleared.
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO app_kv (key, value, expires_at)
            VALUES ($1, '1', NULL)
            ON CONFLICT (key) DO UPDATE SET
                value = CASE
                    WHEN app_kv.expires_at IS NOT NULL AND app_kv.expires_at <= datetime('now')
                    THEN '1'
                    ELSE CAST(CAST(app_kv.value AS INTEGER) + 1 AS TEXT)
                END,
                expires_at = CASE
                    WHEN app_kv.expires_at IS NOT NULL AND app_kv.expires_at <= datetime('now')
                    THEN NULL
                    ELSE app_kv.expires_at
                END
            RETURNING CAST(value AS INTEGER)
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        sqlx::query("UPDATE app_kv SET expires_at = $1 WHERE key = $2")
            .bind(expiry_string(ttl_secs))
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
