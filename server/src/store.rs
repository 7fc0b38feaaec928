//! Durable key-value storage for sessions and login attempts.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use color_eyre::eyre::{eyre, WrapErr};
use sqlx::{postgres::PgPoolOptions, PgPool};

#[async_trait::async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> color_eyre::Result<()>;

    async fn get(&self, key: &str) -> color_eyre::Result<Option<String>>;

    /// Read and delete in one step. A value can be taken at most once.
    async fn take(&self, key: &str) -> color_eyre::Result<Option<String>>;

    async fn delete(&self, key: &str) -> color_eyre::Result<()>;
}

/// In-process store used for development runs and tests
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> color_eyre::Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| eyre!("Memory store lock poisoned"))
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> color_eyre::Result<()> {
        let mut entries = self.lock()?;
        entries.retain(|_, (_, expires_at)| *expires_at > Instant::now());
        entries.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> color_eyre::Result<Option<String>> {
        let entries = self.lock()?;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn take(&self, key: &str) -> color_eyre::Result<Option<String>> {
        let mut entries = self.lock()?;
        Ok(entries
            .remove(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value))
    }

    async fn delete(&self, key: &str) -> color_eyre::Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// Postgres-backed store, rows past `expires_at` are treated as absent
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[tracing::instrument(skip_all, err)]
    pub async fn connect(database_url: &str) -> color_eyre::Result<Self> {
        const MIGRATION_LOCK_ID: i64 = 0x5E55_1025;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .wrap_err("Failed to connect to Postgres")?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&pool)
            .await?;

        sqlx::migrate!("../migrations").run(&pool).await?;

        let unlocked: (bool,) = sqlx::query_as("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_ID)
            .fetch_one(&pool)
            .await?;

        if unlocked.0 {
            tracing::info!("Migration lock unlocked");
        } else {
            tracing::warn!("Failed to unlock migration lock");
        }

        Ok(Self { pool })
    }

    /// Drop rows whose `expires_at` has passed
    pub async fn purge_expired(&self) -> color_eyre::Result<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .wrap_err("Failed to purge expired key-value entries")?;

        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl KvStore for PgStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> color_eyre::Result<()> {
        let expires_at = chrono::Utc::now() + chrono::Duration::from_std(ttl)?;

        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to write key-value entry")?;

        match self.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(purged, "Purged expired key-value entries"),
            Err(e) => tracing::warn!("{:?}", e),
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> color_eyre::Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM kv_entries WHERE key = $1 AND expires_at > now()")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .wrap_err("Failed to read key-value entry")?;

        Ok(row.map(|(value,)| value))
    }

    async fn take(&self, key: &str) -> color_eyre::Result<Option<String>> {
        let row: Option<(String, chrono::DateTime<chrono::Utc>)> =
            sqlx::query_as("DELETE FROM kv_entries WHERE key = $1 RETURNING value, expires_at")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .wrap_err("Failed to take key-value entry")?;

        Ok(row
            .filter(|(_, expires_at)| *expires_at > chrono::Utc::now())
            .map(|(value, _)| value))
    }

    async fn delete(&self, key: &str) -> color_eyre::Result<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .wrap_err("Failed to delete key-value entry")?;

        Ok(())
    }
}
