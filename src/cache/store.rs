use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::key::CacheKey;
use super::lru::CacheEntry;
use crate::pipeline::CacheError;

/// Durable tier behind the in-memory LRU. Failures are reported to the
/// cache, which logs them and carries on.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;
    async fn save(&self, entry: &CacheEntry) -> Result<(), CacheError>;
    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;
    async fn record_hit(&self, key: &CacheKey) -> Result<(), CacheError>;
    /// Drops all but the `keep` most recently used entries. Returns how many
    /// were removed.
    async fn prune(&self, keep: usize) -> Result<u64, CacheError>;
}

pub struct SqliteCacheBackend {
    pool: SqlitePool,
}

impl SqliteCacheBackend {
    pub async fn open(db_path: &Path) -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(CacheError::backend)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS response_cache (
                cache_key TEXT PRIMARY KEY,
                answer_text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(CacheError::backend)?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn row_count(&self) -> Result<u64, CacheError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM response_cache")
            .fetch_one(&self.pool)
            .await
            .map_err(CacheError::backend)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl CacheBackend for SqliteCacheBackend {
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let row = sqlx::query(
            "SELECT answer_text, created_at, hit_count FROM response_cache WHERE cache_key = ?",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(CacheError::backend)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let answer_text: String = row.try_get("answer_text").map_err(CacheError::backend)?;
        let created_at: String = row.try_get("created_at").map_err(CacheError::backend)?;
        let hit_count: i64 = row.try_get("hit_count").map_err(CacheError::backend)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(CacheError::backend)?
            .with_timezone(&Utc);

        Ok(Some(CacheEntry {
            key: key.clone(),
            answer_text,
            created_at,
            hit_count: u64::try_from(hit_count).unwrap_or_default(),
        }))
    }

    async fn save(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT INTO response_cache (cache_key, answer_text, created_at, hit_count, last_used_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(cache_key) DO UPDATE SET
                answer_text = excluded.answer_text,
                created_at = excluded.created_at,
                hit_count = excluded.hit_count,
                last_used_at = excluded.last_used_at",
        )
        .bind(entry.key.as_str())
        .bind(&entry.answer_text)
        .bind(format_time(entry.created_at))
        .bind(i64::try_from(entry.hit_count).unwrap_or(i64::MAX))
        .bind(format_time(Utc::now().trunc_subsecs(6)))
        .execute(&self.pool)
        .await
        .map_err(CacheError::backend)?;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM response_cache WHERE cache_key = ?")
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .map_err(CacheError::backend)?;
        Ok(())
    }

    async fn record_hit(&self, key: &CacheKey) -> Result<(), CacheError> {
        sqlx::query(
            "UPDATE response_cache SET hit_count = hit_count + 1, last_used_at = ? WHERE cache_key = ?",
        )
        .bind(format_time(Utc::now().trunc_subsecs(6)))
        .bind(key.as_str())
        .execute(&self.pool)
        .await
        .map_err(CacheError::backend)?;
        Ok(())
    }
}
