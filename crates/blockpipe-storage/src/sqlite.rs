//! SQLite storage backend for BlockPipe.
//!
//! Persists raw batch bytes (the replay cache) and the per-stream log of
//! pipeline state snapshots to a single SQLite file. Uses `sqlx` with WAL
//! mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use blockpipe_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./blockpipe.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use blockpipe_core::cache::{CacheAdapter, CachedBatch};
use blockpipe_core::checkpoint::{StateRecord, StateStore};
use blockpipe_core::cursor::PipelineState;
use blockpipe_core::error::PipeError;

fn storage_err(e: impl std::fmt::Display) -> PipeError {
    PipeError::Storage(e.to_string())
}

fn cache_err(e: impl std::fmt::Display) -> PipeError {
    PipeError::Cache(e.to_string())
}

/// SQLite-backed batch cache and state log.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    /// Keep at most this many state snapshots per stream (0 = unbounded).
    retain: usize,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./blockpipe.db"`) or a full
    /// SQLite URL (`"sqlite:./blockpipe.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, PipeError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        Self::with_pool(pool).await
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. The pool is capped at one
    /// connection since every `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self, PipeError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, PipeError> {
        let storage = Self { pool, retain: 0 };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Keep only the newest `retain` state snapshots per stream.
    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retain = retain;
        self
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), PipeError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        // Raw batches, keyed by query hash and first block
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cache_batches (
                query_hash TEXT    NOT NULL,
                range_from INTEGER NOT NULL,
                range_to   INTEGER NOT NULL,
                data       BLOB    NOT NULL,
                PRIMARY KEY (query_hash, range_from)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        // Append-only state log
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pipeline_states (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                stream_id     TEXT    NOT NULL,
                cursor_number INTEGER NOT NULL,
                state_json    TEXT    NOT NULL,
                saved_at      TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_states_stream ON pipeline_states (stream_id, id);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(())
    }

    /// Number of cached batches stored under `query_hash`.
    pub async fn cached_batches(&self, query_hash: &str) -> Result<u64, PipeError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM cache_batches WHERE query_hash = ?")
            .bind(query_hash)
            .fetch_one(&self.pool)
            .await
            .map_err(cache_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }

    /// Drop every cached batch of `query_hash`.
    pub async fn clear_cache(&self, query_hash: &str) -> Result<(), PipeError> {
        sqlx::query("DELETE FROM cache_batches WHERE query_hash = ?")
            .bind(query_hash)
            .execute(&self.pool)
            .await
            .map_err(cache_err)?;
        Ok(())
    }

    async fn cached_at(pool: &SqlitePool, query_hash: &str, from: u64) -> Result<Option<CachedBatch>, PipeError> {
        let row = sqlx::query(
            "SELECT range_from, range_to, data FROM cache_batches
             WHERE query_hash = ? AND range_from = ?",
        )
        .bind(query_hash)
        .bind(from as i64)
        .fetch_optional(pool)
        .await
        .map_err(cache_err)?;

        Ok(row.map(|r| CachedBatch {
            from: r.get::<i64, _>("range_from") as u64,
            to: r.get::<i64, _>("range_to") as u64,
            data: Bytes::from(r.get::<Vec<u8>, _>("data")),
        }))
    }

    fn state_record(row: &SqliteRow) -> Result<StateRecord, PipeError> {
        let json: String = row.get("state_json");
        let state: PipelineState = serde_json::from_str(&json).map_err(storage_err)?;
        Ok(StateRecord {
            stream_id: row.get("stream_id"),
            state,
            saved_at: row.get::<DateTime<Utc>, _>("saved_at"),
        })
    }
}

// ─── CacheAdapter impl ───────────────────────────────────────────────────────

#[async_trait]
impl CacheAdapter for SqliteStorage {
    async fn stream(
        &self,
        query_hash: &str,
        from: u64,
    ) -> Result<BoxStream<'static, Result<CachedBatch, PipeError>>, PipeError> {
        let pool = self.pool.clone();
        let query_hash = query_hash.to_string();
        let batches = stream::unfold(Some(from), move |next| {
            let pool = pool.clone();
            let query_hash = query_hash.clone();
            async move {
                let from = next?;
                match Self::cached_at(&pool, &query_hash, from).await {
                    Ok(Some(batch)) => {
                        let next = batch.to.checked_add(1);
                        Some((Ok(batch), next))
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(e), None)),
                }
            }
        });
        Ok(batches.boxed())
    }

    async fn save(&self, query_hash: &str, from: u64, to: u64, data: Bytes) -> Result<(), PipeError> {
        if to < from {
            return Err(PipeError::Cache(format!("invalid cache range [{from}, {to}]")));
        }
        sqlx::query(
            "INSERT OR REPLACE INTO cache_batches (query_hash, range_from, range_to, data)
             VALUES (?, ?, ?, ?)",
        )
        .bind(query_hash)
        .bind(from as i64)
        .bind(to as i64)
        .bind(data.as_ref())
        .execute(&self.pool)
        .await
        .map_err(cache_err)?;

        debug!(query_hash, from, to, bytes = data.len(), "batch cached");
        Ok(())
    }
}

// ─── StateStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl StateStore for SqliteStorage {
    async fn load(&self, stream_id: &str) -> Result<Option<StateRecord>, PipeError> {
        let row = sqlx::query(
            "SELECT stream_id, state_json, saved_at FROM pipeline_states
             WHERE stream_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(Self::state_record).transpose()
    }

    async fn history(&self, stream_id: &str, limit: usize) -> Result<Vec<StateRecord>, PipeError> {
        let rows = sqlx::query(
            "SELECT stream_id, state_json, saved_at FROM pipeline_states
             WHERE stream_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(stream_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::state_record).collect()
    }

    async fn save(&self, record: StateRecord) -> Result<(), PipeError> {
        let json = serde_json::to_string(&record.state).map_err(storage_err)?;

        sqlx::query(
            "INSERT INTO pipeline_states (stream_id, cursor_number, state_json, saved_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&record.stream_id)
        .bind(record.state.cursor.number as i64)
        .bind(&json)
        .bind(record.saved_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if self.retain > 0 {
            sqlx::query(
                "DELETE FROM pipeline_states WHERE stream_id = ? AND id NOT IN (
                    SELECT id FROM pipeline_states WHERE stream_id = ? ORDER BY id DESC LIMIT ?
                )",
            )
            .bind(&record.stream_id)
            .bind(&record.stream_id)
            .bind(self.retain as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        }

        debug!(
            stream = %record.stream_id,
            cursor = record.state.cursor.number,
            "state saved"
        );
        Ok(())
    }

    async fn truncate_after(&self, stream_id: &str, block: u64) -> Result<(), PipeError> {
        let deleted = sqlx::query("DELETE FROM pipeline_states WHERE stream_id = ? AND cursor_number > ?")
            .bind(stream_id)
            .bind(block as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?
            .rows_affected();

        debug!(stream = stream_id, block, deleted, "state log truncated");
        Ok(())
    }

    async fn delete(&self, stream_id: &str) -> Result<(), PipeError> {
        sqlx::query("DELETE FROM pipeline_states WHERE stream_id = ?")
            .bind(stream_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
