//! SQLite persistent storage for fetched lyrics.
//!
//! The result store holds one row per (title, artist) pair. Upserts are
//! idempotent: a duplicate pair is ignored rather than overwritten, so a
//! song fetched again after a retry or a restart leaves the stored lyrics
//! untouched.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::queue::LyricsPayload;

/// Errors that can occur during result-store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to open the lyrics database.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),
}

/// Per-artist song count, as reported by [`LyricsStore::count_by_artist`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtistCount {
    pub artist: String,
    pub songs: i64,
}

/// A stored lyrics sample for inspection.
#[derive(Debug, Clone)]
pub struct LyricsSample {
    pub title: String,
    pub artist: String,
    pub excerpt: String,
}

/// Keyed upsert store for fetched lyrics.
#[derive(Clone)]
pub struct LyricsStore {
    pool: SqlitePool,
}

impl LyricsStore {
    /// Opens (creating if necessary) the lyrics database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lyrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                artist TEXT NOT NULL,
                url TEXT,
                lyrics TEXT,
                timestamp TEXT,
                UNIQUE(title, artist)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Opens the database read-only; fails when it does not exist.
    pub async fn open_readonly(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new().filename(path).read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Stores fetched lyrics; a duplicate (title, artist) pair is ignored.
    ///
    /// Returns whether a new row was written.
    pub async fn upsert(&self, payload: &LyricsPayload) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO lyrics (title, artist, url, lyrics, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&payload.title)
        .bind(&payload.artist)
        .bind(&payload.source_url)
        .bind(&payload.lyrics)
        .bind(payload.fetched_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Total number of stored songs.
    pub async fn count(&self) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM lyrics")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Per-artist song counts, most prolific first.
    pub async fn count_by_artist(&self) -> Result<Vec<ArtistCount>, StorageError> {
        let rows = sqlx::query(
            "SELECT artist, COUNT(*) AS songs FROM lyrics
             GROUP BY artist ORDER BY songs DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ArtistCount {
                artist: row.get("artist"),
                songs: row.get("songs"),
            })
            .collect())
    }

    /// Returns one random stored song with a lyrics excerpt, if any.
    pub async fn random_sample(&self, excerpt_len: u32) -> Result<Option<LyricsSample>, StorageError> {
        let row = sqlx::query(
            "SELECT title, artist, substr(lyrics, 1, ?1) AS excerpt
             FROM lyrics ORDER BY RANDOM() LIMIT 1",
        )
        .bind(excerpt_len as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| LyricsSample {
            title: row.get("title"),
            artist: row.get("artist"),
            excerpt: row.get("excerpt"),
        }))
    }

    /// Closes the underlying connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
