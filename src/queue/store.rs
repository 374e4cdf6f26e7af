//! SQLite-backed durable task store.
//!
//! Pending and in-flight task entries are persisted keyed by task identity
//! so that a crashed process can see what it was working on at next startup.
//! Recovery is informational: entries from a previous run are reported, not
//! automatically resubmitted. The dispatcher is the single writer.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

use super::task::{Song, TaskState};

/// Errors that can occur during task-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to open the store database.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),
}

/// One persisted task entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTask {
    pub task_id: String,
    pub title: String,
    pub artist: String,
    /// Textual [`TaskState`] at the last transition.
    pub state: String,
    pub attempts: i64,
    pub enqueued_at: DateTime<Utc>,
}

/// Durable store for pending/in-flight task entries.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Opens (creating if necessary) the store at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                artist TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Inserts or refreshes the entry for a task.
    pub async fn upsert(
        &self,
        task_id: &str,
        song: &Song,
        state: TaskState,
        attempts: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (task_id, title, artist, state, attempts, enqueued_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(task_id) DO UPDATE SET
                state = excluded.state,
                attempts = excluded.attempts
            "#,
        )
        .bind(task_id)
        .bind(&song.title)
        .bind(&song.artist)
        .bind(state.as_str())
        .bind(attempts as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Updates the state and attempt count of an existing entry.
    pub async fn mark_state(
        &self,
        task_id: &str,
        state: TaskState,
        attempts: u32,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET state = ?1, attempts = ?2 WHERE task_id = ?3")
            .bind(state.as_str())
            .bind(attempts as i64)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes the entry for a terminally completed task.
    pub async fn remove(&self, task_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tasks WHERE task_id = ?1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns every persisted entry, oldest first.
    ///
    /// Called once at startup so entries left over from a previous run can
    /// be reported.
    pub async fn pending(&self) -> Result<Vec<StoredTask>, StoreError> {
        let tasks = sqlx::query_as::<_, StoredTask>(
            "SELECT task_id, title, artist, state, attempts, enqueued_at
             FROM tasks ORDER BY enqueued_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    /// Number of persisted entries.
    pub async fn len(&self) -> Result<u64, StoreError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 as u64)
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Closes the underlying connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
