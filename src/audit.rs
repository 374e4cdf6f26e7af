//! JSON-lines audit log.
//!
//! The audit stream is a stable, machine-readable record of queue activity:
//! one JSON object per line with `timestamp`, `level`, `message` and
//! event-specific fields, appended to a per-day file
//! (`lyricforge-YYYY-MM-DD.log`). It complements, rather than replaces,
//! `tracing` diagnostics.

use std::path::PathBuf;

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::queue::TaskEvent;

/// Errors that can occur while writing the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Log directory or file IO failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry serialization failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Appends structured entries to per-day JSON-lines files.
#[derive(Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    /// Creates an audit log writing under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Creates the log directory.
    pub async fn initialize(&self) -> Result<(), AuditError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Appends one entry.
    ///
    /// `meta` fields are merged into the entry alongside `timestamp`,
    /// `level` and `message`; the current day selects the target file.
    pub async fn append(&self, level: &str, message: &str, meta: Value) -> Result<(), AuditError> {
        let now = Utc::now();
        let mut entry = json!({
            "timestamp": now.to_rfc3339(),
            "level": level,
            "message": message,
        });

        if let (Some(entry_map), Value::Object(meta_map)) = (entry.as_object_mut(), meta) {
            for (key, value) in meta_map {
                entry_map.insert(key, value);
            }
        }

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let path = self.dir.join(format!("lyricforge-{}.log", now.date_naive()));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Spawns a task recording every queue lifecycle event.
    ///
    /// The subscriber runs until the event channel closes; lagging behind a
    /// burst of events is logged, not fatal.
    pub fn spawn_subscriber(&self, mut events: broadcast::Receiver<TaskEvent>) -> JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let (level, message, meta) = describe(&event);
                        if let Err(e) = log.append(level, message, meta).await {
                            warn!(error = %e, "failed to write audit entry");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "audit subscriber lagged behind event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Maps a lifecycle event to an audit entry.
fn describe(event: &TaskEvent) -> (&'static str, &'static str, Value) {
    match event {
        TaskEvent::Dispatched {
            task_id,
            worker_id,
            attempt,
        } => (
            "info",
            "task dispatched",
            json!({ "task_id": task_id, "worker_id": worker_id, "attempt": attempt }),
        ),
        TaskEvent::Finished { task_id, song } => (
            "info",
            "task completed",
            json!({ "task_id": task_id, "title": song.title, "artist": song.artist }),
        ),
        TaskEvent::Retry {
            task_id,
            reason,
            attempt,
        } => (
            "warn",
            "retrying task",
            json!({ "task_id": task_id, "reason": reason, "attempt": attempt }),
        ),
        TaskEvent::Failed {
            task_id,
            song,
            reason,
            attempts,
        } => (
            "error",
            "task failed",
            json!({
                "task_id": task_id,
                "title": song.title,
                "artist": song.artist,
                "reason": reason,
                "attempts": attempts,
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Song;

    #[tokio::test]
    async fn test_append_writes_parseable_json_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path());
        log.initialize().await.expect("initialize");

        log.append("info", "queue started", json!({ "workers": 4 }))
            .await
            .expect("append");

        let path = dir
            .path()
            .join(format!("lyricforge-{}.log", Utc::now().date_naive()));
        let contents = tokio::fs::read_to_string(path).await.expect("read");
        let line = contents.lines().next().expect("one line");
        let entry: Value = serde_json::from_str(line).expect("valid JSON");

        assert_eq!(entry["level"], "info");
        assert_eq!(entry["message"], "queue started");
        assert_eq!(entry["workers"], 4);
        assert!(entry["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_append_is_line_oriented() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path());
        log.initialize().await.expect("initialize");

        log.append("info", "first", json!({})).await.expect("append");
        log.append("warn", "second", json!({})).await.expect("append");

        let path = dir
            .path()
            .join(format!("lyricforge-{}.log", Utc::now().date_naive()));
        let contents = tokio::fs::read_to_string(path).await.expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let entry: Value = serde_json::from_str(line).expect("valid JSON");
            assert!(entry["timestamp"].is_string());
        }
    }

    #[tokio::test]
    async fn test_subscriber_records_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path());
        log.initialize().await.expect("initialize");

        let (tx, rx) = broadcast::channel(16);
        let handle = log.spawn_subscriber(rx);

        let song = Song::new("Magnolia", "Playboi Carti");
        tx.send(TaskEvent::Finished {
            task_id: song.id(),
            song,
        })
        .expect("send");
        drop(tx);
        handle.await.expect("subscriber should stop cleanly");

        let path = dir
            .path()
            .join(format!("lyricforge-{}.log", Utc::now().date_naive()));
        let contents = tokio::fs::read_to_string(path).await.expect("read");
        let entry: Value =
            serde_json::from_str(contents.lines().next().expect("one line")).expect("valid JSON");
        assert_eq!(entry["message"], "task completed");
        assert_eq!(entry["title"], "Magnolia");
    }
}
