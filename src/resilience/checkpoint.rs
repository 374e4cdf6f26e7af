//! Checkpoint documents and their on-disk representation.
//!
//! A checkpoint is an immutable, timestamped JSON snapshot of progress.
//! Files are named `checkpoint-<timestamp>.json` with the RFC 3339
//! timestamp's `:` and `.` characters replaced by `-`, so lexicographic
//! filename order equals chronological order and "latest" is simply the
//! greatest name in the directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::{ResilienceError, StatsSnapshot};

/// Filename prefix shared by every checkpoint document.
const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// A durable snapshot of pipeline progress.
///
/// Checkpoints are append-only: once written they are never mutated, and
/// recovery always reads the latest one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Unique song ids completed so far; seeds the dedup set on recovery.
    pub processed: Vec<String>,
    /// Task ids that failed terminally.
    pub failed: Vec<String>,
    /// Task ids that were in flight when the snapshot was taken.
    #[serde(default)]
    pub running: Vec<String>,
    /// Statistics at snapshot time.
    pub stats: StatsSnapshot,
}

/// Returns the filename for a checkpoint taken at `timestamp`.
pub fn checkpoint_filename(timestamp: &DateTime<Utc>) -> String {
    let iso = timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    format!("{}{}.json", CHECKPOINT_PREFIX, iso.replace([':', '.'], "-"))
}

/// Writes `checkpoint` into `dir` and returns the path of the new file.
pub async fn write_checkpoint(dir: &Path, checkpoint: &Checkpoint) -> Result<PathBuf, ResilienceError> {
    let path = dir.join(checkpoint_filename(&checkpoint.timestamp));
    let body = serde_json::to_vec_pretty(checkpoint)?;
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

/// Loads the most recent checkpoint from `dir`.
///
/// Returns `Ok(None)` when the directory is missing or holds no checkpoint
/// files. Read and parse failures are returned as errors; callers decide
/// whether those are fatal.
pub async fn load_latest(dir: &Path) -> Result<Option<Checkpoint>, ResilienceError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut latest: Option<String> = None;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(CHECKPOINT_PREFIX) || !name.ends_with(".json") {
            continue;
        }
        if latest.as_deref().map_or(true, |current| name.as_str() > current) {
            latest = Some(name);
        }
    }

    let Some(name) = latest else {
        return Ok(None);
    };

    let data = tokio::fs::read_to_string(dir.join(&name)).await?;
    let checkpoint: Checkpoint = serde_json::from_str(&data)?;
    Ok(Some(checkpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot() -> StatsSnapshot {
        StatsSnapshot {
            processed: 3,
            failed: 1,
            retries: 2,
            total_tasks: 4,
            started_at: Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
            runtime_ms: 42_000,
            success_rate: Some(75.0),
            last_checkpoint: None,
        }
    }

    #[test]
    fn test_filename_replaces_separators() {
        let ts = Utc.with_ymd_and_hms(2026, 8, 1, 12, 30, 45).unwrap();
        let name = checkpoint_filename(&ts);
        assert_eq!(name, "checkpoint-2026-08-01T12-30-45-000Z.json");
        assert!(!name.contains(':'));
    }

    #[test]
    fn test_filenames_sort_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2026, 8, 1, 9, 59, 59).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        assert!(checkpoint_filename(&earlier) < checkpoint_filename(&later));
    }

    #[tokio::test]
    async fn test_write_then_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let checkpoint = Checkpoint {
            timestamp: Utc.with_ymd_and_hms(2026, 8, 1, 12, 30, 45).unwrap(),
            processed: vec!["a-b".to_string(), "c-d".to_string()],
            failed: vec!["e-f".to_string()],
            running: vec!["g-h".to_string()],
            stats: snapshot(),
        };

        write_checkpoint(dir.path(), &checkpoint)
            .await
            .expect("write should succeed");
        let loaded = load_latest(dir.path())
            .await
            .expect("load should succeed")
            .expect("checkpoint should exist");

        assert_eq!(loaded, checkpoint);
    }

    #[tokio::test]
    async fn test_load_latest_picks_greatest_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        for hour in [9, 14, 11] {
            let checkpoint = Checkpoint {
                timestamp: Utc.with_ymd_and_hms(2026, 8, 1, hour, 0, 0).unwrap(),
                processed: vec![format!("song-{hour}")],
                failed: Vec::new(),
                running: Vec::new(),
                stats: snapshot(),
            };
            write_checkpoint(dir.path(), &checkpoint).await.expect("write");
        }

        let loaded = load_latest(dir.path()).await.expect("load").expect("some");
        assert_eq!(loaded.processed, vec!["song-14".to_string()]);
    }

    #[tokio::test]
    async fn test_load_latest_empty_dir_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = load_latest(dir.path()).await.expect("load");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_load_latest_missing_dir_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        let loaded = load_latest(&missing).await.expect("load");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_load_latest_corrupt_file_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("checkpoint-2026.json"), "{not json")
            .await
            .expect("write");
        assert!(load_latest(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_ignores_unrelated_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("notes.txt"), "hello")
            .await
            .expect("write");
        let loaded = load_latest(dir.path()).await.expect("load");
        assert!(loaded.is_none());
    }
}
