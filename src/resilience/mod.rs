//! Progress tracking, deduplicated accounting and checkpointing.
//!
//! The [`ResilienceManager`] is the bookkeeping side of the pipeline:
//!
//! - **Stats**: counts unique completed songs, failure events and retries
//! - **Deduplication**: a song retried several times, or submitted twice,
//!   counts once toward `processed` on its first success
//! - **Checkpoints**: periodic and at-shutdown snapshots to durable storage,
//!   read back once at startup to seed the dedup set
//! - **Monitor**: a background interval task that warns when the success
//!   rate falls below the configured threshold
//!
//! One instance is constructed at startup and shared by reference with the
//! queue; tests build fresh instances against temporary directories.

pub mod checkpoint;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::queue::TaskEvent;

pub use checkpoint::{checkpoint_filename, load_latest, write_checkpoint, Checkpoint};

/// Errors that can occur while tracking or persisting progress.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// Checkpoint directory or file IO failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint (de)serialization failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A point-in-time view of pipeline statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    /// Unique songs completed successfully.
    pub processed: u64,
    /// Failure events, including failed attempts that were later retried.
    pub failed: u64,
    /// Retry events.
    pub retries: u64,
    /// Distinct task ids observed so far.
    pub total_tasks: u64,
    /// When this run started.
    pub started_at: DateTime<Utc>,
    /// Time elapsed since start, in milliseconds.
    pub runtime_ms: u64,
    /// `processed / (processed + failed) * 100`, or `None` before any
    /// terminal outcome; callers must guard the `None` case for display.
    pub success_rate: Option<f64>,
    /// Timestamp of the most recent checkpoint, if any.
    pub last_checkpoint: Option<DateTime<Utc>>,
}

/// Interior counters guarded by one lock.
#[derive(Debug, Default)]
struct State {
    processed_songs: HashSet<String>,
    seen_tasks: HashSet<String>,
    failed: u64,
    retries: u64,
    last_checkpoint: Option<DateTime<Utc>>,
    /// `processed_songs.len()` at the time of the last checkpoint; drives
    /// the periodic cadence.
    checkpointed_count: u64,
}

/// Tracks running statistics and persists/recovers checkpoints.
pub struct ResilienceManager {
    checkpoint_dir: PathBuf,
    checkpoint_interval: u64,
    error_threshold: f64,
    started_at: DateTime<Utc>,
    started: Instant,
    state: Mutex<State>,
}

impl ResilienceManager {
    /// Creates a manager writing checkpoints into `checkpoint_dir`.
    ///
    /// `checkpoint_interval` is the number of unique completions between
    /// periodic checkpoints; `error_threshold` is the tolerated failure
    /// fraction before the monitor warns.
    pub fn new(
        checkpoint_dir: impl Into<PathBuf>,
        checkpoint_interval: u64,
        error_threshold: f64,
    ) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            checkpoint_interval: checkpoint_interval.max(1),
            error_threshold,
            started_at: Utc::now(),
            started: Instant::now(),
            state: Mutex::new(State::default()),
        }
    }

    /// Prepares the checkpoint directory and recovers the latest checkpoint.
    ///
    /// When a checkpoint is found, its `processed` list seeds the dedup set
    /// so a restarted run does not double-count songs completed before the
    /// crash. Returns the recovered checkpoint for caller-side logging.
    pub async fn initialize(&self) -> Result<Option<Checkpoint>, ResilienceError> {
        tokio::fs::create_dir_all(&self.checkpoint_dir).await?;

        let recovered = self.load_last_checkpoint().await;
        if let Some(checkpoint) = &recovered {
            let mut state = self.lock_state();
            for song_id in &checkpoint.processed {
                state.processed_songs.insert(song_id.clone());
            }
            state.checkpointed_count = state.processed_songs.len() as u64;
            info!(
                checkpoint_time = %checkpoint.timestamp,
                recovered_songs = checkpoint.processed.len(),
                "recovered from checkpoint"
            );
        }
        Ok(recovered)
    }

    /// Applies a task lifecycle event to the running statistics.
    ///
    /// A `Retry` records both a retry and a failure event (the attempt did
    /// fail), and a terminal `Failed` records one more failure event, so a
    /// task that exhausts its budget of `r` retries contributes `r + 1`
    /// failures in total.
    pub fn apply(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Dispatched { .. } => {}
            TaskEvent::Finished { task_id, song } => {
                self.record_success(&song.id(), task_id);
            }
            TaskEvent::Retry { task_id, .. } => {
                self.record_retry(task_id);
            }
            TaskEvent::Failed { task_id, .. } => {
                self.record_failure(task_id);
            }
        }
    }

    /// Records a successful completion; returns whether `song_id` was new.
    pub fn record_success(&self, song_id: &str, task_id: &str) -> bool {
        let mut state = self.lock_state();
        state.seen_tasks.insert(task_id.to_string());
        state.processed_songs.insert(song_id.to_string())
    }

    /// Records one failure event. Not deduplicated: repeated failures of
    /// the same task each count.
    pub fn record_failure(&self, task_id: &str) {
        let mut state = self.lock_state();
        state.seen_tasks.insert(task_id.to_string());
        state.failed += 1;
    }

    /// Records a retry event, which also counts as a failure event.
    pub fn record_retry(&self, task_id: &str) {
        let mut state = self.lock_state();
        state.seen_tasks.insert(task_id.to_string());
        state.retries += 1;
        state.failed += 1;
    }

    /// Returns a snapshot of the current statistics.
    pub fn stats(&self) -> StatsSnapshot {
        let state = self.lock_state();
        let processed = state.processed_songs.len() as u64;
        let terminal = processed + state.failed;
        let success_rate = if terminal == 0 {
            None
        } else {
            Some(processed as f64 / terminal as f64 * 100.0)
        };

        StatsSnapshot {
            processed,
            failed: state.failed,
            retries: state.retries,
            total_tasks: state.seen_tasks.len() as u64,
            started_at: self.started_at,
            runtime_ms: self.started.elapsed().as_millis() as u64,
            success_rate,
            last_checkpoint: state.last_checkpoint,
        }
    }

    /// Writes a checkpoint of current progress and returns its path.
    ///
    /// `running` and `failed` are the task ids currently in flight and
    /// terminally failed, as reported by the queue; the `processed` list is
    /// the manager's own completed-song set, which is what recovery seeds
    /// from.
    pub async fn create_checkpoint(
        &self,
        running: &[String],
        failed: &[String],
    ) -> Result<PathBuf, ResilienceError> {
        let timestamp = Utc::now();
        let processed = {
            let state = self.lock_state();
            let mut processed: Vec<String> = state.processed_songs.iter().cloned().collect();
            processed.sort();
            processed
        };

        let checkpoint = Checkpoint {
            timestamp,
            processed,
            failed: failed.to_vec(),
            running: running.to_vec(),
            stats: self.stats(),
        };

        let path = checkpoint::write_checkpoint(&self.checkpoint_dir, &checkpoint).await?;

        {
            let mut state = self.lock_state();
            state.last_checkpoint = Some(timestamp);
            state.checkpointed_count = state.processed_songs.len() as u64;
        }

        info!(
            path = %path.display(),
            processed = checkpoint.processed.len(),
            failed = checkpoint.failed.len(),
            running = checkpoint.running.len(),
            "checkpoint created"
        );
        Ok(path)
    }

    /// Checkpoints when enough unique completions have accumulated since the
    /// last snapshot; returns the path of the new checkpoint, if one was
    /// written.
    pub async fn checkpoint_if_due(
        &self,
        running: &[String],
        failed: &[String],
    ) -> Result<Option<PathBuf>, ResilienceError> {
        let due = {
            let state = self.lock_state();
            state.processed_songs.len() as u64 >= state.checkpointed_count + self.checkpoint_interval
        };
        if !due {
            return Ok(None);
        }
        self.create_checkpoint(running, failed).await.map(Some)
    }

    /// Loads the most recent checkpoint, treating read or parse failures as
    /// "none found" after logging them.
    pub async fn load_last_checkpoint(&self) -> Option<Checkpoint> {
        match checkpoint::load_latest(&self.checkpoint_dir).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(error = %e, "failed to load checkpoint");
                None
            }
        }
    }

    /// Spawns the background error-rate monitor.
    ///
    /// On each tick the monitor warns when the success rate drops below
    /// `(1 - error_threshold) * 100`. Observational only: it does not
    /// throttle dispatch.
    pub fn spawn_monitor(self: std::sync::Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = manager.stats();
                if let Some(rate) = stats.success_rate {
                    let floor = (1.0 - manager.error_threshold) * 100.0;
                    if rate < floor {
                        warn!(
                            success_rate = format!("{rate:.1}%"),
                            failed = stats.failed,
                            processed = stats.processed,
                            "high error rate detected"
                        );
                    }
                }
            }
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        // The lock is only held for short, non-async sections; a poisoned
        // lock means a panic mid-update, and the counters are still usable.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
