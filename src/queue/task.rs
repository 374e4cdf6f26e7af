//! Task definitions for the lyrics queue.
//!
//! This module defines the core types that flow through the queue:
//!
//! - `Song`: A song reference (title + artist) submitted by callers
//! - `Task`: A unit of work carrying a song through dispatch and retries
//! - `TaskResult`: Terminal outcome delivered back to the submitter
//! - `TaskEvent`: Typed lifecycle notification emitted by the dispatcher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// A song reference submitted to the queue.
///
/// The derived [`Song::id`] doubles as the task identity and the
/// deduplication key: retried attempts of the same submission share it, and
/// independent submissions of the same song collide on it by design.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Song {
    /// Song title as supplied by the caller.
    pub title: String,
    /// Performing artist as supplied by the caller.
    pub artist: String,
}

impl Song {
    /// Creates a new song reference.
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
        }
    }

    /// Returns the normalized identity for this song.
    ///
    /// The id is `"artist-title"` with every run of whitespace collapsed to a
    /// single underscore, so `"Playboi Carti"` / `"Long  Time"` becomes
    /// `Playboi_Carti-Long_Time`.
    pub fn id(&self) -> String {
        format!("{}-{}", self.artist, self.title)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Returns whether the song carries both a non-blank title and artist.
    pub fn is_valid(&self) -> bool {
        !self.title.trim().is_empty() && !self.artist.trim().is_empty()
    }
}

impl std::fmt::Display for Song {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.artist, self.title)
    }
}

/// Lifecycle state of a task, persisted to the durable task store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in the FIFO queue for a free concurrency slot.
    Queued,
    /// Handed to a worker; an attempt is in flight.
    Dispatched,
    /// A failed attempt is waiting out the retry delay.
    RetryQueued,
    /// Terminal success.
    Succeeded,
    /// Terminal failure after exhausting retries.
    Failed,
}

impl TaskState {
    /// Stable textual form used in the task store.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Dispatched => "dispatched",
            TaskState::RetryQueued => "retry_queued",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successfully fetched lyrics, as delivered to the submitter and upserted
/// into the result store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LyricsPayload {
    pub title: String,
    pub artist: String,
    /// Page the lyrics were extracted from.
    pub source_url: String,
    pub lyrics: String,
    pub fetched_at: DateTime<Utc>,
}

/// Terminal failure delivered to the submitter once retries are exhausted
/// (or the queue shut down before the task could finish).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskFailure {
    /// The song the task was for.
    pub song: Song,
    /// Human-readable reason from the last failed attempt.
    pub reason: String,
    /// Number of dispatch attempts made before giving up.
    pub attempts: u32,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "'{}' failed after {} attempt(s): {}",
            self.song, self.attempts, self.reason
        )
    }
}

/// Terminal outcome of a task.
pub type TaskResult = Result<LyricsPayload, TaskFailure>;

/// A unit of work owned by the dispatcher.
///
/// The task keeps its reply channel across retries so the original
/// submitter's future resolves exactly once, on the terminal transition.
#[derive(Debug)]
pub struct Task {
    /// The song to fetch lyrics for.
    pub song: Song,
    /// Dispatch attempts made so far (0 until first dispatch).
    pub attempts: u32,
    /// Channel resolving the submitter's [`TaskResult`].
    pub responder: oneshot::Sender<TaskResult>,
}

impl Task {
    /// Creates a task for `song`, replying on `responder` when terminal.
    pub fn new(song: Song, responder: oneshot::Sender<TaskResult>) -> Self {
        Self {
            song,
            attempts: 0,
            responder,
        }
    }

    /// Returns the task identity (same derivation as [`Song::id`]).
    pub fn task_id(&self) -> String {
        self.song.id()
    }

    /// Counts a dispatch attempt. Called once per hand-off to a worker.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Whether a failed attempt may be retried.
    ///
    /// A task gets `max_retries` retries on top of its initial attempt, so
    /// the total number of dispatches never exceeds `max_retries + 1`.
    pub fn should_retry(&self, max_retries: u32) -> bool {
        self.attempts <= max_retries
    }

    /// Retries used so far (attempts beyond the first).
    pub fn retries_used(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Typed lifecycle notification, emitted exactly once per task transition.
///
/// The dispatcher applies each event to the resilience manager synchronously
/// and broadcasts it once for observers such as the audit log.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task was handed to a worker (`QUEUED → DISPATCHED`).
    Dispatched {
        task_id: String,
        worker_id: u32,
        attempt: u32,
    },
    /// A task finished successfully (`DISPATCHED → SUCCEEDED`).
    Finished { task_id: String, song: Song },
    /// An attempt failed and the task is waiting to be requeued
    /// (`DISPATCHED → RETRY_QUEUED`).
    Retry {
        task_id: String,
        reason: String,
        /// The attempt number that just failed.
        attempt: u32,
    },
    /// A task failed terminally (`DISPATCHED → FAILED`).
    Failed {
        task_id: String,
        song: Song,
        reason: String,
        attempts: u32,
    },
}

impl TaskEvent {
    /// The task identity the event refers to.
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Dispatched { task_id, .. }
            | TaskEvent::Finished { task_id, .. }
            | TaskEvent::Retry { task_id, .. }
            | TaskEvent::Failed { task_id, .. } => task_id,
        }
    }
}
