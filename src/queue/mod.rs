//! Durable task queue with bounded dispatch and retries.
//!
//! This module provides the work-routing half of the pipeline:
//!
//! - **TaskQueue**: accepts submissions, persists pending entries, enforces
//!   the concurrency ceiling and drives the retry state machine
//! - **TaskStore**: SQLite-backed store so task identity survives a crash
//! - **Task / TaskEvent**: the work items and their typed lifecycle events
//!
//! # Architecture
//!
//! ```text
//!      ┌──────────┐  submit()   ┌────────────────┐  assign   ┌─────────┐
//!      │  Caller  │────────────▶│   Dispatcher   │──────────▶│ Worker 1│
//!      └──────────┘   handle    │ (FIFO + retry) │           ├─────────┤
//!            ▲                  └───────┬────────┘◀──────────│ Worker N│
//!            │                          │          responses └─────────┘
//!            │ terminal result          │ events
//!            │                          ▼
//!            │                ┌───────────────────┐
//!            └────────────────│ Resilience + Audit│
//!                             └───────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use lyricforge::config::AppConfig;
//! use lyricforge::pool::WorkerPool;
//! use lyricforge::queue::{Song, TaskQueue, TaskStore};
//! use lyricforge::resilience::ResilienceManager;
//! use std::sync::Arc;
//!
//! let config = AppConfig::from_env()?;
//! let resilience = Arc::new(ResilienceManager::new(
//!     config.checkpoint_dir(),
//!     config.checkpoint_interval,
//!     config.error_threshold,
//! ));
//! resilience.initialize().await?;
//!
//! let pool = Arc::new(WorkerPool::new(config.worker_count, fetcher));
//! let store = TaskStore::open(&config.task_db_path()).await?;
//! let queue = TaskQueue::start(&config, pool, resilience, store).await?;
//!
//! let handle = queue.submit(Song::new("Magnolia", "Playboi Carti")).await?;
//! let result = handle.wait().await;
//!
//! queue.shutdown().await;
//! ```

pub mod dispatcher;
pub mod store;
pub mod task;

// Re-export main types for convenience
pub use dispatcher::{QueueError, TaskHandle, TaskQueue};
pub use store::{StoreError, StoredTask, TaskStore};
pub use task::{LyricsPayload, Song, Task, TaskEvent, TaskFailure, TaskResult, TaskState};
