//! The task queue dispatcher.
//!
//! `TaskQueue` accepts song submissions, persists them, and drives them
//! through the retry state machine
//! `QUEUED → DISPATCHED → {SUCCEEDED | RETRY_QUEUED | FAILED}` under a
//! global concurrency ceiling. A single dispatcher task owns the FIFO queue
//! and all routing decisions, so no two workers can ever race over task
//! ownership; workers only talk back through their response channels.
//!
//! Each state transition emits exactly one typed [`TaskEvent`]: it is
//! applied to the [`ResilienceManager`] synchronously and broadcast once for
//! observers such as the audit log.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::pool::{WorkerPool, WorkerResponse};
use crate::resilience::ResilienceManager;

use super::store::{StoreError, TaskStore};
use super::task::{Song, Task, TaskEvent, TaskFailure, TaskResult, TaskState};

/// Capacity of the lifecycle-event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors that can occur when interacting with the queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The submitted song lacks a title or artist.
    #[error("song must include both a title and an artist")]
    InvalidSong,

    /// The queue is shutting down and no longer accepts work.
    #[error("queue is shutting down")]
    ShuttingDown,

    /// The durable task store failed.
    #[error("task store error: {0}")]
    Store(#[from] StoreError),
}

/// Messages processed by the dispatcher task.
enum DispatcherMsg {
    /// A new submission from a caller.
    Submit(Task),
    /// A retried task whose delay has elapsed.
    RetryReady(Task),
    /// A worker posted the terminal response for an attempt.
    AttemptDone { task: Task, response: WorkerResponse },
    /// Fail out everything still queued and stop the dispatcher.
    Drain { ack: oneshot::Sender<()> },
}

/// State shared between the queue facade, the dispatcher task and shutdown.
struct QueueShared {
    shutting_down: AtomicBool,
    /// Count of dispatched-but-unresolved attempts; watched during the
    /// shutdown grace period.
    in_flight: watch::Sender<usize>,
    /// Task ids currently dispatched to a worker.
    running: Mutex<HashSet<String>>,
    /// Task ids that failed terminally.
    failed: Mutex<HashSet<String>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a submitted task, resolving to its terminal result.
#[derive(Debug)]
pub struct TaskHandle {
    song: Song,
    receiver: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    /// The song this handle tracks.
    pub fn song(&self) -> &Song {
        &self.song
    }

    /// Waits for the terminal result.
    ///
    /// If the queue shuts down before the task finishes, this resolves to a
    /// failure rather than hanging.
    pub async fn wait(self) -> TaskResult {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(TaskFailure {
                song: self.song,
                reason: "queue closed before the task completed".to_string(),
                attempts: 0,
            }),
        }
    }
}

/// The task queue: durable submission, bounded dispatch, retries, events
/// and graceful shutdown.
#[derive(Clone)]
pub struct TaskQueue {
    submit_tx: mpsc::UnboundedSender<DispatcherMsg>,
    events: broadcast::Sender<TaskEvent>,
    pool: Arc<WorkerPool>,
    resilience: Arc<ResilienceManager>,
    store: TaskStore,
    shared: Arc<QueueShared>,
    shutdown_grace: Duration,
}

impl TaskQueue {
    /// Starts the queue: reports task entries left over from a previous
    /// run, then spawns the dispatcher and the background error-rate
    /// monitor.
    pub async fn start(
        config: &AppConfig,
        pool: Arc<WorkerPool>,
        resilience: Arc<ResilienceManager>,
        store: TaskStore,
    ) -> Result<Self, QueueError> {
        let leftover = store.pending().await?;
        if !leftover.is_empty() {
            info!(
                count = leftover.len(),
                "found task entries from a previous run"
            );
            for entry in &leftover {
                debug!(
                    task_id = %entry.task_id,
                    state = %entry.state,
                    attempts = entry.attempts,
                    "previous-run task entry"
                );
            }
        }

        let (submit_tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (in_flight, _) = watch::channel(0usize);

        let shared = Arc::new(QueueShared {
            shutting_down: AtomicBool::new(false),
            in_flight,
            running: Mutex::new(HashSet::new()),
            failed: Mutex::new(HashSet::new()),
            monitor: Mutex::new(None),
            dispatcher: Mutex::new(None),
        });

        let dispatcher = Dispatcher {
            rx,
            tx: submit_tx.clone(),
            queue: VecDeque::new(),
            events: events.clone(),
            pool: Arc::clone(&pool),
            resilience: Arc::clone(&resilience),
            store: store.clone(),
            shared: Arc::clone(&shared),
            worker_count: config.worker_count,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        };
        let dispatcher_handle = tokio::spawn(dispatcher.run());
        *lock(&shared.dispatcher) = Some(dispatcher_handle);

        let monitor_handle = Arc::clone(&resilience).spawn_monitor(config.monitor_interval);
        *lock(&shared.monitor) = Some(monitor_handle);

        info!(
            workers = config.worker_count,
            max_retries = config.max_retries,
            "queue started"
        );

        Ok(Self {
            submit_tx,
            events,
            pool,
            resilience,
            store,
            shared,
            shutdown_grace: config.shutdown_grace,
        })
    }

    /// Submits a song for processing.
    ///
    /// Rejects immediately when the song lacks a title or artist. On
    /// success the pending entry is persisted and the task enters the FIFO
    /// queue; the returned handle resolves once the task reaches a terminal
    /// state.
    pub async fn submit(&self, song: Song) -> Result<TaskHandle, QueueError> {
        if !song.is_valid() {
            return Err(QueueError::InvalidSong);
        }
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }

        let (responder, receiver) = oneshot::channel();
        let task = Task::new(song.clone(), responder);
        self.store
            .upsert(&task.task_id(), &song, TaskState::Queued, 0)
            .await?;

        self.submit_tx
            .send(DispatcherMsg::Submit(task))
            .map_err(|_| QueueError::ShuttingDown)?;

        Ok(TaskHandle { song, receiver })
    }

    /// Subscribes to the typed lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Number of attempts currently dispatched to workers.
    pub fn in_flight(&self) -> usize {
        *self.shared.in_flight.borrow()
    }

    /// Gracefully shuts the queue down. Idempotent; later calls return
    /// immediately.
    ///
    /// Order of operations: write a checkpoint of in-flight and failed task
    /// ids, wait up to the grace period for in-flight work (terminal
    /// results arriving during the wait are still processed), forcibly
    /// terminate all workers, fail out anything still queued, and close the
    /// task store. Queued entries stay in the store so the next run can
    /// report them.
    pub async fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting graceful shutdown");

        let running = snapshot(&self.shared.running);
        let failed = snapshot(&self.shared.failed);
        if let Err(e) = self.resilience.create_checkpoint(&running, &failed).await {
            error!(error = %e, "failed to write shutdown checkpoint");
        }

        let active = *self.shared.in_flight.borrow();
        if active > 0 {
            info!(
                active,
                grace_secs = self.shutdown_grace.as_secs(),
                "waiting for in-flight tasks to finish"
            );
            let mut watcher = self.shared.in_flight.subscribe();
            let drained = tokio::time::timeout(
                self.shutdown_grace,
                watcher.wait_for(|count| *count == 0),
            )
            .await;
            if drained.is_err() {
                warn!(
                    abandoned = *self.shared.in_flight.borrow(),
                    "grace period elapsed; abandoning in-flight tasks"
                );
            }
        }

        self.pool.terminate_all();

        if let Some(handle) = lock(&self.shared.monitor).take() {
            handle.abort();
        }

        let (ack, ack_rx) = oneshot::channel();
        if self.submit_tx.send(DispatcherMsg::Drain { ack }).is_ok() {
            let _ = ack_rx.await;
        }
        let dispatcher_handle = lock(&self.shared.dispatcher).take();
        if let Some(handle) = dispatcher_handle {
            let _ = handle.await;
        }

        self.store.close().await;
        info!("shutdown complete");
    }
}

/// The single dispatcher task: owns the FIFO queue and every routing
/// decision.
struct Dispatcher {
    rx: mpsc::UnboundedReceiver<DispatcherMsg>,
    tx: mpsc::UnboundedSender<DispatcherMsg>,
    queue: VecDeque<Task>,
    events: broadcast::Sender<TaskEvent>,
    pool: Arc<WorkerPool>,
    resilience: Arc<ResilienceManager>,
    store: TaskStore,
    shared: Arc<QueueShared>,
    worker_count: usize,
    max_retries: u32,
    retry_delay: Duration,
}

impl Dispatcher {
    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                DispatcherMsg::Submit(task) => {
                    self.queue.push_back(task);
                    self.pump().await;
                }
                DispatcherMsg::RetryReady(task) => {
                    self.handle_retry_ready(task).await;
                }
                DispatcherMsg::AttemptDone { task, response } => {
                    self.handle_attempt_done(task, response).await;
                    self.pump().await;
                }
                DispatcherMsg::Drain { ack } => {
                    self.drain();
                    let _ = ack.send(());
                    break;
                }
            }
        }
        debug!("dispatcher stopped");
    }

    fn shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    /// Dispatches queued tasks while concurrency slots are free.
    async fn pump(&mut self) {
        while !self.shutting_down() && *self.shared.in_flight.borrow() < self.worker_count {
            let Some(mut task) = self.queue.pop_front() else {
                break;
            };

            let worker_id = match self.pool.acquire() {
                Ok(id) => id,
                Err(e) => {
                    // A free concurrency slot but no assignable worker;
                    // requeue and wait for the next completion.
                    error!(error = %e, "no worker available for dispatch");
                    self.queue.push_front(task);
                    break;
                }
            };

            let attempt = match self.pool.assign(worker_id, task.song.clone()) {
                Ok(attempt) => attempt,
                Err(e) => {
                    warn!(worker_id, error = %e, "assignment failed");
                    self.queue.push_front(task);
                    break;
                }
            };

            task.increment_attempts();
            let task_id = task.task_id();
            if let Err(e) = self
                .store
                .mark_state(&task_id, TaskState::Dispatched, task.attempts)
                .await
            {
                warn!(task_id = %task_id, error = %e, "failed to persist dispatch transition");
            }

            self.shared.in_flight.send_modify(|count| *count += 1);
            lock(&self.shared.running).insert(task_id.clone());
            self.emit(TaskEvent::Dispatched {
                task_id,
                worker_id,
                attempt: task.attempts,
            });

            let tx = self.tx.clone();
            tokio::spawn(async move {
                let response = attempt.wait().await;
                let _ = tx.send(DispatcherMsg::AttemptDone { task, response });
            });
        }
    }

    async fn handle_attempt_done(&mut self, task: Task, response: WorkerResponse) {
        let task_id = task.task_id();
        self.shared
            .in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
        lock(&self.shared.running).remove(&task_id);

        match response {
            WorkerResponse::Success(payload) => {
                if let Err(e) = self.store.remove(&task_id).await {
                    warn!(task_id = %task_id, error = %e, "failed to clear finished task");
                }
                self.emit(TaskEvent::Finished {
                    task_id,
                    song: task.song.clone(),
                });

                let running = snapshot(&self.shared.running);
                let failed = snapshot(&self.shared.failed);
                match self.resilience.checkpoint_if_due(&running, &failed).await {
                    Ok(Some(path)) => debug!(path = %path.display(), "periodic checkpoint written"),
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "periodic checkpoint failed"),
                }

                let _ = task.responder.send(Ok(payload));
            }
            WorkerResponse::Failure { reason } => {
                if !self.shutting_down() && task.should_retry(self.max_retries) {
                    self.emit(TaskEvent::Retry {
                        task_id: task_id.clone(),
                        reason: reason.clone(),
                        attempt: task.attempts,
                    });
                    if let Err(e) = self
                        .store
                        .mark_state(&task_id, TaskState::RetryQueued, task.attempts)
                        .await
                    {
                        warn!(task_id = %task_id, error = %e, "failed to persist retry transition");
                    }

                    let tx = self.tx.clone();
                    let delay = self.retry_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(DispatcherMsg::RetryReady(task));
                    });
                } else {
                    self.finalize_failure(task, reason).await;
                }
            }
        }
    }

    async fn handle_retry_ready(&mut self, task: Task) {
        if self.shutting_down() {
            self.finalize_failure(task, "queue shut down before the task could be retried".to_string())
                .await;
            return;
        }

        let task_id = task.task_id();
        if let Err(e) = self
            .store
            .mark_state(&task_id, TaskState::Queued, task.attempts)
            .await
        {
            warn!(task_id = %task_id, error = %e, "failed to persist requeue transition");
        }

        // Retried tasks go to the back of the queue, not the front.
        self.queue.push_back(task);
        self.pump().await;
    }

    async fn finalize_failure(&mut self, task: Task, reason: String) {
        let task_id = task.task_id();
        lock(&self.shared.failed).insert(task_id.clone());
        if let Err(e) = self.store.remove(&task_id).await {
            warn!(task_id = %task_id, error = %e, "failed to clear failed task");
        }

        self.emit(TaskEvent::Failed {
            task_id,
            song: task.song.clone(),
            reason: reason.clone(),
            attempts: task.attempts,
        });

        let failure = TaskFailure {
            song: task.song.clone(),
            reason,
            attempts: task.attempts,
        };
        let _ = task.responder.send(Err(failure));
    }

    /// Fails out everything still queued. Their store entries are kept so
    /// the next run can report them.
    fn drain(&mut self) {
        let drained = self.queue.len();
        for task in self.queue.drain(..) {
            let failure = TaskFailure {
                song: task.song.clone(),
                reason: "queue shut down before the task ran".to_string(),
                attempts: task.attempts,
            };
            let _ = task.responder.send(Err(failure));
        }
        if drained > 0 {
            info!(count = drained, "failed out queued tasks during shutdown");
        }
    }

    /// Applies the event to the resilience manager and broadcasts it, once
    /// per transition.
    fn emit(&self, event: TaskEvent) {
        self.resilience.apply(&event);
        match &event {
            TaskEvent::Dispatched {
                task_id,
                worker_id,
                attempt,
            } => debug!(task_id = %task_id, worker_id, attempt, "task dispatched"),
            TaskEvent::Finished { task_id, .. } => info!(task_id = %task_id, "task completed"),
            TaskEvent::Retry {
                task_id,
                reason,
                attempt,
            } => warn!(task_id = %task_id, attempt, reason = %reason, "retrying task"),
            TaskEvent::Failed {
                task_id,
                reason,
                attempts,
                ..
            } => error!(task_id = %task_id, attempts, reason = %reason, "task failed"),
        }
        // No subscribers is fine; the resilience manager was already updated.
        let _ = self.events.send(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn snapshot(set: &Mutex<HashSet<String>>) -> Vec<String> {
    let mut ids: Vec<String> = lock(set).iter().cloned().collect();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_handle_maps_closed_channel_to_failure() {
        let song = Song::new("Magnolia", "Playboi Carti");
        let (responder, receiver) = oneshot::channel();
        let handle = TaskHandle {
            song: song.clone(),
            receiver,
        };
        drop(responder);

        let result = handle.wait().await;
        let failure = result.expect_err("closed channel should fail");
        assert_eq!(failure.song, song);
        assert!(failure.reason.contains("queue closed"));
    }

    #[test]
    fn test_queue_error_display() {
        assert!(QueueError::InvalidSong.to_string().contains("title"));
        assert!(QueueError::ShuttingDown.to_string().contains("shutting down"));
    }
}
