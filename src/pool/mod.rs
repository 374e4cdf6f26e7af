//! Worker pool: isolated units executing one fetch at a time.
//!
//! Each worker is an independent tokio task that owns nothing but its
//! request channel: it receives exactly one task message, invokes the shared
//! [`LyricsFetcher`], and always posts back exactly one terminal response:
//! a fetch error becomes a failure response, and a worker that dies outright
//! drops its reply channel, which the pool converts to a terminal failure.
//! The pool therefore never waits indefinitely on a worker.
//!
//! # Busy tracking
//!
//! Every worker carries an atomic busy flag, set inside [`WorkerPool::assign`]
//! before the request is sent and cleared when the terminal response is
//! received. Free-worker lookup scans this flag rather than inferring
//! idleness from in-flight messages, so a worker can never be double-assigned
//! while a previous response is still propagating.
//!
//! # Capacity
//!
//! Workers are created lazily, up to a hard cap the pool enforces itself:
//! [`WorkerPool::create_worker`] refuses beyond `capacity` regardless of how
//! the caller is configured.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fetcher::LyricsFetcher;
use crate::queue::{LyricsPayload, Song};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool already holds `capacity` workers.
    #[error("worker pool capacity of {0} reached")]
    CapacityReached(usize),

    /// No worker with the given id exists.
    #[error("worker {0} not found")]
    UnknownWorker(u32),

    /// The worker is currently executing another task.
    #[error("worker {0} is busy")]
    WorkerBusy(u32),

    /// The worker's request channel is gone (it was terminated or died).
    #[error("worker {0} is no longer accepting tasks")]
    WorkerUnavailable(u32),
}

/// One task message sent to a worker.
struct WorkerRequest {
    song: Song,
    reply: oneshot::Sender<WorkerResponse>,
}

/// The single terminal message a worker posts back per request.
#[derive(Debug)]
pub enum WorkerResponse {
    /// The fetch succeeded.
    Success(LyricsPayload),
    /// The fetch failed; `reason` carries the typed fetch error's message.
    Failure { reason: String },
}

struct WorkerSlot {
    id: u32,
    busy: Arc<AtomicBool>,
    sender: mpsc::Sender<WorkerRequest>,
    handle: JoinHandle<()>,
}

/// A bounded pool of lazily created workers.
pub struct WorkerPool {
    capacity: usize,
    fetcher: Arc<dyn LyricsFetcher>,
    slots: Mutex<Vec<WorkerSlot>>,
    next_id: AtomicU32,
}

impl WorkerPool {
    /// Creates an empty pool that will hold at most `capacity` workers, all
    /// sharing `fetcher` (and therefore its rate limiter).
    pub fn new(capacity: usize, fetcher: Arc<dyn LyricsFetcher>) -> Self {
        Self {
            capacity,
            fetcher,
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Returns the id of the first idle worker, if any.
    pub fn free_worker(&self) -> Option<u32> {
        let slots = self.lock_slots();
        slots
            .iter()
            .find(|slot| !slot.busy.load(Ordering::SeqCst))
            .map(|slot| slot.id)
    }

    /// Spawns a new worker and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::CapacityReached`] when the pool is full; the cap
    /// is an invariant of the pool itself, not of its callers.
    pub fn create_worker(&self) -> Result<u32, PoolError> {
        let mut slots = self.lock_slots();
        if slots.len() >= self.capacity {
            return Err(PoolError::CapacityReached(self.capacity));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        // Capacity 1: a worker holds at most one task at a time.
        let (sender, receiver) = mpsc::channel(1);
        let busy = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_worker(id, receiver, Arc::clone(&self.fetcher)));

        slots.push(WorkerSlot {
            id,
            busy,
            sender,
            handle,
        });
        info!(worker_id = id, "created new worker");
        Ok(id)
    }

    /// Returns an idle worker, creating one when none is free and the cap
    /// allows it.
    pub fn acquire(&self) -> Result<u32, PoolError> {
        match self.free_worker() {
            Some(id) => Ok(id),
            None => self.create_worker(),
        }
    }

    /// Assigns `song` to the given worker.
    ///
    /// Marks the worker busy, sends the single request message, and returns
    /// a [`PendingAttempt`] that resolves to the worker's terminal response
    /// and clears the busy flag on receipt.
    pub fn assign(&self, worker_id: u32, song: Song) -> Result<PendingAttempt, PoolError> {
        let (busy, sender) = {
            let slots = self.lock_slots();
            let slot = slots
                .iter()
                .find(|slot| slot.id == worker_id)
                .ok_or(PoolError::UnknownWorker(worker_id))?;
            (Arc::clone(&slot.busy), slot.sender.clone())
        };

        if busy.swap(true, Ordering::SeqCst) {
            return Err(PoolError::WorkerBusy(worker_id));
        }

        let (reply, receiver) = oneshot::channel();
        if sender.try_send(WorkerRequest { song, reply }).is_err() {
            busy.store(false, Ordering::SeqCst);
            return Err(PoolError::WorkerUnavailable(worker_id));
        }

        Ok(PendingAttempt {
            worker_id,
            busy,
            receiver,
        })
    }

    /// Number of workers currently marked busy.
    pub fn busy_count(&self) -> usize {
        let slots = self.lock_slots();
        slots
            .iter()
            .filter(|slot| slot.busy.load(Ordering::SeqCst))
            .count()
    }

    /// Number of workers currently alive in the pool.
    pub fn size(&self) -> usize {
        self.lock_slots().len()
    }

    /// The maximum number of workers this pool will ever hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forcibly stops every worker. Used only during shutdown; in-flight
    /// fetches are abandoned, and their pending attempts resolve as
    /// failures.
    pub fn terminate_all(&self) {
        let mut slots = self.lock_slots();
        let count = slots.len();
        for slot in slots.drain(..) {
            slot.handle.abort();
        }
        if count > 0 {
            info!(workers = count, "terminated all workers");
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<WorkerSlot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// An in-flight assignment awaiting its worker's terminal response.
#[derive(Debug)]
pub struct PendingAttempt {
    worker_id: u32,
    busy: Arc<AtomicBool>,
    receiver: oneshot::Receiver<WorkerResponse>,
}

impl PendingAttempt {
    /// The worker executing this attempt.
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Waits for the terminal response and clears the worker's busy flag.
    ///
    /// A dropped reply channel (worker death or termination) resolves as a
    /// failure rather than hanging.
    pub async fn wait(self) -> WorkerResponse {
        let response = match self.receiver.await {
            Ok(response) => response,
            Err(_) => WorkerResponse::Failure {
                reason: format!("worker {} terminated before replying", self.worker_id),
            },
        };
        self.busy.store(false, Ordering::SeqCst);
        response
    }
}

/// Worker entry routine: serve one request at a time until the channel
/// closes or the task is aborted.
async fn run_worker(id: u32, mut requests: mpsc::Receiver<WorkerRequest>, fetcher: Arc<dyn LyricsFetcher>) {
    debug!(worker_id = id, "worker started");
    while let Some(request) = requests.recv().await {
        let WorkerRequest { song, reply } = request;
        let response = match fetcher.fetch_lyrics(&song).await {
            Ok(fetched) => WorkerResponse::Success(LyricsPayload {
                title: song.title.clone(),
                artist: song.artist.clone(),
                source_url: fetched.source_url,
                lyrics: fetched.lyrics,
                fetched_at: Utc::now(),
            }),
            Err(e) => {
                warn!(worker_id = id, song = %song, error = %e, "fetch attempt failed");
                WorkerResponse::Failure {
                    reason: e.to_string(),
                }
            }
        };
        // The assignment side may have given up (e.g. shutdown); a failed
        // send is not an error for the worker.
        let _ = reply.send(response);
    }
    debug!(worker_id = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{FetchError, FetchedLyrics};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Test fetcher with scriptable behavior per call.
    struct StubFetcher {
        fail: bool,
        panic: bool,
        delay: Duration,
    }

    impl StubFetcher {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail: false,
                panic: false,
                delay: Duration::ZERO,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                panic: false,
                delay: Duration::ZERO,
            })
        }

        fn panicking() -> Arc<Self> {
            Arc::new(Self {
                fail: false,
                panic: true,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl LyricsFetcher for StubFetcher {
        async fn fetch_lyrics(&self, song: &Song) -> Result<FetchedLyrics, FetchError> {
            if self.panic {
                panic!("stub fetcher exploded");
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(FetchError::LyricsNotFound {
                    url: "https://genius.com/missing".to_string(),
                });
            }
            Ok(FetchedLyrics {
                source_url: format!("https://genius.com/{}", song.id()),
                lyrics: "la la la".to_string(),
            })
        }
    }

    fn song() -> Song {
        Song::new("Magnolia", "Playboi Carti")
    }

    #[tokio::test]
    async fn test_capacity_enforced_by_pool() {
        let pool = WorkerPool::new(2, StubFetcher::ok());
        pool.create_worker().expect("first worker");
        pool.create_worker().expect("second worker");

        let err = pool.create_worker().expect_err("cap should hold");
        assert!(matches!(err, PoolError::CapacityReached(2)));
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn test_assign_success_round_trip() {
        let pool = WorkerPool::new(1, StubFetcher::ok());
        let id = pool.acquire().expect("acquire");

        let attempt = pool.assign(id, song()).expect("assign");
        assert_eq!(pool.busy_count(), 1);

        match attempt.wait().await {
            WorkerResponse::Success(payload) => {
                assert_eq!(payload.title, "Magnolia");
                assert!(payload.source_url.contains("Playboi_Carti-Magnolia"));
            }
            WorkerResponse::Failure { reason } => panic!("unexpected failure: {reason}"),
        }
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn test_assign_failure_is_terminal_response() {
        let pool = WorkerPool::new(1, StubFetcher::failing());
        let id = pool.acquire().expect("acquire");

        let attempt = pool.assign(id, song()).expect("assign");
        match attempt.wait().await {
            WorkerResponse::Failure { reason } => assert!(reason.contains("no lyrics found")),
            WorkerResponse::Success(_) => panic!("expected failure"),
        }
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn test_busy_worker_rejects_double_assignment() {
        let fetcher = Arc::new(StubFetcher {
            fail: false,
            panic: false,
            delay: Duration::from_millis(200),
        });
        let pool = WorkerPool::new(1, fetcher);
        let id = pool.acquire().expect("acquire");

        let attempt = pool.assign(id, song()).expect("first assign");
        let err = pool.assign(id, song()).expect_err("second assign must fail");
        assert!(matches!(err, PoolError::WorkerBusy(_)));

        attempt.wait().await;
        assert!(pool.assign(id, song()).is_ok());
    }

    #[tokio::test]
    async fn test_worker_panic_resolves_as_failure() {
        let pool = WorkerPool::new(1, StubFetcher::panicking());
        let id = pool.acquire().expect("acquire");

        let attempt = pool.assign(id, song()).expect("assign");
        match attempt.wait().await {
            WorkerResponse::Failure { reason } => {
                assert!(reason.contains("terminated before replying"));
            }
            WorkerResponse::Success(_) => panic!("expected failure"),
        }
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn test_free_worker_scan() {
        let fetcher = Arc::new(StubFetcher {
            fail: false,
            panic: false,
            delay: Duration::from_millis(200),
        });
        let pool = WorkerPool::new(2, fetcher);
        let first = pool.create_worker().expect("worker 1");
        let second = pool.create_worker().expect("worker 2");

        let attempt = pool.assign(first, song()).expect("assign");
        assert_eq!(pool.free_worker(), Some(second));

        attempt.wait().await;
        assert_eq!(pool.free_worker(), Some(first));
    }

    #[tokio::test]
    async fn test_terminate_all_then_assign_fails() {
        let pool = WorkerPool::new(2, StubFetcher::ok());
        let id = pool.acquire().expect("acquire");

        pool.terminate_all();
        assert_eq!(pool.size(), 0);
        let err = pool.assign(id, song()).expect_err("assign after terminate");
        assert!(matches!(err, PoolError::UnknownWorker(_)));
    }

    #[tokio::test]
    async fn test_terminate_resolves_pending_attempt() {
        let fetcher = Arc::new(StubFetcher {
            fail: false,
            panic: false,
            delay: Duration::from_secs(60),
        });
        let pool = WorkerPool::new(1, fetcher);
        let id = pool.acquire().expect("acquire");
        let attempt = pool.assign(id, song()).expect("assign");

        pool.terminate_all();
        match attempt.wait().await {
            WorkerResponse::Failure { reason } => {
                assert!(reason.contains("terminated before replying"));
            }
            WorkerResponse::Success(_) => panic!("expected failure"),
        }
    }
}
