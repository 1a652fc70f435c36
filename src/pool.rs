//! Bounded pool of session tasks.
//!
//! The pool hands out at most `capacity` slots. The accept loop takes a slot
//! *before* accepting, so a full pool stalls accepting instead of queueing
//! sessions without bound. A slot is released when its session task ends,
//! whether the session finished, was cancelled, or the task was aborted.
//!
//! ## Shutdown
//!
//! 1. Stop taking submissions.
//! 2. Wait up to `grace` for running sessions to finish on their own.
//! 3. Signal cancellation (wakes every pending read) and wait `grace` again.
//! 4. Abort whatever is left and log it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::session::Session;
use crate::stats::Reporter;

/// Default number of concurrent sessions.
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Default grace period for each shutdown phase.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(60);

/// A reserved place in the pool for one session.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

/// Result of [`SessionPool::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every session finished within the first grace period.
    Drained,
    /// Sessions had to be cancelled; all of them then finished.
    Cancelled { sessions: usize },
    /// Sessions were still running after cancellation and were aborted.
    Abandoned { sessions: usize },
}

struct Tasks {
    accepting: bool,
    set: JoinSet<()>,
}

/// Counts a session as running until dropped, including on task abort.
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn enter(running: &Arc<AtomicUsize>) -> Self {
        running.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(running))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Fixed-capacity pool running one task per session.
pub struct SessionPool {
    capacity: u32,
    buffer_size: usize,
    slots: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    cancel: watch::Sender<bool>,
    tasks: Mutex<Tasks>,
    reporter: Arc<dyn Reporter>,
}

impl SessionPool {
    /// Create a pool with room for `capacity` sessions (at least one).
    ///
    /// Each session gets a read buffer of `buffer_size` bytes.
    pub fn new(capacity: u32, buffer_size: usize, reporter: Arc<dyn Reporter>) -> Self {
        let capacity = capacity.max(1);
        let (cancel, _) = watch::channel(false);

        Self {
            capacity,
            buffer_size,
            slots: Arc::new(Semaphore::new(capacity as usize)),
            running: Arc::new(AtomicUsize::new(0)),
            cancel,
            tasks: Mutex::new(Tasks {
                accepting: true,
                set: JoinSet::new(),
            }),
            reporter,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of sessions submitted and not yet finished.
    pub fn active(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Number of slots nobody holds.
    ///
    /// A slot taken by the accept loop counts as held even before a session
    /// is submitted into it.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn is_accepting(&self) -> bool {
        self.lock_tasks().accepting
    }

    /// Wait for a free slot.
    ///
    /// Fails once shutdown has begun.
    pub async fn acquire(&self) -> Result<Slot, PoolError> {
        if !self.is_accepting() {
            return Err(PoolError::Shutdown);
        }
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Shutdown)?;
        Ok(Slot { _permit: permit })
    }

    /// Run a session for `stream` in the slot previously acquired.
    ///
    /// After shutdown has begun the stream is dropped (closing it) and the
    /// slot released.
    pub fn submit<S>(&self, slot: Slot, stream: S, peer: SocketAddr) -> Result<(), PoolError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut tasks = self.lock_tasks();
        if !tasks.accepting {
            return Err(PoolError::Shutdown);
        }

        // Reap finished tasks so the set does not grow with every connection
        while let Some(res) = tasks.set.try_join_next() {
            if let Err(e) = res {
                if e.is_panic() {
                    error!(error = %e, "Session task panicked");
                }
            }
        }

        let mut session = Session::new(stream, peer, self.buffer_size, self.cancel.subscribe());
        let reporter = Arc::clone(&self.reporter);
        let running = RunningGuard::enter(&self.running);

        tasks.set.spawn(async move {
            let report = session.run().await;
            reporter.session_finished(report);
            drop(running);
            drop(slot);
        });

        debug!(peer = %peer, active = self.active(), "Session submitted");
        Ok(())
    }

    /// Two-phase shutdown; see the module docs.
    ///
    /// Never fails: sessions that outlive both grace periods are aborted and
    /// reported as [`DrainOutcome::Abandoned`].
    pub async fn shutdown(&self, grace: Duration) -> DrainOutcome {
        self.shutdown_phased(grace, grace).await
    }

    /// Like [`shutdown`](Self::shutdown), with separate limits for the
    /// voluntary drain and for the wait after cancellation.
    pub async fn shutdown_phased(&self, drain: Duration, cancel: Duration) -> DrainOutcome {
        self.lock_tasks().accepting = false;

        if self.wait_idle(drain).await {
            self.slots.close();
            debug!("Session pool drained");
            return DrainOutcome::Drained;
        }

        let sessions = self.active();
        info!(sessions, "Cancelling sessions still in flight");
        self.cancel.send_replace(true);

        let outcome = if self.wait_idle(cancel).await {
            DrainOutcome::Cancelled { sessions }
        } else {
            let sessions = self.active();
            warn!(sessions, "Session pool did not terminate; aborting remaining sessions");
            self.lock_tasks().set.abort_all();
            DrainOutcome::Abandoned { sessions }
        };

        self.slots.close();
        outcome
    }

    /// Wait until every slot is free, or `within` elapses.
    async fn wait_idle(&self, within: Duration) -> bool {
        match tokio::time::timeout(within, self.slots.acquire_many(self.capacity)).await {
            Ok(Ok(_all)) => true,
            // Closed by an earlier shutdown
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
