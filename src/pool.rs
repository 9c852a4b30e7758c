//! Bounded cooperative worker pool
//!
//! The pool is a logical-slot governor layered over the tokio runtime: at
//! most `limit` submitted jobs hold a slot at any moment. A job may release
//! its slot at a suspension point (dependency build, resource wait, fence
//! wait, parallel join) and re-acquire one when the event it waited for
//! fires, so suspended work never starves runnable work.
//!
//! Queues are FIFO within each priority class; high-priority entries are
//! always served first. Resuming a failed action goes through the
//! high-priority queue so failures surface promptly.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::trace;

/// Scheduling class for queue entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Served in submission order after all high-priority entries
    Normal,
    /// Served before normal entries; used to resume failed actions and
    /// actions holding resources
    High,
}

enum Entry {
    /// A job waiting to start; runs as its own task once granted a slot
    Start(BoxFuture<'static, ()>),
    /// A suspended job waiting to re-acquire a slot
    Resume(oneshot::Sender<()>),
}

struct PoolState {
    limit: usize,
    running: usize,
    alive: usize,
    cancelled: bool,
    high: VecDeque<Entry>,
    normal: VecDeque<Entry>,
}

impl PoolState {
    fn pop(&mut self) -> Option<Entry> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }
}

struct PoolInner {
    state: Mutex<PoolState>,
    idle: Notify,
}

/// Handle to a bounded worker pool; cheap to clone
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// A pool with `limit` concurrent slots (at least one)
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    limit: limit.max(1),
                    running: 0,
                    alive: 0,
                    cancelled: false,
                    high: VecDeque::new(),
                    normal: VecDeque::new(),
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Submit a job at normal priority
    pub fn spawn(&self, job: impl Future<Output = ()> + Send + 'static) {
        self.submit(Priority::Normal, Box::pin(job));
    }

    /// Submit a job at high priority
    pub fn spawn_priority(&self, job: impl Future<Output = ()> + Send + 'static) {
        self.submit(Priority::High, Box::pin(job));
    }

    fn submit(&self, priority: Priority, job: BoxFuture<'static, ()>) {
        {
            let mut state = self.inner.state.lock();
            state.alive += 1;
            let entry = Entry::Start(job);
            match priority {
                Priority::High => state.high.push_back(entry),
                Priority::Normal => state.normal.push_back(entry),
            }
        }
        self.dispatch();
    }

    /// Give up the caller's slot at a suspension point
    pub(crate) fn release_slot(&self) {
        {
            let mut state = self.inner.state.lock();
            debug_assert!(state.running > 0, "released a slot nobody held");
            state.running = state.running.saturating_sub(1);
        }
        self.dispatch();
    }

    /// Wait for a slot after a suspension point
    pub(crate) async fn acquire_slot(&self, priority: Priority) {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            let entry = Entry::Resume(tx);
            match priority {
                Priority::High => state.high.push_back(entry),
                Priority::Normal => state.normal.push_back(entry),
            }
        }
        self.dispatch();
        if rx.await.is_err() {
            debug_assert!(false, "slot grant disappeared");
        }
    }

    /// Temporarily raise the slot limit by one; restored when the returned
    /// guard drops
    pub(crate) fn increase(&self) -> CapacityGuard {
        self.inner.state.lock().limit += 1;
        self.dispatch();
        CapacityGuard {
            inner: self.inner.clone(),
        }
    }

    /// Mark the build as failed so not-yet-started work can bail out quickly
    pub(crate) fn cancel(&self) {
        self.inner.state.lock().cancelled = true;
        trace!("pool cancelled");
    }

    /// Whether [`Pool::cancel`] was called
    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// Resolve once every submitted job has finished
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking, or a notification between the check
            // and the await is lost.
            notified.as_mut().enable();
            if self.inner.state.lock().alive == 0 {
                return;
            }
            notified.await;
        }
    }

    fn dispatch(&self) {
        let mut state = self.inner.state.lock();
        while state.running < state.limit {
            let Some(entry) = state.pop() else { break };
            match entry {
                Entry::Start(job) => {
                    state.running += 1;
                    let inner = self.inner.clone();
                    let pool = self.clone();
                    tokio::spawn(async move {
                        // Slot bookkeeping must survive a panicking job.
                        use futures::FutureExt;
                        let _ = std::panic::AssertUnwindSafe(job).catch_unwind().await;
                        {
                            let mut state = inner.state.lock();
                            state.running = state.running.saturating_sub(1);
                            state.alive -= 1;
                            if state.alive == 0 {
                                inner.idle.notify_waiters();
                            }
                        }
                        pool.dispatch();
                    });
                }
                Entry::Resume(tx) => {
                    // A resume whose waiter vanished grants no slot.
                    if tx.send(()).is_ok() {
                        state.running += 1;
                    }
                }
            }
        }
    }
}

/// Restores the pool limit lowered by one on drop
pub(crate) struct CapacityGuard {
    inner: Arc<PoolInner>,
}

impl Drop for CapacityGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.limit = state.limit.saturating_sub(1);
    }
}
