//! Work queues feeding runtime-attached workers.
//!
//! Each generation owns two structurally identical queues, one per
//! `Priority` class. A queue is a FIFO of work items plus a count of
//! workers blocked waiting for work and a count of wakeup permits:
//!
//! - `add` hands a permit to one idle worker, or spawns a fresh worker when
//!   none is idle. Worker count grows with contention and has no ceiling.
//! - `wait_for_request` pops directly when work is queued; otherwise the
//!   worker registers as idle and sleeps until it is handed a permit.
//! - `poison` appends a stop sentinel. A worker that dequeues it pushes it
//!   back and passes a permit to the next idle worker before stopping, so a
//!   single poison item retires every worker of the queue.
//!
//! Permits are only ever issued to a worker counted idle, and issuing one
//! removes that worker from the idle count, both under the queue mutex. The
//! two counters therefore cannot drift apart.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::EnqueueError;
use crate::runtime::Runtime;
use crate::worker::WorkerPool;

/// A unit of work, run on an attached thread with that thread's environment.
pub type Job<R> = Box<dyn FnOnce(&mut <R as Runtime>::Env) + Send + 'static>;

/// Priority class of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Work a caller is about to block on.
    Sync,
    /// Background work nobody is waiting for.
    Async,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Sync => f.write_str("sync"),
            Priority::Async => f.write_str("async"),
        }
    }
}

/// Queued entry.
enum WorkItem<R: Runtime> {
    Job(Job<R>),
    Poison,
}

/// What a waiting worker got.
pub enum WaitOutcome<R: Runtime> {
    /// Run this job.
    Job(Job<R>),
    /// Woken, but another worker took the item first.
    Empty,
    /// No permit arrived before the timeout.
    TimedOut,
    /// Poison observed and relayed; the worker must exit.
    Stop,
}

impl<R: Runtime> fmt::Debug for WaitOutcome<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitOutcome::Job(_) => f.write_str("Job"),
            WaitOutcome::Empty => f.write_str("Empty"),
            WaitOutcome::TimedOut => f.write_str("TimedOut"),
            WaitOutcome::Stop => f.write_str("Stop"),
        }
    }
}

/// Snapshot of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Items waiting, including a relayed poison item.
    pub queued: usize,
    /// Workers blocked waiting and not yet handed a permit.
    pub idle_workers: usize,
    /// Whether the queue has been poisoned.
    pub poisoned: bool,
}

struct QueueState<R: Runtime> {
    items: VecDeque<WorkItem<R>>,
    idle_workers: usize,
    permits: usize,
    poisoned: bool,
}

/// FIFO of work for one priority class.
pub struct WorkQueue<R: Runtime> {
    priority: Priority,
    state: Mutex<QueueState<R>>,
    wakeup: Condvar,
    pool: Arc<WorkerPool<R>>,
}

impl<R: Runtime> WorkQueue<R> {
    /// Create an empty queue whose workers come from `pool`.
    pub fn new(priority: Priority, pool: Arc<WorkerPool<R>>) -> Arc<Self> {
        Arc::new(Self {
            priority,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                idle_workers: 0,
                permits: 0,
                poisoned: false,
            }),
            wakeup: Condvar::new(),
            pool,
        })
    }

    /// Priority class served by this queue.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Enqueue a job, waking an idle worker or spawning a new one.
    ///
    /// On error the queue is left exactly as it was.
    pub fn add(self: &Arc<Self>, job: Job<R>) -> Result<(), EnqueueError> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(EnqueueError::Closed);
        }
        state
            .items
            .try_reserve(1)
            .map_err(|_| EnqueueError::OutOfMemory)?;
        state.items.push_back(WorkItem::Job(job));

        if self.wake_idle(&mut state) {
            tracing::trace!("Handed {} job to idle worker", self.priority);
            return Ok(());
        }

        // The new worker finds its item through the non-empty fast path.
        if let Err(err) = self.pool.spawn(Arc::clone(self)) {
            state.items.pop_back();
            tracing::warn!("Failed to spawn {} worker: {}", self.priority, err);
            return Err(EnqueueError::Spawn(err));
        }
        Ok(())
    }

    /// Append the stop sentinel and wake one idle worker. Idempotent.
    pub fn poison(&self) {
        let mut state = self.state.lock();
        if state.poisoned {
            return;
        }
        state.poisoned = true;
        state.items.push_back(WorkItem::Poison);
        self.wake_idle(&mut state);
        tracing::debug!("Poisoned {} queue", self.priority);
    }

    /// Block until work is available. Called only from worker threads.
    ///
    /// `None` waits indefinitely.
    pub fn wait_for_request(&self, timeout: Option<Duration>) -> WaitOutcome<R> {
        let mut state = self.state.lock();
        if let Some(item) = state.items.pop_front() {
            return self.deliver(&mut state, item);
        }

        state.idle_workers += 1;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        while state.permits == 0 {
            match deadline {
                None => self.wakeup.wait(&mut state),
                Some(deadline) => {
                    let timed_out = self.wakeup.wait_until(&mut state, deadline).timed_out();
                    if timed_out && state.permits == 0 {
                        state.idle_workers -= 1;
                        return WaitOutcome::TimedOut;
                    }
                }
            }
        }
        state.permits -= 1;

        match state.items.pop_front() {
            Some(item) => self.deliver(&mut state, item),
            None => WaitOutcome::Empty,
        }
    }

    /// Snapshot the queue counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            queued: state.items.len(),
            idle_workers: state.idle_workers,
            poisoned: state.poisoned,
        }
    }

    fn deliver(&self, state: &mut QueueState<R>, item: WorkItem<R>) -> WaitOutcome<R> {
        match item {
            WorkItem::Job(job) => WaitOutcome::Job(job),
            WorkItem::Poison => {
                state.items.push_back(WorkItem::Poison);
                if self.wake_idle(state) {
                    tracing::trace!("Relayed poison to next idle {} worker", self.priority);
                }
                WaitOutcome::Stop
            }
        }
    }

    /// Issue one permit to an idle worker, if there is one.
    fn wake_idle(&self, state: &mut QueueState<R>) -> bool {
        if state.idle_workers == 0 {
            return false;
        }
        state.idle_workers -= 1;
        state.permits += 1;
        self.wakeup.notify_one();
        true
    }
}

impl<R: Runtime> fmt::Debug for WorkQueue<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("priority", &self.priority)
            .field("stats", &self.stats())
            .finish()
    }
}
