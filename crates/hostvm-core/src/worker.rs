//! Runtime-attached worker threads.
//!
//! A `Worker` attaches its thread to the runtime, serves one `WorkQueue`
//! until it is poisoned, then detaches. Attach and detach always happen on
//! the same thread, and a worker that failed to attach never runs a job.
//!
//! `WorkerPool` owns the threads of one generation. Every thread it spawns
//! holds a `ModulePin` that is released only after the thread is joined.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::completion::panic_message;
use crate::module::{ModuleLifetime, ModulePin};
use crate::queue::{Job, WaitOutcome, WorkQueue};
use crate::runtime::Runtime;
use crate::HostConfig;

/// Why a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// The queue was poisoned.
    Poisoned,
    /// No work arrived within the idle timeout.
    Retired,
    /// The thread could not attach to the runtime.
    AttachFailed,
}

/// A thread serving a single queue.
pub(crate) struct Worker<R: Runtime> {
    pool: Arc<WorkerPool<R>>,
    queue: Arc<WorkQueue<R>>,
    idle_timeout: Option<Duration>,
}

impl<R: Runtime> Worker<R> {
    /// The worker living on the boot thread. It never retires.
    pub(crate) fn first(pool: Arc<WorkerPool<R>>, queue: Arc<WorkQueue<R>>) -> Self {
        Self {
            pool,
            queue,
            idle_timeout: None,
        }
    }

    fn on_demand(pool: Arc<WorkerPool<R>>, queue: Arc<WorkQueue<R>>) -> Self {
        let idle_timeout = pool.config.idle_timeout;
        Self {
            pool,
            queue,
            idle_timeout,
        }
    }

    /// Attach, serve the queue, detach.
    pub(crate) fn run(self) -> WorkerExit {
        let runtime = &self.pool.runtime;
        let handle = &self.pool.handle;
        let priority = self.queue.priority();

        let attached =
            panic::catch_unwind(AssertUnwindSafe(|| runtime.attach_current_thread(handle)));
        let mut env = match attached {
            Ok(Ok(env)) => env,
            Ok(Err(err)) => {
                tracing::warn!("{} worker failed to attach to runtime: {}", priority, err);
                self.pool.census.lock().attach_failures += 1;
                return WorkerExit::AttachFailed;
            }
            Err(panic) => {
                tracing::error!(
                    "{} worker attach panicked: {}",
                    priority,
                    panic_message(panic.as_ref())
                );
                self.pool.census.lock().attach_failures += 1;
                return WorkerExit::AttachFailed;
            }
        };
        tracing::debug!("{} worker attached", priority);

        let exit = loop {
            match self.queue.wait_for_request(self.idle_timeout) {
                WaitOutcome::Job(job) => self.execute(job, &mut env),
                WaitOutcome::Empty => continue,
                WaitOutcome::TimedOut => break WorkerExit::Retired,
                WaitOutcome::Stop => break WorkerExit::Poisoned,
            }
        };

        let detached =
            panic::catch_unwind(AssertUnwindSafe(|| runtime.detach_current_thread(handle, env)));
        if let Err(panic) = detached {
            tracing::error!(
                "{} worker detach panicked: {}",
                priority,
                panic_message(panic.as_ref())
            );
        }
        tracing::debug!("{} worker detached ({:?})", priority, exit);
        exit
    }

    fn execute(&self, job: Job<R>, env: &mut R::Env) {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| job(env))) {
            tracing::error!(
                "Job panicked on {} worker: {}",
                self.queue.priority(),
                panic_message(panic.as_ref())
            );
        }
    }
}

/// Snapshot of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Spawned worker threads that have not exited yet.
    pub live_workers: usize,
    /// Worker threads spawned over the pool's lifetime.
    pub spawned_workers: usize,
    /// Workers that exited because they could not attach.
    pub attach_failures: usize,
}

struct PinnedThread {
    handle: JoinHandle<()>,
    pin: ModulePin,
}

impl PinnedThread {
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Join, then release the pin.
    fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("Worker thread panicked outside of a job");
        }
        drop(self.pin);
    }
}

/// Reports a worker's exit to its pool, even when the thread unwinds.
struct ExitGuard<R: Runtime> {
    pool: Arc<WorkerPool<R>>,
}

impl<R: Runtime> Drop for ExitGuard<R> {
    fn drop(&mut self) {
        self.pool.worker_exited();
    }
}

#[derive(Default)]
struct Census {
    live: usize,
    spawned: usize,
    attach_failures: usize,
    next_id: usize,
    draining: bool,
    threads: Vec<PinnedThread>,
}

impl Census {
    fn take_finished(&mut self) -> Vec<PinnedThread> {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.threads.drain(..).partition(PinnedThread::is_finished);
        self.threads = running;
        finished
    }
}

/// Worker threads of one generation, shared by its two queues.
pub struct WorkerPool<R: Runtime> {
    runtime: Arc<R>,
    handle: R::Handle,
    config: HostConfig,
    lifetime: Arc<ModuleLifetime>,
    census: Mutex<Census>,
    drained: Condvar,
}

impl<R: Runtime> WorkerPool<R> {
    /// Create an empty pool for a booted runtime.
    pub fn new(
        runtime: Arc<R>,
        handle: R::Handle,
        config: HostConfig,
        lifetime: Arc<ModuleLifetime>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            handle,
            config,
            lifetime,
            census: Mutex::new(Census::default()),
            drained: Condvar::new(),
        })
    }

    /// Spawn a worker serving `queue`.
    pub(crate) fn spawn(self: &Arc<Self>, queue: Arc<WorkQueue<R>>) -> io::Result<()> {
        let mut census = self.census.lock();
        census.next_id += 1;

        let name = format!(
            "{}-{}-{}",
            self.config.thread_name_prefix,
            queue.priority(),
            census.next_id
        );
        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let worker = Worker::on_demand(Arc::clone(self), queue);
        let pool = Arc::clone(self);
        let pin = self.lifetime.pin();
        census.live += 1;

        // The guard is armed inside the thread: a closure dropped by a failed
        // spawn must not report an exit.
        match builder.spawn(move || {
            let _exit = ExitGuard { pool };
            worker.run();
        }) {
            Ok(handle) => {
                census.spawned += 1;
                census.threads.push(PinnedThread { handle, pin });
                tracing::debug!("Spawned worker {}", name);
                Ok(())
            }
            Err(err) => {
                census.live -= 1;
                Err(err)
            }
        }
    }

    /// Join retired threads and release their pins.
    ///
    /// Must be called without holding a queue or lifecycle lock.
    pub(crate) fn reap_finished(&self) {
        let finished = self.census.lock().take_finished();
        for thread in finished {
            thread.join();
        }
    }

    fn worker_exited(&self) {
        let mut census = self.census.lock();
        census.live -= 1;
        if census.live == 0 {
            self.drained.notify_all();
        }
    }

    /// Mark the pool as shutting down. Call after poisoning its queues.
    pub(crate) fn begin_drain(&self) {
        self.census.lock().draining = true;
        self.drained.notify_all();
    }

    /// Block until the drain has begun and every worker has exited, then
    /// join their threads and release their pins.
    pub(crate) fn wait_drained(&self) {
        let threads = {
            let mut census = self.census.lock();
            while !(census.draining && census.live == 0) {
                self.drained.wait(&mut census);
            }
            std::mem::take(&mut census.threads)
        };
        let count = threads.len();
        for thread in threads {
            thread.join();
        }
        tracing::debug!("Joined {} worker threads", count);
    }

    /// Snapshot the pool counters.
    pub fn stats(&self) -> PoolStats {
        let census = self.census.lock();
        PoolStats {
            live_workers: census.live,
            spawned_workers: census.spawned,
            attach_failures: census.attach_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Priority;
    use crate::test_support::{eventually, job, FakeRuntime};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_worker_threads_are_named_and_pinned() {
        let runtime = Arc::new(FakeRuntime::default());
        let lifetime = ModuleLifetime::untracked();
        let config = HostConfig::default().with_thread_name_prefix("unit");
        let pool = WorkerPool::new(runtime, 1, config, Arc::clone(&lifetime));
        let queue = WorkQueue::new(Priority::Async, Arc::clone(&pool));

        let (tx, rx) = crossbeam_channel::bounded(1);
        queue
            .add(job(move |_| {
                tx.send(thread::current().name().map(str::to_string)).unwrap();
            }))
            .unwrap();

        assert_eq!(rx.recv().unwrap(), Some("unit-async-1".to_string()));
        assert_eq!(lifetime.pin_count(), 1);

        queue.poison();
        pool.begin_drain();
        pool.wait_drained();
        assert_eq!(lifetime.pin_count(), 0);
    }

    #[test]
    fn test_first_worker_serves_until_poisoned() {
        let runtime = Arc::new(FakeRuntime::default());
        let pool = WorkerPool::new(
            Arc::clone(&runtime),
            3,
            HostConfig::default(),
            ModuleLifetime::untracked(),
        );
        let queue = WorkQueue::new(Priority::Sync, Arc::clone(&pool));
        let first = Worker::first(Arc::clone(&pool), Arc::clone(&queue));
        let boot = thread::spawn(move || first.run());

        assert!(eventually(|| queue.stats().idle_workers == 1));
        let (tx, rx) = crossbeam_channel::bounded(1);
        queue.add(job(move |env| tx.send(env.vm).unwrap())).unwrap();
        assert_eq!(rx.recv().unwrap(), 3);
        assert_eq!(pool.stats().spawned_workers, 0);

        queue.poison();
        assert_eq!(boot.join().unwrap(), WorkerExit::Poisoned);
        assert_eq!(runtime.detaches(), 1);
    }

    #[test]
    fn test_job_panic_does_not_kill_worker() {
        let runtime = Arc::new(FakeRuntime::default());
        let pool = WorkerPool::new(
            runtime,
            1,
            HostConfig::default(),
            ModuleLifetime::untracked(),
        );
        let queue = WorkQueue::new(Priority::Async, Arc::clone(&pool));
        let (tx, rx) = crossbeam_channel::unbounded();

        queue.add(job(|_| panic!("job failure"))).unwrap();
        queue.add(job(move |_| tx.send(()).unwrap())).unwrap();
        rx.recv().unwrap();

        queue.poison();
        pool.begin_drain();
        pool.wait_drained();
        assert_eq!(pool.stats().live_workers, 0);
    }

    #[test]
    fn test_attach_failure_exits_without_detach() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.fail_next_attaches(1);
        let pool = WorkerPool::new(
            Arc::clone(&runtime),
            1,
            HostConfig::default(),
            ModuleLifetime::untracked(),
        );
        let queue = WorkQueue::new(Priority::Sync, Arc::clone(&pool));

        let exit = Worker::first(Arc::clone(&pool), queue).run();
        assert_eq!(exit, WorkerExit::AttachFailed);
        assert_eq!(pool.stats().attach_failures, 1);
        assert_eq!(runtime.detaches(), 0);
    }

    #[test]
    fn test_panicking_attach_counts_as_attach_failure() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.panic_next_attaches(1);
        let pool = WorkerPool::new(
            Arc::clone(&runtime),
            1,
            HostConfig::default(),
            ModuleLifetime::untracked(),
        );
        let queue = WorkQueue::new(Priority::Sync, Arc::clone(&pool));

        let exit = Worker::first(Arc::clone(&pool), queue).run();
        assert_eq!(exit, WorkerExit::AttachFailed);
        assert_eq!(pool.stats().attach_failures, 1);
        assert_eq!(runtime.detaches(), 0);
    }

    #[test]
    fn test_pool_drains_after_attach_panic() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.panic_next_attaches(1);
        let pool = WorkerPool::new(
            Arc::clone(&runtime),
            1,
            HostConfig::default(),
            ModuleLifetime::untracked(),
        );
        let queue = WorkQueue::new(Priority::Async, Arc::clone(&pool));

        queue.add(job(|_| {})).unwrap();
        assert!(eventually(|| pool.stats().attach_failures == 1));
        assert!(eventually(|| pool.stats().live_workers == 0));

        queue.poison();
        pool.begin_drain();
        pool.wait_drained();
        assert_eq!(runtime.attaches(), 0);
    }

    #[test]
    fn test_pool_drains_after_detach_panic() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.panic_on_detach(true);
        let lifetime = ModuleLifetime::untracked();
        let pool = WorkerPool::new(
            Arc::clone(&runtime),
            1,
            HostConfig::default(),
            Arc::clone(&lifetime),
        );
        let queue = WorkQueue::new(Priority::Async, Arc::clone(&pool));
        let (tx, rx) = crossbeam_channel::bounded(1);

        queue.add(job(move |_| tx.send(()).unwrap())).unwrap();
        rx.recv().unwrap();

        queue.poison();
        pool.begin_drain();
        pool.wait_drained();
        assert_eq!(runtime.detaches(), 1);
        assert_eq!(pool.stats().live_workers, 0);
        assert_eq!(lifetime.pin_count(), 0);
    }

    #[test]
    fn test_finished_threads_are_reaped() {
        let runtime = Arc::new(FakeRuntime::default());
        let lifetime = ModuleLifetime::untracked();
        let config = HostConfig::default().with_idle_timeout(Duration::from_millis(10));
        let pool = WorkerPool::new(runtime, 1, config, Arc::clone(&lifetime));
        let queue = WorkQueue::new(Priority::Async, Arc::clone(&pool));

        queue.add(job(|_| {})).unwrap();
        assert!(eventually(|| pool.stats().live_workers == 0));
        // The retired thread still holds its pin until it is joined.
        assert!(eventually(|| {
            pool.census.lock().threads.iter().all(PinnedThread::is_finished)
        }));
        assert_eq!(lifetime.pin_count(), 1);

        pool.reap_finished();
        assert_eq!(lifetime.pin_count(), 0);
        assert!(pool.census.lock().threads.is_empty());

        queue.add(job(|_| {})).unwrap();
        assert_eq!(lifetime.pin_count(), 1);

        queue.poison();
        pool.begin_drain();
        pool.wait_drained();
        assert_eq!(lifetime.pin_count(), 0);
    }
}
