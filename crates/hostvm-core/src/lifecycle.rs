//! Runtime lifecycle: boot, scheduling and termination.
//!
//! `create_runtime` spawns a dedicated boot thread. That thread claims the
//! `Starting` state, boots the runtime, builds the generation's queues and
//! worker pool, reports back to the caller, and then becomes the first
//! worker of the sync queue. It stays in that role until termination, waits
//! for every other worker of its generation to exit, and finally shuts the
//! runtime down:
//!
//! ```text
//! caller            boot thread                         workers
//!   │ create_runtime ──▶ try_enter_starting
//!   │                   boot
//!   │ ◀── Started(gen) ─ enter_started
//!   │                   serve sync queue ◀── schedule ──▶ spawned on demand
//!   │ begin_termination ─ poison ──────────────────────▶ relay poison, exit
//!   │                   wait for pool to drain
//!   │                   shutdown
//!   │                   enter_not_running
//! ```
//!
//! The state mutex is held across the state check and the enqueue in
//! `schedule` so that a concurrent termination cannot poison a queue in
//! between. Enqueueing never waits on another thread; retired workers are
//! joined only after every lock is released.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

use crate::completion::{self, panic_message, Completion};
use crate::error::{CreateError, InvalidState, LifecycleError, ScheduleError};
use crate::module::{ModuleLifetime, ModulePin};
use crate::queue::{Priority, QueueStats, WorkQueue};
use crate::runtime::Runtime;
use crate::state::{Generation, LifecycleState, StateMachine};
use crate::worker::{PoolStats, Worker, WorkerPool};
use crate::HostConfig;

/// Snapshot of a started runtime's work queues and workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostStats {
    pub generation: Generation,
    pub sync_queue: QueueStats,
    pub async_queue: QueueStats,
    pub pool: PoolStats,
}

/// Owner of one embedded runtime slot.
///
/// At most one runtime exists per `Lifecycle` at any time. Dropping the
/// lifecycle terminates a started runtime and waits for it to stop, so it
/// must not be dropped from one of its own worker threads.
pub struct Lifecycle<R: Runtime> {
    shared: Arc<Shared<R>>,
}

struct Shared<R: Runtime> {
    runtime: Arc<R>,
    config: HostConfig,
    lifetime: Arc<ModuleLifetime>,
    inner: Mutex<Inner<R>>,
    state_changed: Condvar,
}

struct Inner<R: Runtime> {
    machine: StateMachine<R::Handle>,
    workforce: Option<Workforce<R>>,
    boot_threads: Vec<BootThread>,
}

/// Queues and pool of the started generation.
struct Workforce<R: Runtime> {
    sync_queue: Arc<WorkQueue<R>>,
    async_queue: Arc<WorkQueue<R>>,
    pool: Arc<WorkerPool<R>>,
}

impl<R: Runtime> Workforce<R> {
    fn queue(&self, priority: Priority) -> &Arc<WorkQueue<R>> {
        match priority {
            Priority::Sync => &self.sync_queue,
            Priority::Async => &self.async_queue,
        }
    }
}

struct BootThread {
    handle: JoinHandle<()>,
    pin: ModulePin,
    /// Set, under the state mutex where applicable, once the thread has
    /// nothing left to do but return.
    finishing: Arc<AtomicBool>,
}

impl BootThread {
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("Boot thread panicked");
        }
        drop(self.pin);
    }
}

enum BootReport {
    Started(Generation),
    Rejected(LifecycleError),
    Failed(String),
}

impl<R: Runtime> Lifecycle<R> {
    /// Create a lifecycle tracking the code unit this crate was loaded from.
    pub fn new(runtime: R, config: HostConfig) -> Self {
        Self::with_module_lifetime(runtime, config, ModuleLifetime::current())
    }

    /// Create a lifecycle whose threads pin `lifetime`.
    pub fn with_module_lifetime(
        runtime: R,
        config: HostConfig,
        lifetime: Arc<ModuleLifetime>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                runtime: Arc::new(runtime),
                config,
                lifetime,
                inner: Mutex::new(Inner {
                    machine: StateMachine::new(),
                    workforce: None,
                    boot_threads: Vec::new(),
                }),
                state_changed: Condvar::new(),
            }),
        }
    }

    /// Boot a runtime on a new thread and wait for the outcome.
    pub fn create_runtime(&self, config: R::Config) -> Result<Generation, CreateError> {
        let finished = self.shared.inner.lock().take_boot_threads(BootThread::is_finished);
        for boot in finished {
            boot.join();
        }

        let (report_tx, report_rx) = crossbeam_channel::bounded(1);
        let finishing = Arc::new(AtomicBool::new(false));
        let mut builder =
            thread::Builder::new().name(format!("{}-boot", self.shared.config.thread_name_prefix));
        if let Some(stack_size) = self.shared.config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let pin = self.shared.lifetime.pin();
        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&finishing);
        let handle = builder
            .spawn(move || shared.run_boot_thread(config, report_tx, flag))
            .map_err(CreateError::Spawn)?;
        self.shared.inner.lock().boot_threads.push(BootThread {
            handle,
            pin,
            finishing,
        });

        match report_rx.recv() {
            Ok(BootReport::Started(generation)) => Ok(generation),
            Ok(BootReport::Rejected(err)) => {
                tracing::debug!("Runtime creation rejected: {}", err);
                Err(CreateError::AlreadyRunning)
            }
            Ok(BootReport::Failed(reason)) => {
                self.shared.unwind_failed_boot();
                Err(CreateError::BootFailed(reason))
            }
            Err(_) => {
                tracing::error!("Boot thread exited without reporting");
                self.shared.unwind_failed_boot();
                Err(CreateError::BootFailed(
                    "boot thread exited without reporting".to_string(),
                ))
            }
        }
    }

    /// Enqueue `job` on the `priority` queue of runtime `generation`.
    ///
    /// Never blocks on a worker. The job runs on an attached thread; a
    /// panic inside it is logged and does not take the worker down.
    pub fn schedule<F>(
        &self,
        generation: Generation,
        priority: Priority,
        job: F,
    ) -> Result<(), ScheduleError>
    where
        F: FnOnce(&mut R::Env) + Send + 'static,
    {
        let pool = {
            let inner = self.shared.inner.lock();
            inner
                .machine
                .check_started(generation)
                .map_err(ScheduleError::NotValidState)?;
            let workforce = inner
                .workforce
                .as_ref()
                .ok_or(ScheduleError::NotValidState(InvalidState::NotRunning))?;
            workforce.queue(priority).add(Box::new(job))?;
            Arc::clone(&workforce.pool)
        };
        pool.reap_finished();
        Ok(())
    }

    /// Like `schedule`, returning a handle to the job's value.
    pub fn schedule_with_result<F, T>(
        &self,
        generation: Generation,
        priority: Priority,
        job: F,
    ) -> Result<Completion<T>, ScheduleError>
    where
        F: FnOnce(&mut R::Env) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (completer, completion) = completion::pair();
        self.schedule(generation, priority, move |env| {
            completer.complete_with(|| job(env))
        })?;
        Ok(completion)
    }

    /// Start shutting down runtime `generation`. Does not wait for workers.
    pub fn begin_termination(&self, generation: Generation) -> Result<(), LifecycleError> {
        let mut inner = self.shared.inner.lock();
        inner.machine.try_enter_terminating(generation)?;
        if let Some(workforce) = inner.workforce.take() {
            workforce.sync_queue.poison();
            workforce.async_queue.poison();
            workforce.pool.begin_drain();
        }
        self.shared.state_changed.notify_all();
        tracing::info!("Terminating runtime {}", generation);
        Ok(())
    }

    /// Block until no runtime is starting, running or stopping, and join
    /// the boot thread that shut it down. `None` waits indefinitely.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub fn wait_until_stopped(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let finished = {
            let mut inner = self.shared.inner.lock();
            while inner.machine.state() != LifecycleState::NotRunning {
                match deadline {
                    None => self.shared.state_changed.wait(&mut inner),
                    Some(deadline) => {
                        let timed_out = self
                            .shared
                            .state_changed
                            .wait_until(&mut inner, deadline)
                            .timed_out();
                        if timed_out && inner.machine.state() != LifecycleState::NotRunning {
                            return false;
                        }
                    }
                }
            }
            inner.take_boot_threads(|boot| boot.finishing.load(Ordering::Acquire))
        };
        for boot in finished {
            boot.join();
        }
        true
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.shared.inner.lock().machine.state()
    }

    /// Current generation. Only meaningful while `Started`.
    pub fn generation(&self) -> Generation {
        self.shared.inner.lock().machine.generation()
    }

    /// Queue and worker counters, while a runtime is started.
    pub fn stats(&self) -> Option<HostStats> {
        let inner = self.shared.inner.lock();
        let workforce = inner.workforce.as_ref()?;
        Some(HostStats {
            generation: inner.machine.generation(),
            sync_queue: workforce.sync_queue.stats(),
            async_queue: workforce.async_queue.stats(),
            pool: workforce.pool.stats(),
        })
    }

    /// Configuration applied to spawned threads.
    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }
}

impl<R: Runtime> Drop for Lifecycle<R> {
    fn drop(&mut self) {
        let running = {
            let inner = self.shared.inner.lock();
            (inner.machine.state() == LifecycleState::Started)
                .then(|| inner.machine.generation())
        };
        if let Some(generation) = running {
            if let Err(err) = self.begin_termination(generation) {
                tracing::warn!("Failed to terminate runtime on drop: {}", err);
            }
        }
        self.wait_until_stopped(None);
    }
}

impl<R: Runtime> Inner<R> {
    fn take_boot_threads(&mut self, mut select: impl FnMut(&BootThread) -> bool) -> Vec<BootThread> {
        let (taken, kept): (Vec<_>, Vec<_>) =
            self.boot_threads.drain(..).partition(|boot| select(boot));
        self.boot_threads = kept;
        taken
    }
}

impl<R: Runtime> Shared<R> {
    fn run_boot_thread(
        self: Arc<Self>,
        config: R::Config,
        report: Sender<BootReport>,
        finishing: Arc<AtomicBool>,
    ) {
        if let Err(err) = self.inner.lock().machine.try_enter_starting() {
            finishing.store(true, Ordering::Release);
            let _ = report.send(BootReport::Rejected(err));
            return;
        }

        let handle = match panic::catch_unwind(AssertUnwindSafe(|| self.runtime.boot(config))) {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                tracing::warn!("Runtime boot failed: {}", err);
                finishing.store(true, Ordering::Release);
                let _ = report.send(BootReport::Failed(err.to_string()));
                return;
            }
            Err(panic) => {
                let reason = format!("boot panicked: {}", panic_message(panic.as_ref()));
                tracing::error!("Runtime {}", reason);
                finishing.store(true, Ordering::Release);
                let _ = report.send(BootReport::Failed(reason));
                return;
            }
        };

        let pool = WorkerPool::new(
            Arc::clone(&self.runtime),
            handle.clone(),
            self.config.clone(),
            Arc::clone(&self.lifetime),
        );
        let sync_queue = WorkQueue::new(Priority::Sync, Arc::clone(&pool));
        let async_queue = WorkQueue::new(Priority::Async, Arc::clone(&pool));

        let started = {
            let mut inner = self.inner.lock();
            let started = inner.machine.enter_started(handle.clone());
            if started.is_ok() {
                inner.workforce = Some(Workforce {
                    sync_queue: Arc::clone(&sync_queue),
                    async_queue,
                    pool: Arc::clone(&pool),
                });
                self.state_changed.notify_all();
            }
            started
        };
        let generation = match started {
            Ok(generation) => generation,
            Err(err) => {
                tracing::error!("Booted runtime could not be published: {}", err);
                self.runtime.shutdown(handle);
                finishing.store(true, Ordering::Release);
                let _ = report.send(BootReport::Failed(err.to_string()));
                return;
            }
        };
        tracing::info!("Runtime started as {}", generation);
        let _ = report.send(BootReport::Started(generation));
        drop(report);

        Worker::first(Arc::clone(&pool), sync_queue).run();
        pool.wait_drained();
        let shutdown = panic::catch_unwind(AssertUnwindSafe(|| self.runtime.shutdown(handle)));
        if let Err(panic) = shutdown {
            tracing::error!(
                "Runtime {} shutdown panicked: {}",
                generation,
                panic_message(panic.as_ref())
            );
        }

        let mut inner = self.inner.lock();
        if let Err(err) = inner.machine.enter_not_running() {
            tracing::error!("Runtime {} stopped in unexpected state: {}", generation, err);
        }
        finishing.store(true, Ordering::Release);
        self.state_changed.notify_all();
        tracing::info!("Runtime {} shut down", generation);
    }

    /// Return a `Starting` machine to `NotRunning` after a failed boot.
    fn unwind_failed_boot(&self) {
        let mut inner = self.inner.lock();
        if inner.machine.state() != LifecycleState::Starting {
            return;
        }
        if let Err(err) = inner.machine.enter_not_running() {
            tracing::error!("Failed to unwind boot: {}", err);
        }
        self.state_changed.notify_all();
    }
}
