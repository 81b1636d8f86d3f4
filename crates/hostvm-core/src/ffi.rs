//! C interface for embedding applications.
//!
//! The embedder describes its runtime with a `HostvmRuntimeVTable` and
//! drives the lifecycle through the `hostvm_*` functions. Every function
//! returns a `HostvmStatus`; no panic crosses this boundary.
//!
//! # Memory Safety
//!
//! All functions in this module are `unsafe` and take raw pointers.
//! The caller is responsible for ensuring:
//! - `HostvmLifecycle` pointers come from `hostvm_lifecycle_new` and are
//!   freed exactly once with `hostvm_lifecycle_free`
//! - vtable callbacks are callable from any thread
//! - `user_data` passed to `hostvm_schedule` stays valid until its callback
//!   ran or the runtime has stopped

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::time::Duration;

use crate::completion::panic_message;
use crate::error::{CreateError, InvalidState, LifecycleError, ScheduleError};
use crate::lifecycle::Lifecycle;
use crate::queue::Priority;
use crate::runtime::Runtime;
use crate::state::{Generation, LifecycleState};
use crate::HostConfig;

/// Boot the runtime. Store its handle in `out_vm` and return 0 on success.
pub type HostvmBootFn =
    unsafe extern "C" fn(context: *mut c_void, config: *mut c_void, out_vm: *mut *mut c_void) -> i32;

/// Attach the calling thread. Store its environment in `out_env` and return 0 on success.
pub type HostvmAttachFn =
    unsafe extern "C" fn(context: *mut c_void, vm: *mut c_void, out_env: *mut *mut c_void) -> i32;

/// Detach the calling thread.
pub type HostvmDetachFn = unsafe extern "C" fn(context: *mut c_void, vm: *mut c_void);

/// Shut the runtime down.
pub type HostvmShutdownFn = unsafe extern "C" fn(context: *mut c_void, vm: *mut c_void);

/// Scheduled work. A non-zero return is logged and otherwise ignored.
pub type HostvmJobFn = unsafe extern "C" fn(user_data: *mut c_void, env: *mut c_void) -> i32;

/// Runtime callbacks supplied by the embedder.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostvmRuntimeVTable {
    /// Passed as the first argument of every callback.
    pub context: *mut c_void,
    pub boot: HostvmBootFn,
    pub attach_current_thread: HostvmAttachFn,
    pub detach_current_thread: HostvmDetachFn,
    pub shutdown: HostvmShutdownFn,
}

/// Result codes returned across the C boundary.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostvmStatus {
    Ok = 0,
    NullArgument = -1,
    AlreadyRunning = -2,
    BootFailed = -3,
    StaleGeneration = -4,
    NotRunning = -5,
    OutOfMemory = -6,
    SpawnFailed = -7,
    InvalidPriority = -8,
    TimedOut = -9,
    Panicked = -10,
}

impl From<&CreateError> for HostvmStatus {
    fn from(err: &CreateError) -> Self {
        match err {
            CreateError::AlreadyRunning => HostvmStatus::AlreadyRunning,
            CreateError::BootFailed(_) => HostvmStatus::BootFailed,
            CreateError::Spawn(_) => HostvmStatus::SpawnFailed,
        }
    }
}

impl From<InvalidState> for HostvmStatus {
    fn from(state: InvalidState) -> Self {
        match state {
            InvalidState::StaleGeneration => HostvmStatus::StaleGeneration,
            InvalidState::NotRunning => HostvmStatus::NotRunning,
        }
    }
}

impl From<&ScheduleError> for HostvmStatus {
    fn from(err: &ScheduleError) -> Self {
        match err {
            ScheduleError::NotValidState(state) => (*state).into(),
            ScheduleError::OutOfMemory => HostvmStatus::OutOfMemory,
            ScheduleError::Spawn(_) => HostvmStatus::SpawnFailed,
        }
    }
}

impl From<&LifecycleError> for HostvmStatus {
    fn from(err: &LifecycleError) -> Self {
        match err {
            LifecycleError::AlreadyRunning => HostvmStatus::AlreadyRunning,
            LifecycleError::StaleGeneration => HostvmStatus::StaleGeneration,
            LifecycleError::NotRunning | LifecycleError::InvalidTransition { .. } => {
                HostvmStatus::NotRunning
            }
        }
    }
}

/// Failure status reported by a vtable callback.
#[derive(Debug, thiserror::Error)]
#[error("{operation} returned status {status}")]
pub struct ForeignError {
    operation: &'static str,
    status: i32,
}

/// Booted runtime handle owned by the embedder.
#[derive(Debug, Clone, Copy)]
pub struct ForeignVm(*mut c_void);

/// Per-thread environment owned by the embedder.
#[derive(Debug)]
pub struct ForeignEnv(*mut c_void);

/// Boot configuration owned by the embedder.
#[derive(Debug)]
pub struct ForeignConfig(*mut c_void);

// SAFETY: these are opaque tokens the embedder declares usable from any
// thread; this crate never dereferences them.
unsafe impl Send for ForeignVm {}
unsafe impl Sync for ForeignVm {}
unsafe impl Send for ForeignConfig {}

/// `Runtime` implemented by a C vtable.
#[derive(Debug)]
pub struct ForeignRuntime {
    vtable: HostvmRuntimeVTable,
}

// SAFETY: the embedder guarantees the vtable callbacks and their context
// may be used from any thread.
unsafe impl Send for ForeignRuntime {}
unsafe impl Sync for ForeignRuntime {}

impl Runtime for ForeignRuntime {
    type Config = ForeignConfig;
    type Handle = ForeignVm;
    type Env = ForeignEnv;
    type Error = ForeignError;

    fn boot(&self, config: ForeignConfig) -> Result<ForeignVm, ForeignError> {
        let mut vm = ptr::null_mut();
        let status = unsafe { (self.vtable.boot)(self.vtable.context, config.0, &mut vm) };
        if status != 0 || vm.is_null() {
            return Err(ForeignError {
                operation: "boot",
                status,
            });
        }
        Ok(ForeignVm(vm))
    }

    fn attach_current_thread(&self, vm: &ForeignVm) -> Result<ForeignEnv, ForeignError> {
        let mut env = ptr::null_mut();
        let status =
            unsafe { (self.vtable.attach_current_thread)(self.vtable.context, vm.0, &mut env) };
        if status != 0 {
            return Err(ForeignError {
                operation: "attach_current_thread",
                status,
            });
        }
        Ok(ForeignEnv(env))
    }

    fn detach_current_thread(&self, vm: &ForeignVm, _env: ForeignEnv) {
        unsafe { (self.vtable.detach_current_thread)(self.vtable.context, vm.0) }
    }

    fn shutdown(&self, vm: ForeignVm) {
        unsafe { (self.vtable.shutdown)(self.vtable.context, vm.0) }
    }
}

/// Opaque lifecycle handle.
pub struct HostvmLifecycle {
    lifecycle: Lifecycle<ForeignRuntime>,
}

/// A scheduled callback and its user data, until a worker runs it.
struct PendingCallback {
    callback: HostvmJobFn,
    user_data: *mut c_void,
    ran: bool,
}

// SAFETY: the caller of `hostvm_schedule` hands the pointer over to the
// worker thread that runs the callback.
unsafe impl Send for PendingCallback {}

impl PendingCallback {
    fn run(mut self, env: *mut c_void) -> i32 {
        self.ran = true;
        unsafe { (self.callback)(self.user_data, env) }
    }
}

impl Drop for PendingCallback {
    fn drop(&mut self) {
        if !self.ran {
            tracing::warn!(
                "Scheduled callback discarded without running; user data {:p} not handed back",
                self.user_data
            );
        }
    }
}

fn catch_panic<T>(operation: &str, fallback: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(panic) => {
            tracing::error!("{} panicked: {}", operation, panic_message(panic.as_ref()));
            fallback
        }
    }
}

/// Create a lifecycle for the runtime described by `vtable`.
///
/// Thread settings are read from the `HOSTVM_*` environment variables.
///
/// # Returns
/// A new lifecycle, or null if `vtable` is null
///
/// # Safety
/// `vtable` must point to a valid `HostvmRuntimeVTable`.
#[no_mangle]
pub unsafe extern "C" fn hostvm_lifecycle_new(
    vtable: *const HostvmRuntimeVTable,
) -> *mut HostvmLifecycle {
    if vtable.is_null() {
        return ptr::null_mut();
    }
    let vtable = *vtable;
    catch_panic("hostvm_lifecycle_new", ptr::null_mut(), || {
        let config = HostConfig::from_env().unwrap_or_else(|err| {
            tracing::warn!("Ignoring host configuration: {}", err);
            HostConfig::default()
        });
        let lifecycle = Lifecycle::new(ForeignRuntime { vtable }, config);
        Box::into_raw(Box::new(HostvmLifecycle { lifecycle }))
    })
}

/// Terminate any running runtime, wait for it to stop, and free `lifecycle`.
///
/// # Safety
/// `lifecycle` must come from `hostvm_lifecycle_new` and not be used afterwards.
/// Must not be called from a worker thread.
#[no_mangle]
pub unsafe extern "C" fn hostvm_lifecycle_free(lifecycle: *mut HostvmLifecycle) {
    if lifecycle.is_null() {
        return;
    }
    let lifecycle = Box::from_raw(lifecycle);
    catch_panic("hostvm_lifecycle_free", (), move || drop(lifecycle));
}

/// Boot a runtime and block until it started or failed.
///
/// # Arguments
/// * `config` - Passed untouched to the vtable's `boot`
/// * `out_generation` - Receives the generation on success
///
/// # Safety
/// `lifecycle` must be valid; `out_generation` must be writable.
#[no_mangle]
pub unsafe extern "C" fn hostvm_create_runtime(
    lifecycle: *const HostvmLifecycle,
    config: *mut c_void,
    out_generation: *mut u64,
) -> HostvmStatus {
    let Some(lifecycle) = lifecycle.as_ref() else {
        return HostvmStatus::NullArgument;
    };
    if out_generation.is_null() {
        return HostvmStatus::NullArgument;
    }
    catch_panic("hostvm_create_runtime", HostvmStatus::Panicked, || {
        match lifecycle.lifecycle.create_runtime(ForeignConfig(config)) {
            Ok(generation) => {
                *out_generation = generation.as_u64();
                HostvmStatus::Ok
            }
            Err(err) => (&err).into(),
        }
    })
}

/// Queue `callback(user_data, env)` to run on an attached thread.
///
/// # Arguments
/// * `priority` - 0 for the sync queue, 1 for the async queue
///
/// # Safety
/// `lifecycle` must be valid; `callback` must be callable from any thread.
///
/// A callback is not guaranteed to run once `HostvmStatus::Ok` is returned:
/// if every worker of its queue fails to attach before the runtime is
/// terminated, the job is discarded and `user_data` is never passed back.
/// Embedders that own memory through `user_data` must be able to reclaim it
/// after `hostvm_wait_stopped`.
#[no_mangle]
pub unsafe extern "C" fn hostvm_schedule(
    lifecycle: *const HostvmLifecycle,
    generation: u64,
    priority: i32,
    callback: Option<HostvmJobFn>,
    user_data: *mut c_void,
) -> HostvmStatus {
    let (Some(lifecycle), Some(callback)) = (lifecycle.as_ref(), callback) else {
        return HostvmStatus::NullArgument;
    };
    let priority = match priority {
        0 => Priority::Sync,
        1 => Priority::Async,
        _ => return HostvmStatus::InvalidPriority,
    };
    let pending = PendingCallback {
        callback,
        user_data,
        ran: false,
    };
    catch_panic("hostvm_schedule", HostvmStatus::Panicked, move || {
        let job = move |env: &mut ForeignEnv| {
            let status = pending.run(env.0);
            if status != 0 {
                tracing::debug!("Scheduled callback returned status {}", status);
            }
        };
        match lifecycle
            .lifecycle
            .schedule(Generation::from_raw(generation), priority, job)
        {
            Ok(()) => HostvmStatus::Ok,
            Err(err) => (&err).into(),
        }
    })
}

/// Start shutting down runtime `generation`. Does not wait.
///
/// # Safety
/// `lifecycle` must be valid.
#[no_mangle]
pub unsafe extern "C" fn hostvm_begin_termination(
    lifecycle: *const HostvmLifecycle,
    generation: u64,
) -> HostvmStatus {
    let Some(lifecycle) = lifecycle.as_ref() else {
        return HostvmStatus::NullArgument;
    };
    catch_panic("hostvm_begin_termination", HostvmStatus::Panicked, || {
        match lifecycle
            .lifecycle
            .begin_termination(Generation::from_raw(generation))
        {
            Ok(()) => HostvmStatus::Ok,
            Err(err) => (&err).into(),
        }
    })
}

/// Wait until no runtime is running. A negative `timeout_ms` waits forever.
///
/// # Safety
/// `lifecycle` must be valid. Must not be called from a worker thread.
#[no_mangle]
pub unsafe extern "C" fn hostvm_wait_stopped(
    lifecycle: *const HostvmLifecycle,
    timeout_ms: i64,
) -> HostvmStatus {
    let Some(lifecycle) = lifecycle.as_ref() else {
        return HostvmStatus::NullArgument;
    };
    let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
    catch_panic("hostvm_wait_stopped", HostvmStatus::Panicked, || {
        if lifecycle.lifecycle.wait_until_stopped(timeout) {
            HostvmStatus::Ok
        } else {
            HostvmStatus::TimedOut
        }
    })
}

/// Current lifecycle state: 0 not running, 1 starting, 2 started,
/// 3 terminating, or -1 if `lifecycle` is null.
///
/// # Safety
/// `lifecycle` must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn hostvm_state(lifecycle: *const HostvmLifecycle) -> i32 {
    let Some(lifecycle) = lifecycle.as_ref() else {
        return -1;
    };
    match lifecycle.lifecycle.state() {
        LifecycleState::NotRunning => 0,
        LifecycleState::Starting => 1,
        LifecycleState::Started => 2,
        LifecycleState::Terminating => 3,
    }
}
