//! hostvm core - attached-worker host for embedded virtual machines
//!
//! This crate owns the lifecycle of an embedded, thread-affine runtime (a
//! native VM that every calling thread must attach to first):
//! - `Lifecycle` - boot on a dedicated thread, schedule work, terminate
//! - `WorkQueue` - sync and async FIFOs served by on-demand workers
//! - `WorkerPool` - attached worker threads of one generation
//! - `ModuleLifetime` - keeps the containing shared object loaded while
//!   its threads run
//! - `Runtime` - the boot / attach / detach / shutdown surface being hosted
//!
//! # Design Goals
//!
//! - At most one runtime per `Lifecycle`, identified by a `Generation` that
//!   any termination invalidates
//! - Scheduling never blocks on a worker; workers are created on demand
//!   and never pooled across generations
//! - Every thread that attached also detaches, on the same thread
//!
//! # C Interface
//!
//! The `ffi` module exposes the lifecycle to embedders through a vtable of
//! runtime callbacks and `hostvm_*` functions returning status codes.

pub mod completion;
pub mod error;
pub mod ffi;
pub mod lifecycle;
pub mod module;
pub mod queue;
pub mod runtime;
pub mod state;
pub mod worker;

#[cfg(test)]
mod test_support;

use std::time::Duration;

pub use completion::Completion;
pub use error::{
    ConfigError, CreateError, EnqueueError, InvalidState, JobError, LifecycleError, ScheduleError,
};
pub use lifecycle::{HostStats, Lifecycle};
pub use module::{ModuleLifetime, ModulePin};
pub use queue::{Job, Priority, QueueStats, WaitOutcome, WorkQueue};
pub use runtime::Runtime;
pub use state::{Generation, LifecycleState, StateMachine};
pub use worker::{PoolStats, WorkerPool};

/// Environment variable overriding the thread name prefix.
pub const ENV_THREAD_PREFIX: &str = "HOSTVM_THREAD_PREFIX";
/// Environment variable setting worker stack size in bytes.
pub const ENV_STACK_SIZE: &str = "HOSTVM_STACK_SIZE";
/// Environment variable setting the idle retirement timeout in milliseconds.
/// Zero disables retirement.
pub const ENV_IDLE_TIMEOUT_MS: &str = "HOSTVM_IDLE_TIMEOUT_MS";

/// Configuration for threads spawned by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Name prefix for spawned threads
    pub thread_name_prefix: String,
    /// Stack size for spawned threads (bytes)
    pub stack_size: Option<usize>,
    /// How long an on-demand worker may sit idle before it detaches and
    /// exits. `None` keeps workers until termination.
    pub idle_timeout: Option<Duration>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "hostvm".to_string(),
            stack_size: None,
            idle_timeout: None,
        }
    }
}

impl HostConfig {
    /// Create a new host configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from the `HOSTVM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`, starting from the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(prefix) = lookup(ENV_THREAD_PREFIX).filter(|prefix| !prefix.is_empty()) {
            config.thread_name_prefix = prefix;
        }
        if let Some(raw) = lookup(ENV_STACK_SIZE) {
            config.stack_size = Some(parse_var(ENV_STACK_SIZE, &raw)?);
        }
        if let Some(raw) = lookup(ENV_IDLE_TIMEOUT_MS) {
            let millis: u64 = parse_var(ENV_IDLE_TIMEOUT_MS, &raw)?;
            config.idle_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }
        Ok(config)
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the stack size for spawned threads.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Retire on-demand workers after `timeout` without work.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

fn parse_var<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}
