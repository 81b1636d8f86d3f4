//! Error types for the hostvm core.

use thiserror::Error;

use crate::state::LifecycleState;

/// Errors produced by the runtime state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// A boot was requested while a runtime is starting, running or stopping.
    #[error("runtime is already running")]
    AlreadyRunning,

    /// The generation refers to an epoch that has since ended.
    #[error("generation is stale")]
    StaleGeneration,

    /// The generation is current but the runtime is not started.
    #[error("runtime is not running")]
    NotRunning,

    /// A transition was requested from a state that does not allow it.
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// Why an operation against a generation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidState {
    /// The generation belongs to an epoch that has ended.
    #[error("stale generation")]
    StaleGeneration,

    /// The generation is current but no runtime is started.
    #[error("runtime not running")]
    NotRunning,
}

impl From<InvalidState> for LifecycleError {
    fn from(state: InvalidState) -> Self {
        match state {
            InvalidState::StaleGeneration => LifecycleError::StaleGeneration,
            InvalidState::NotRunning => LifecycleError::NotRunning,
        }
    }
}

/// Errors from `Lifecycle::create_runtime`.
#[derive(Debug, Error)]
pub enum CreateError {
    /// Another runtime is starting, running or stopping.
    #[error("runtime is already running")]
    AlreadyRunning,

    /// The runtime refused to boot, or the boot panicked.
    #[error("runtime boot failed: {0}")]
    BootFailed(String),

    /// The boot thread could not be created.
    #[error("failed to spawn boot thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Errors from `Lifecycle::schedule`.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The generation does not name a started runtime.
    #[error("not in a valid state to schedule work: {0}")]
    NotValidState(InvalidState),

    /// The queue could not grow to hold the job.
    #[error("out of memory while enqueueing work")]
    OutOfMemory,

    /// No worker was idle and a new one could not be created.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl ScheduleError {
    /// The state mismatch behind a `NotValidState` refusal, if that is what this is.
    pub fn invalid_state(&self) -> Option<InvalidState> {
        match self {
            ScheduleError::NotValidState(state) => Some(*state),
            _ => None,
        }
    }
}

impl From<EnqueueError> for ScheduleError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::OutOfMemory => ScheduleError::OutOfMemory,
            EnqueueError::Spawn(err) => ScheduleError::Spawn(err),
            // A poisoned queue belongs to a generation that is already terminating.
            EnqueueError::Closed => ScheduleError::NotValidState(InvalidState::NotRunning),
        }
    }
}

/// Errors from `WorkQueue::add`.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The queue could not reserve room for the item.
    #[error("out of memory")]
    OutOfMemory,

    /// A worker was needed but its thread could not be created.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The queue has been poisoned and accepts no more work.
    #[error("queue is closed")]
    Closed,
}

/// Outcome of a job whose result was requested through a `Completion`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job panicked on its worker.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The job was discarded without running.
    #[error("job was dropped before it ran")]
    Dropped,
}

/// Errors reading a `HostConfig` from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A variable was set to something that does not parse.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}
