//! Result handles for scheduled jobs.
//!
//! `Lifecycle::schedule` is fire-and-forget. When the caller needs the value
//! a job computed on its attached thread, `schedule_with_result` pairs the
//! job with a `Completion` that receives exactly one outcome: the value, the
//! panic message, or `JobError::Dropped` if the job was discarded unrun.

use std::any::Any;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::JobError;

/// Create a connected completer / completion pair.
pub(crate) fn pair<T>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (Completer { tx }, Completion { rx })
}

/// Sending half, moved into the job.
pub(crate) struct Completer<T> {
    tx: Sender<Result<T, JobError>>,
}

impl<T> Completer<T> {
    /// Run `f`, delivering its value or its panic.
    pub(crate) fn complete_with(self, f: impl FnOnce() -> T) {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
            .map_err(|panic| JobError::Panicked(panic_message(panic.as_ref())));
        // The caller may have dropped its Completion; nobody is left to tell.
        let _ = self.tx.send(outcome);
    }
}

/// Handle for awaiting the outcome of a scheduled job.
pub struct Completion<T> {
    rx: Receiver<Result<T, JobError>>,
}

impl<T> Completion<T> {
    /// Block until the job has run (or been dropped).
    pub fn wait(self) -> Result<T, JobError> {
        self.rx.recv().unwrap_or(Err(JobError::Dropped))
    }

    /// Block for at most `timeout`. `None` if the job has not finished yet.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, JobError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(JobError::Dropped)),
        }
    }

    /// Take the outcome without blocking.
    pub fn try_take(&self) -> Option<Result<T, JobError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(JobError::Dropped)),
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("ready", &!self.rx.is_empty())
            .finish()
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}
