//! The embedded runtime as seen by the host.
//!
//! A `Runtime` is a native virtual machine whose call surface is thread
//! affine: a thread must attach before it may call in, and must detach
//! before it exits. The host never calls into the runtime from a thread
//! that has not attached, and never tears down an attached thread.

use std::fmt::Display;
use std::sync::Arc;

/// Capability surface of an embedded, thread-affine runtime.
///
/// Implementations are shared between the boot thread and every worker,
/// so the runtime object itself must be `Send + Sync`. The per-thread
/// environment produced by `attach_current_thread` never leaves the
/// thread that created it.
///
/// Call order guaranteed by the host, per generation:
///
/// ```text
/// boot thread:  boot ─ attach ─ [jobs] ─ detach ─ (wait for workers) ─ shutdown
/// worker N:            attach ─ [jobs] ─ detach
/// ```
pub trait Runtime: Send + Sync + 'static {
    /// Opaque boot configuration, passed through untouched.
    type Config: Send + 'static;

    /// Handle to a booted runtime.
    type Handle: Clone + Send + Sync + 'static;

    /// Per-thread environment handed to jobs.
    type Env: 'static;

    /// Failure reported by `boot` or `attach_current_thread`.
    type Error: Display + Send + 'static;

    /// Boot the runtime on the calling thread.
    fn boot(&self, config: Self::Config) -> Result<Self::Handle, Self::Error>;

    /// Attach the calling thread and return its environment.
    fn attach_current_thread(&self, handle: &Self::Handle) -> Result<Self::Env, Self::Error>;

    /// Release the calling thread's attachment.
    fn detach_current_thread(&self, handle: &Self::Handle, env: Self::Env);

    /// Shut the runtime down. Called once, after every worker has detached.
    fn shutdown(&self, handle: Self::Handle);
}

impl<R: Runtime> Runtime for Arc<R> {
    type Config = R::Config;
    type Handle = R::Handle;
    type Env = R::Env;
    type Error = R::Error;

    fn boot(&self, config: Self::Config) -> Result<Self::Handle, Self::Error> {
        (**self).boot(config)
    }

    fn attach_current_thread(&self, handle: &Self::Handle) -> Result<Self::Env, Self::Error> {
        (**self).attach_current_thread(handle)
    }

    fn detach_current_thread(&self, handle: &Self::Handle, env: Self::Env) {
        (**self).detach_current_thread(handle, env)
    }

    fn shutdown(&self, handle: Self::Handle) {
        (**self).shutdown(handle)
    }
}
