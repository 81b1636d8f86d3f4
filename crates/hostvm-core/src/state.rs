//! Runtime lifecycle state machine.
//!
//! ```text
//!              try_enter_starting            enter_started
//! NotRunning ─────────────────────▶ Starting ─────────────▶ Started
//!     ▲                                │                       │
//!     │        enter_not_running       │                       │ try_enter_terminating
//!     ├────────────────────────────────┘                       ▼
//!     └──────────────────────────────────────────────── Terminating
//!                       enter_not_running
//! ```
//!
//! The machine itself is not synchronized; `Lifecycle` keeps it behind a
//! single mutex so that every transition is one check-and-set.

use std::fmt;

use crate::error::{InvalidState, LifecycleError};

/// Lifecycle state of the embedded runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No runtime exists. Initial and terminal state.
    NotRunning,
    /// A boot thread is bringing the runtime up.
    Starting,
    /// The runtime is up and accepting work.
    Started,
    /// Workers are being recycled and the runtime shut down.
    Terminating,
}

/// Token identifying one boot-to-shutdown epoch.
///
/// Callers receive a copy when the runtime starts and present it back on
/// every operation. Any termination moves the counter on, so a stale copy
/// can never address a later epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    /// Rebuild a generation from its raw value.
    pub const fn from_raw(raw: u64) -> Self {
        Generation(raw)
    }

    /// Get the raw generation value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// The four-state machine guarding a single runtime handle.
///
/// Invariant: `handle` is `Some` iff `state == Started`.
#[derive(Debug)]
pub struct StateMachine<H> {
    state: LifecycleState,
    handle: Option<H>,
    generation: Generation,
}

impl<H> StateMachine<H> {
    /// Create a machine in `NotRunning` at generation zero.
    pub fn new() -> Self {
        Self {
            state: LifecycleState::NotRunning,
            handle: None,
            generation: Generation::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Current generation.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// `NotRunning -> Starting`.
    pub fn try_enter_starting(&mut self) -> Result<(), LifecycleError> {
        if self.state != LifecycleState::NotRunning {
            return Err(LifecycleError::AlreadyRunning);
        }
        self.state = LifecycleState::Starting;
        Ok(())
    }

    /// `Starting -> Started`, storing the booted handle.
    pub fn enter_started(&mut self, handle: H) -> Result<Generation, LifecycleError> {
        self.expect_state(&[LifecycleState::Starting], LifecycleState::Started)?;
        self.handle = Some(handle);
        self.generation = self.generation.next();
        self.state = LifecycleState::Started;
        Ok(self.generation)
    }

    /// `Started -> Terminating` for the matching generation.
    ///
    /// Returns the cleared handle. The generation moves on, invalidating
    /// every copy handed out for this epoch.
    pub fn try_enter_terminating(&mut self, generation: Generation) -> Result<H, LifecycleError> {
        self.check_started(generation)?;
        let handle = self.handle.take().ok_or(LifecycleError::NotRunning)?;
        self.generation = self.generation.next();
        self.state = LifecycleState::Terminating;
        Ok(handle)
    }

    /// `Starting | Terminating -> NotRunning`.
    pub fn enter_not_running(&mut self) -> Result<(), LifecycleError> {
        self.expect_state(
            &[LifecycleState::Starting, LifecycleState::Terminating],
            LifecycleState::NotRunning,
        )?;
        if self.handle.is_some() {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                to: LifecycleState::NotRunning,
            });
        }
        self.state = LifecycleState::NotRunning;
        Ok(())
    }

    /// Check that `generation` addresses a started runtime.
    pub fn check_started(&self, generation: Generation) -> Result<&H, InvalidState> {
        if generation != self.generation {
            return Err(InvalidState::StaleGeneration);
        }
        match (&self.state, &self.handle) {
            (LifecycleState::Started, Some(handle)) => Ok(handle),
            _ => Err(InvalidState::NotRunning),
        }
    }

    fn expect_state(
        &self,
        allowed: &[LifecycleState],
        to: LifecycleState,
    ) -> Result<(), LifecycleError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }
}

impl<H> Default for StateMachine<H> {
    fn default() -> Self {
        Self::new()
    }
}
