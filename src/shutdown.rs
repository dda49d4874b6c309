/// Idempotent shutdown state machine.
///
/// Signals and child exit can race; whichever arrives first drives the
/// teardown and every later trigger is coalesced into a no-op.
use crate::signals::SignalKind;
use tracing::{debug, info};

/// Lifecycle of the host: `Running → ShuttingDown → Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownState {
    #[default]
    Running,
    ShuttingDown,
    Terminated,
}

/// The ordered steps of a teardown.
pub trait Teardown {
    /// Close the visible window / interactive surface.
    fn close_surface(&mut self);

    /// Release whatever else the host still holds.
    fn release_resources(&mut self);
}

/// Drives a [`Teardown`] at most once.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    state: ShutdownState,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ShutdownState::Terminated
    }

    /// Interrupt and terminate both end the host.
    pub fn on_signal(&mut self, kind: SignalKind, teardown: &mut impl Teardown) -> bool {
        match kind {
            SignalKind::Interrupt | SignalKind::Terminate => {
                info!(signal = ?kind, "shutdown requested by signal");
                self.shutdown(teardown)
            }
        }
    }

    /// The host has no purpose once its child is gone.
    pub fn on_child_exit(&mut self, teardown: &mut impl Teardown) -> bool {
        info!("child process exited, shutting down");
        self.shutdown(teardown)
    }

    /// Run the teardown if it has not started yet.
    ///
    /// Returns `true` only for the call that actually performed it.
    pub fn shutdown(&mut self, teardown: &mut impl Teardown) -> bool {
        if self.state != ShutdownState::Running {
            debug!(state = ?self.state, "shutdown already underway, ignoring trigger");
            return false;
        }
        self.state = ShutdownState::ShuttingDown;
        teardown.close_surface();
        teardown.release_resources();
        self.state = ShutdownState::Terminated;
        info!("shutdown complete");
        true
    }
}
