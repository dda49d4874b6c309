/// Child exit monitor.
///
/// Runs on the loop's runtime alongside everything else, periodically polling
/// `waitpid(WNOHANG)`. It never installs a `SIGCHLD` handler, so the only
/// signals with non-default dispositions stay `SIGINT` and `SIGTERM`.
use crate::child::ChildProcess;
use crate::reactor::Dispatcher;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(Signal),
    /// Already reaped elsewhere; the exit status is unknown.
    Vanished,
}

impl std::fmt::Display for ChildExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildExit::Exited(code) => write!(f, "exited with status {code}"),
            ChildExit::Signaled(signal) => write!(f, "killed by {signal}"),
            ChildExit::Vanished => write!(f, "vanished"),
        }
    }
}

pub struct ChildWatchdog {
    pid: Pid,
    reaped: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl ChildWatchdog {
    pub fn new(child: &ChildProcess, poll_interval: Duration) -> Self {
        Self {
            pid: child.pid(),
            reaped: child.reaped_flag(),
            poll_interval,
        }
    }

    /// Non-blocking check. `Ok(None)` while the child is still running.
    ///
    /// Collecting the exit status marks the child reaped before returning,
    /// so a later hangup never signals the recycled pid.
    pub fn poll(&self) -> Result<Option<ChildExit>, Errno> {
        let exit = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => ChildExit::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => ChildExit::Signaled(signal),
            Ok(_) => return Ok(None),
            Err(Errno::ECHILD) => ChildExit::Vanished,
            Err(Errno::EINTR) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.reaped.store(true, Ordering::Release);
        Ok(Some(exit))
    }

    /// Poll until the child is gone, then post the exit onto the loop.
    pub async fn monitor(self, dispatcher: Dispatcher) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let delivered = match self.poll() {
                Ok(None) => continue,
                Ok(Some(exit)) => {
                    tracing::info!(pid = self.pid.as_raw(), %exit, "child process ended");
                    let delivered = dispatcher.post(move |host| host.on_child_exit(exit));
                    if delivered.is_ok() {
                        return;
                    }
                    delivered
                }
                Err(e) => {
                    tracing::warn!(pid = self.pid.as_raw(), error = %e, "waitpid failed");
                    dispatcher.post(move |host| host.report_error(&e))
                }
            };
            if delivered.is_err() {
                tracing::debug!("event loop gone, child watchdog stopping");
                return;
            }
        }
    }
}
