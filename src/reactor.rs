//! The seam between the host window and whatever drives its event loop.
//!
//! A host needs exactly two things from a loop: to be called back when a
//! descriptor becomes readable, and to have work posted onto the loop thread
//! from any context. [`EventLoop`] provides both on a current-thread tokio
//! runtime; tests substitute a manual reactor.

use crate::window::HostWindow;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::panic::{self, AssertUnwindSafe};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Work executed on the loop thread.
pub type Job = Box<dyn FnOnce(&mut HostWindow) + Send + 'static>;

/// Called on the loop thread when a watched descriptor is readable.
pub type ReadableHandler = fn(&mut HostWindow);

pub trait Reactor {
    /// Invoke `handler` on the loop thread whenever `fd` becomes readable.
    fn watch_readable(
        &mut self,
        fd: BorrowedFd<'_>,
        handler: ReadableHandler,
    ) -> std::io::Result<()>;

    /// A handle for posting work onto the loop thread.
    fn dispatcher(&self) -> Dispatcher;
}

/// Returned by [`Dispatcher::post`] once the loop has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopClosed;

impl std::fmt::Display for LoopClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event loop is no longer running")
    }
}

impl std::error::Error for LoopClosed {}

/// Thread-safe FIFO handle onto the loop. Jobs posted through one dispatcher
/// run in the order they were posted.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post<F>(&self, job: F) -> Result<(), LoopClosed>
    where
        F: FnOnce(&mut HostWindow) + Send + 'static,
    {
        self.tx.send(Box::new(job)).map_err(|_| LoopClosed)
    }
}

/// Run one job, containing any panic at the job boundary. The panic hook has
/// already reported it by the time `catch_unwind` returns.
pub fn run_job(job: Job, host: &mut HostWindow) {
    if panic::catch_unwind(AssertUnwindSafe(|| job(host))).is_err() {
        tracing::debug!("loop job panicked, continuing");
    }
}

/// Single-threaded loop over a FIFO job queue.
///
/// Must be created and run inside a current-thread tokio runtime: readiness
/// watchers are tasks on that runtime that feed the same queue.
pub struct EventLoop {
    dispatcher: Dispatcher,
    jobs: mpsc::UnboundedReceiver<Job>,
    watchers: Vec<JoinHandle<()>>,
}

impl EventLoop {
    pub fn new() -> Self {
        let (dispatcher, jobs) = Dispatcher::channel();
        Self {
            dispatcher,
            jobs,
            watchers: Vec::new(),
        }
    }

    /// Execute jobs in order until the host has terminated.
    pub async fn run(mut self, host: &mut HostWindow) {
        tracing::debug!("event loop running");
        while !host.is_terminated() {
            // The loop holds a dispatcher itself, so the queue never closes here.
            let Some(job) = self.jobs.recv().await else {
                break;
            };
            run_job(job, host);
        }
        tracing::debug!("event loop finished");
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor for EventLoop {
    fn watch_readable(
        &mut self,
        fd: BorrowedFd<'_>,
        handler: ReadableHandler,
    ) -> std::io::Result<()> {
        // The watcher task outlives this borrow, so it gets its own
        // close-on-exec duplicate of the descriptor.
        let watched = fd.try_clone_to_owned()?;
        let raw = watched.as_raw_fd();
        let async_fd = AsyncFd::with_interest(watched, Interest::READABLE)?;
        let dispatcher = self.dispatcher.clone();
        self.watchers.push(tokio::spawn(async move {
            loop {
                let mut guard = match async_fd.readable().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        tracing::warn!(fd = raw, error = %e, "readiness watch failed");
                        return;
                    }
                };
                if dispatcher.post(move |host| handler(host)).is_err() {
                    return;
                }
                // The posted job runs after this point, so anything written
                // before its read is seen by it and anything later re-arms.
                guard.clear_ready();
            }
        }));
        Ok(())
    }

    fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        for watcher in &self.watchers {
            watcher.abort();
        }
    }
}
