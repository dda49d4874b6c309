//! The host window: owner of everything the core installs process-wide.
//!
//! Construction installs the error relay, then the signal bridge, then
//! registers the bridge's descriptor with the reactor. Dropping the window
//! undoes the installs in reverse.
use crate::child::ChildProcess;
use crate::config::HostConfig;
use crate::error_relay::{ErrorRelay, ERROR_TITLE};
use crate::reactor::Reactor;
use crate::shutdown::{ShutdownCoordinator, ShutdownState, Teardown};
use crate::signals::{SignalBridge, SignalError, SignalKind};
use crate::watchdog::{ChildExit, ChildWatchdog};
use serde::Serialize;
use std::io::{Stderr, Write};
use std::os::fd::AsFd;
use tracing::{debug, info};

/// Where the window actually renders. Presentation proper is out of scope;
/// the host only needs these three operations.
pub trait Surface {
    fn present(&mut self, title: &str);

    /// Show a modal error. Blocks the user, not the loop.
    fn show_error(&mut self, title: &str, message: &str);

    fn close(&mut self);
}

/// Window class name and class, from `--name` and `--class`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowIdentity {
    pub name: String,
    pub class: String,
}

/// Surface that renders on the controlling terminal's stderr.
#[derive(Debug)]
pub struct ConsoleSurface<W = Stderr> {
    identity: WindowIdentity,
    out: W,
    open: bool,
}

impl ConsoleSurface {
    pub fn new(identity: WindowIdentity) -> Self {
        Self::with_writer(identity, std::io::stderr())
    }
}

impl<W: Write> ConsoleSurface<W> {
    pub fn with_writer(identity: WindowIdentity, out: W) -> Self {
        Self {
            identity,
            out,
            open: false,
        }
    }

    fn write_error(&mut self, title: &str, message: &str) -> std::io::Result<()> {
        writeln!(self.out)?;
        writeln!(self.out, "[{}] {title}", self.identity.name)?;
        for line in message.lines() {
            writeln!(self.out, "    {line}")?;
        }
        writeln!(self.out)?;
        self.out.flush()
    }
}

impl<W: Write> Surface for ConsoleSurface<W> {
    fn present(&mut self, title: &str) {
        self.open = true;
        info!(
            title,
            name = %self.identity.name,
            class = %self.identity.class,
            "window presented"
        );
    }

    fn show_error(&mut self, title: &str, message: &str) {
        // A closed stderr must not turn one error into a panic loop.
        if let Err(e) = self.write_error(title, message) {
            debug!(error = %e, "could not render error on the console");
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            info!("window closed");
        }
    }
}

/// Fatal errors while setting up the window.
#[derive(Debug)]
pub enum HostError {
    Signals(SignalError),
    /// The reactor refused to watch the signal descriptor.
    Watch(std::io::Error),
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostError::Signals(e) => write!(f, "signal setup failed: {e}"),
            HostError::Watch(e) => write!(f, "failed to watch signal descriptor: {e}"),
        }
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HostError::Signals(e) => Some(e),
            HostError::Watch(e) => Some(e),
        }
    }
}

pub struct HostWindow {
    config: HostConfig,
    surface: Box<dyn Surface>,
    child: Option<ChildProcess>,
    shutdown: ShutdownCoordinator,
    signals: Option<SignalBridge>,
    relay: Option<ErrorRelay>,
}

/// The parts of the window a teardown touches.
struct WindowTeardown<'a> {
    surface: &'a mut Box<dyn Surface>,
    child: &'a mut Option<ChildProcess>,
}

impl Teardown for WindowTeardown<'_> {
    fn close_surface(&mut self) {
        self.surface.close();
    }

    fn release_resources(&mut self) {
        if let Some(child) = self.child.take() {
            child.hang_up();
        }
        debug!("host resources released");
    }
}

impl HostWindow {
    /// Install the relay and the signal bridge and hook the bridge into
    /// `reactor`. On failure the child is hung up before returning.
    pub fn new(
        config: HostConfig,
        child: ChildProcess,
        surface: Box<dyn Surface>,
        reactor: &mut impl Reactor,
    ) -> Result<Self, HostError> {
        let relay = ErrorRelay::install(reactor.dispatcher());
        let signals = match Self::install_signals(reactor) {
            Ok(signals) => signals,
            Err(e) => {
                child.hang_up();
                return Err(e);
            }
        };
        Ok(Self {
            config,
            surface,
            child: Some(child),
            shutdown: ShutdownCoordinator::new(),
            signals: Some(signals),
            relay: Some(relay),
        })
    }

    fn install_signals(reactor: &mut impl Reactor) -> Result<SignalBridge, HostError> {
        let signals = SignalBridge::install(&[SignalKind::Interrupt, SignalKind::Terminate])
            .map_err(HostError::Signals)?;
        reactor
            .watch_readable(signals.as_fd(), Self::signals_readable)
            .map_err(HostError::Watch)?;
        Ok(signals)
    }

    /// A window with no child, bridge or relay.
    #[cfg(test)]
    pub(crate) fn detached(surface: Box<dyn Surface>) -> Self {
        Self {
            config: HostConfig::default(),
            surface,
            child: None,
            shutdown: ShutdownCoordinator::new(),
            signals: None,
            relay: None,
        }
    }

    pub fn present(&mut self) {
        self.surface.present(&self.config.window.title);
    }

    /// The resolved configuration this window was built with.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// A watchdog for the hosted child at the configured poll interval.
    /// `None` once the child is gone or for a window without one.
    pub fn child_watchdog(&self) -> Option<ChildWatchdog> {
        let interval = self.config().child.poll_interval();
        self.child
            .as_ref()
            .map(|child| ChildWatchdog::new(child, interval))
    }

    pub fn state(&self) -> ShutdownState {
        self.shutdown.state()
    }

    pub fn is_terminated(&self) -> bool {
        self.shutdown.is_terminated()
    }

    /// Readiness callback for the signal pipe.
    fn signals_readable(&mut self) {
        let Some(signals) = &self.signals else {
            return;
        };
        let event = signals.on_readable();
        if event.is_empty() {
            return;
        }
        debug!(signals = ?event, "drained signal pipe");
        for kind in event {
            self.on_signal(kind);
        }
    }

    pub fn on_signal(&mut self, kind: SignalKind) {
        let mut teardown = WindowTeardown {
            surface: &mut self.surface,
            child: &mut self.child,
        };
        self.shutdown.on_signal(kind, &mut teardown);
    }

    pub fn on_child_exit(&mut self, exit: ChildExit) {
        info!(%exit, "child process is gone");
        // Already reaped; nothing left to hang up.
        self.child = None;
        let mut teardown = WindowTeardown {
            surface: &mut self.surface,
            child: &mut self.child,
        };
        self.shutdown.on_child_exit(&mut teardown);
    }

    pub fn shutdown(&mut self) {
        let mut teardown = WindowTeardown {
            surface: &mut self.surface,
            child: &mut self.child,
        };
        self.shutdown.shutdown(&mut teardown);
    }

    /// Display step of the error relay. Runs on the loop thread only.
    pub fn show_error(&mut self, message: &str) {
        self.surface.show_error(ERROR_TITLE, message);
    }

    /// Route an error that escaped loop work through the relay.
    pub fn report_error(&self, err: &(dyn std::error::Error + 'static)) {
        match &self.relay {
            Some(relay) => {
                relay.report_error(err);
            }
            None => tracing::error!(error = %err, "uncaught error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::{spawn, ChildCommand, ChildSpec, EnvPolicy};
    use crate::reactor::{run_job, Dispatcher, Job, ReadableHandler};
    use crate::test_support::{process_hooks, RecordingSurface};
    use nix::errno::Errno;
    use nix::sys::signal::{raise, Signal};
    use nix::sys::wait::{waitpid, WaitStatus};
    use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    /// Reactor driven by hand from the test.
    struct ManualReactor {
        dispatcher: Dispatcher,
        jobs: mpsc::UnboundedReceiver<Job>,
        watches: Vec<(RawFd, ReadableHandler)>,
    }

    impl ManualReactor {
        fn new() -> Self {
            let (dispatcher, jobs) = Dispatcher::channel();
            Self {
                dispatcher,
                jobs,
                watches: Vec::new(),
            }
        }

        fn fire_readable(&self, host: &mut HostWindow) {
            for (_, handler) in &self.watches {
                handler(host);
            }
        }

        fn pump(&mut self, host: &mut HostWindow) {
            while let Ok(job) = self.jobs.try_recv() {
                run_job(job, host);
            }
        }
    }

    impl Reactor for ManualReactor {
        fn watch_readable(
            &mut self,
            fd: BorrowedFd<'_>,
            handler: ReadableHandler,
        ) -> std::io::Result<()> {
            self.watches.push((fd.as_raw_fd(), handler));
            Ok(())
        }

        fn dispatcher(&self) -> Dispatcher {
            self.dispatcher.clone()
        }
    }

    fn start(command: &str) -> ChildProcess {
        spawn(&ChildSpec {
            command: ChildCommand::parse(command),
            directory: PathBuf::from("/tmp"),
            env: EnvPolicy::default(),
        })
        .unwrap()
    }

    fn sleeping_child() -> ChildProcess {
        start("exec sleep 5")
    }

    /// Sink that fails every write, like stderr after the reader went away.
    #[derive(Debug)]
    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn identity() -> WindowIdentity {
        WindowIdentity {
            name: "termhost".to_string(),
            class: "termhost".to_string(),
        }
    }

    #[test]
    fn test_signal_race_runs_one_shutdown() {
        let _guard = process_hooks();
        let (surface, log) = RecordingSurface::new();
        let mut reactor = ManualReactor::new();
        let child = sleeping_child();
        let pid = child.pid();
        let mut host =
            HostWindow::new(HostConfig::default(), child, Box::new(surface), &mut reactor)
                .unwrap();
        assert_eq!(reactor.watches.len(), 1);
        host.present();

        // Both arrive before the loop gets to drain
        raise(Signal::SIGINT).unwrap();
        raise(Signal::SIGTERM).unwrap();
        reactor.fire_readable(&mut host);

        assert!(host.is_terminated());
        assert_eq!(log.borrow().presented, 1);
        assert_eq!(log.borrow().closed, 1);

        // A late signal is coalesced
        raise(Signal::SIGTERM).unwrap();
        reactor.fire_readable(&mut host);
        assert_eq!(log.borrow().closed, 1);

        drop(host);
        match waitpid(pid, None) {
            Ok(status) => assert_eq!(status, WaitStatus::Signaled(pid, Signal::SIGHUP, false)),
            Err(e) => assert_eq!(e, Errno::ECHILD),
        }
    }

    #[test]
    fn test_empty_drain_does_nothing() {
        let _guard = process_hooks();
        let (surface, log) = RecordingSurface::new();
        let mut reactor = ManualReactor::new();
        let child = sleeping_child();
        let mut host =
            HostWindow::new(HostConfig::default(), child, Box::new(surface), &mut reactor)
                .unwrap();

        reactor.fire_readable(&mut host);
        assert_eq!(host.state(), ShutdownState::Running);
        assert_eq!(log.borrow().closed, 0);

        host.shutdown();
        assert!(host.is_terminated());
    }

    #[test]
    fn test_reported_errors_shown_in_order() {
        let _guard = process_hooks();
        let (surface, log) = RecordingSurface::new();
        let mut reactor = ManualReactor::new();
        let child = sleeping_child();
        let mut host =
            HostWindow::new(HostConfig::default(), child, Box::new(surface), &mut reactor)
                .unwrap();

        host.report_error(&std::io::Error::other("A"));
        host.report_error(&std::io::Error::other("B"));
        // Nothing is shown until the loop runs the queued calls
        assert!(log.borrow().errors.is_empty());

        reactor.pump(&mut host);
        let messages: Vec<_> = log
            .borrow()
            .errors
            .iter()
            .map(|(_, m)| m.clone())
            .collect();
        assert_eq!(messages, vec!["A", "B"]);
        assert!(!host.is_terminated());

        host.shutdown();
    }

    #[test]
    fn test_child_exit_alone_terminates() {
        let (surface, log) = RecordingSurface::new();
        let mut host = HostWindow::detached(Box::new(surface));
        host.on_child_exit(ChildExit::Exited(0));
        assert_eq!(host.state(), ShutdownState::Terminated);
        assert_eq!(log.borrow().closed, 1);

        host.on_signal(SignalKind::Interrupt);
        host.shutdown();
        assert_eq!(log.borrow().closed, 1);
    }

    #[test]
    fn test_signal_after_watchdog_reap_skips_hangup() {
        let _guard = process_hooks();
        let (surface, log) = RecordingSurface::new();
        let mut reactor = ManualReactor::new();
        let mut host = HostWindow::new(
            HostConfig::default(),
            start("/bin/true"),
            Box::new(surface),
            &mut reactor,
        )
        .unwrap();

        let watchdog = host.child_watchdog().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while watchdog.poll().unwrap().is_none() {
            assert!(Instant::now() < deadline, "child did not exit in time");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(host.child.as_ref().unwrap().is_reaped());

        // The drain runs before the queued child-exit job
        raise(Signal::SIGINT).unwrap();
        reactor.fire_readable(&mut host);
        assert!(host.is_terminated());
        assert_eq!(log.borrow().closed, 1);
        assert!(host.child.is_none());
    }

    #[test]
    fn test_config_is_handed_to_surface_and_watchdog() {
        let _guard = process_hooks();
        let (surface, log) = RecordingSurface::new();
        let mut reactor = ManualReactor::new();
        let mut config = HostConfig::default();
        config.window.title = "scratch".to_string();
        let mut host =
            HostWindow::new(config, sleeping_child(), Box::new(surface), &mut reactor).unwrap();

        assert_eq!(host.config().window.title, "scratch");
        host.present();
        assert_eq!(log.borrow().titles, vec!["scratch"]);
        assert!(host.child_watchdog().is_some());

        host.shutdown();
        assert!(host.child_watchdog().is_none());
    }

    #[test]
    fn test_console_surface_close_is_idempotent() {
        let mut surface = ConsoleSurface::new(identity());
        surface.present("termhost");
        surface.close();
        surface.close();
        assert!(!surface.open);
    }

    #[test]
    fn test_console_surface_renders_error_lines() {
        let mut surface = ConsoleSurface::with_writer(identity(), Vec::new());
        surface.show_error(ERROR_TITLE, "disk full\nretry later");
        let text = String::from_utf8(surface.out).unwrap();
        assert_eq!(
            text,
            "\n[termhost] Unhandled error\n    disk full\n    retry later\n\n"
        );
    }

    #[test]
    fn test_console_surface_survives_closed_stderr() {
        let mut surface = ConsoleSurface::with_writer(identity(), ClosedPipe);
        surface.show_error(ERROR_TITLE, "first");
        surface.show_error(ERROR_TITLE, "second");
    }
}
