//! Self-pipe bridge from asynchronous signal delivery to the event loop.
//!
//! The handler installed for `SIGINT`/`SIGTERM` does exactly one thing: it
//! writes the signal number as a single byte into a non-blocking pipe. The
//! loop watches the read end and decodes whatever accumulated once it is
//! readable, so all real handling runs on the loop thread.
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Upper bound on bytes consumed per drain.
const DRAIN_BUFFER: usize = 1024;

/// Write end of the installed bridge's pipe, or -1 while none is installed.
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Set while a [`SignalBridge`] exists.
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Signal kinds the host reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SignalKind {
    Interrupt,
    Terminate,
}

/// Distinct signal kinds observed in one drain cycle.
pub type SignalEvent = BTreeSet<SignalKind>;

impl SignalKind {
    /// The OS signal backing this kind.
    pub fn signal(self) -> Signal {
        match self {
            SignalKind::Interrupt => Signal::SIGINT,
            SignalKind::Terminate => Signal::SIGTERM,
        }
    }

    /// Decode one byte written by the handler.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match Signal::try_from(i32::from(byte)) {
            Ok(Signal::SIGINT) => Some(SignalKind::Interrupt),
            Ok(Signal::SIGTERM) => Some(SignalKind::Terminate),
            _ => None,
        }
    }
}

/// Decode a drained buffer into the set of kinds it mentions.
pub fn decode(bytes: &[u8]) -> SignalEvent {
    bytes.iter().copied().filter_map(SignalKind::from_byte).collect()
}

/// Errors raised while setting up the bridge. All of them are fatal to startup.
#[derive(Debug)]
pub enum SignalError {
    /// Another bridge is already installed in this process.
    AlreadyInstalled,
    /// `pipe2` failed.
    Pipe(Errno),
    /// `sigaction` failed for one of the requested signals.
    Handler { signal: Signal, source: Errno },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::AlreadyInstalled => {
                write!(f, "a signal bridge is already installed in this process")
            }
            SignalError::Pipe(e) => write!(f, "failed to create signal pipe: {e}"),
            SignalError::Handler { signal, source } => {
                write!(f, "failed to install handler for {signal}: {source}")
            }
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::AlreadyInstalled => None,
            SignalError::Pipe(e) => Some(e),
            SignalError::Handler { source, .. } => Some(source),
        }
    }
}

/// The pipe pair. Both ends are non-blocking and close-on-exec.
#[derive(Debug)]
pub struct SelfPipe {
    read: File,
    write: OwnedFd,
}

impl SelfPipe {
    pub fn new() -> Result<Self, Errno> {
        let (read, write) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(Self {
            read: File::from(read),
            write,
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Write `kind` into the pipe exactly as the signal handler would.
    #[cfg(test)]
    pub fn notify(&self, kind: SignalKind) {
        write_signal_byte(self.write_fd(), kind.signal() as libc::c_int);
    }

    /// One bounded, non-blocking read. Nothing pending yields an empty set.
    pub fn drain(&self) -> SignalEvent {
        let mut buf = [0u8; DRAIN_BUFFER];
        let n = match (&self.read).read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => 0,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read signal pipe");
                0
            }
        };
        decode(&buf[..n])
    }
}

impl AsFd for SelfPipe {
    /// The read end.
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }
}

/// Async-signal-safe: a single `write(2)` of a stack byte, errno preserved.
fn write_signal_byte(fd: RawFd, signo: libc::c_int) {
    let saved = Errno::last_raw();
    let byte = signo as u8;
    // SAFETY: write(2) is async-signal-safe and `byte` outlives the call.
    // A full pipe (EAGAIN) is fine: a pending byte already wakes the loop.
    unsafe {
        libc::write(fd, (&byte as *const u8).cast(), 1);
    }
    Errno::set_raw(saved);
}

extern "C" fn handle_signal(signo: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Acquire);
    if fd >= 0 {
        write_signal_byte(fd, signo);
    }
}

/// Process-wide signal bridge. At most one exists at a time; dropping it
/// restores the previous dispositions.
#[derive(Debug)]
pub struct SignalBridge {
    pipe: SelfPipe,
    previous: Vec<(Signal, SigAction)>,
}

impl SignalBridge {
    /// Create the pipe, publish its write end, then install handlers for `kinds`.
    pub fn install(kinds: &[SignalKind]) -> Result<Self, SignalError> {
        if INSTALLED.swap(true, Ordering::AcqRel) {
            return Err(SignalError::AlreadyInstalled);
        }
        let pipe = match SelfPipe::new() {
            Ok(pipe) => pipe,
            Err(e) => {
                INSTALLED.store(false, Ordering::Release);
                return Err(SignalError::Pipe(e));
            }
        };
        WRITE_FD.store(pipe.write_fd(), Ordering::Release);

        // From here on, an early return drops `bridge`, which undoes the
        // handlers installed so far.
        let mut bridge = SignalBridge {
            pipe,
            previous: Vec::with_capacity(kinds.len()),
        };
        let action = SigAction::new(
            SigHandler::Handler(handle_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for kind in kinds {
            let signal = kind.signal();
            // SAFETY: the handler only calls async-signal-safe functions.
            let old = unsafe { sigaction(signal, &action) }
                .map_err(|source| SignalError::Handler { signal, source })?;
            bridge.previous.push((signal, old));
        }
        tracing::debug!(
            read_fd = bridge.read_fd(),
            signals = ?kinds,
            "signal bridge installed"
        );
        Ok(bridge)
    }

    /// Descriptor the loop should watch for readability.
    pub fn read_fd(&self) -> RawFd {
        self.pipe.read_fd()
    }

    /// Drain pending signal bytes. Never blocks.
    pub fn on_readable(&self) -> SignalEvent {
        self.pipe.drain()
    }
}

impl AsFd for SignalBridge {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.pipe.as_fd()
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for (signal, old) in self.previous.drain(..).rev() {
            // SAFETY: restores a disposition previously returned by sigaction.
            if let Err(e) = unsafe { sigaction(signal, &old) } {
                tracing::warn!(%signal, error = %e, "failed to restore signal disposition");
            }
        }
        WRITE_FD.store(-1, Ordering::Release);
        INSTALLED.store(false, Ordering::Release);
    }
}
