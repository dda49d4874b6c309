//! Relay for errors that escape the normal call path.
//!
//! A panic can happen anywhere, including deep inside a job on the loop or
//! on some other thread. The relay's panic hook logs the full diagnostic on
//! stderr, then posts a short message onto the loop so the window can show
//! it. Errors that escape loop work without panicking go through
//! [`ErrorRelay::report_error`] and take the same route.

use crate::reactor::Dispatcher;
use std::io::Write;
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;

/// Title of the error surface.
pub const ERROR_TITLE: &str = "Unhandled error";

/// Longest message shown on the surface; the full text is in the log.
const MAX_DISPLAY_CHARS: usize = 500;

type PanicHook = dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static;

/// Panic payload meaning "the user asked to stop". Never reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// User-initiated cancellation: ordinary termination.
    Cancelled,
    Failure,
}

/// One captured error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: ReportKind,
    /// Human-readable message.
    pub message: String,
    /// Full diagnostic text for the log.
    pub detail: String,
}

impl ErrorReport {
    #[cfg(test)]
    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ReportKind::Failure,
            detail: message.clone(),
            message,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ReportKind::Cancelled,
            message: "cancelled".to_string(),
            detail: String::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ReportKind::Cancelled
    }

    pub fn from_panic(info: &PanicHookInfo<'_>) -> Self {
        let payload = info.payload();
        if payload.is::<Cancelled>() {
            return Self::cancelled();
        }
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with a non-string payload".to_string()
        };
        let detail = match info.location() {
            Some(location) => format!("{message} (at {location})"),
            None => message.clone(),
        };
        Self {
            kind: ReportKind::Failure,
            message,
            detail,
        }
    }

    /// An interrupted I/O error anywhere in the chain counts as cancellation.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut detail = err.to_string();
        let mut current = Some(err);
        while let Some(e) = current {
            let interrupted = e
                .downcast_ref::<std::io::Error>()
                .is_some_and(|io| io.kind() == std::io::ErrorKind::Interrupted);
            if interrupted {
                return Self::cancelled();
            }
            current = e.source();
            if let Some(source) = current {
                detail.push_str("\n  caused by: ");
                detail.push_str(&source.to_string());
            }
        }
        Self {
            kind: ReportKind::Failure,
            message: err.to_string(),
            detail,
        }
    }

    /// Short text for the error surface: the first line, bounded in length.
    pub fn display_message(&self) -> String {
        let first_line = self.message.lines().next().unwrap_or("").trim();
        if first_line.is_empty() {
            return "unknown error".to_string();
        }
        if first_line.chars().count() <= MAX_DISPLAY_CHARS {
            return first_line.to_string();
        }
        let mut short: String = first_line.chars().take(MAX_DISPLAY_CHARS).collect();
        short.push('…');
        short
    }
}

/// What happened to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Cancellation; nothing reported.
    Suppressed,
    /// Posted onto the loop.
    Queued,
    /// The loop was gone; printed straight to stderr.
    Fallback,
}

/// Format and post a report whose diagnostic has already been emitted.
fn relay(dispatcher: &Dispatcher, report: &ErrorReport) -> Delivery {
    let message = report.display_message();
    let shown = message.clone();
    match dispatcher.post(move |host| host.show_error(&shown)) {
        Ok(()) => Delivery::Queued,
        Err(_) => {
            // Runs inside the panic hook: a failed write must not panic again.
            let _ = writeln!(std::io::stderr(), "{ERROR_TITLE}: {message}");
            Delivery::Fallback
        }
    }
}

/// Owns the process-wide panic hook while it exists. Dropping it puts the
/// previous hook back.
pub struct ErrorRelay {
    dispatcher: Dispatcher,
    previous: Option<Arc<PanicHook>>,
}

impl ErrorRelay {
    /// A relay without a panic hook; only explicit reports are relayed.
    #[cfg(test)]
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            previous: None,
        }
    }

    /// Install the panic hook, chaining to whatever hook was there before.
    pub fn install(dispatcher: Dispatcher) -> Self {
        let previous: Arc<PanicHook> = Arc::from(panic::take_hook());
        let chained = Arc::clone(&previous);
        let hook_dispatcher = dispatcher.clone();
        panic::set_hook(Box::new(move |info| {
            let report = ErrorReport::from_panic(info);
            if report.is_cancelled() {
                return;
            }
            // Full diagnostic first: message, location, backtrace note.
            chained(info);
            relay(&hook_dispatcher, &report);
        }));
        tracing::debug!("error relay installed");
        Self {
            dispatcher,
            previous: Some(previous),
        }
    }

    /// Report one uncaught error.
    pub fn on_uncaught(&self, report: ErrorReport) -> Delivery {
        if report.is_cancelled() {
            tracing::debug!("cancellation reached the error relay, ignoring");
            return Delivery::Suppressed;
        }
        tracing::error!(detail = %report.detail, "uncaught error");
        relay(&self.dispatcher, &report)
    }

    /// Report an error that escaped loop work without panicking.
    pub fn report_error(&self, err: &(dyn std::error::Error + 'static)) -> Delivery {
        self.on_uncaught(ErrorReport::from_error(err))
    }
}

impl std::fmt::Debug for ErrorRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRelay")
            .field("hook_installed", &self.previous.is_some())
            .finish()
    }
}

impl Drop for ErrorRelay {
    fn drop(&mut self) {
        // set_hook panics when called during unwinding; leave ours in place then.
        if std::thread::panicking() {
            return;
        }
        if let Some(previous) = self.previous.take() {
            panic::set_hook(Box::new(move |info| previous(info)));
        }
    }
}
