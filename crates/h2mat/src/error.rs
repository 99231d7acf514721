//! Engine error types and worker panic capture.

use h2mat_types::{ConfigError, DetailedError};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::{
    backtrace::Backtrace,
    borrow::Cow,
    cell::RefCell,
    error::Error as StdError,
    fmt::{self, Display, Formatter},
    panic::{self, Location, PanicHookInfo},
};

/// Top-level engine error.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Error {
    /// Invalid configuration, reported before construction begins.
    Config(ConfigError),

    /// One or more worker threads terminated unexpectedly.
    WorkerPanic {
        /// Detailed panic information from all ranks that reported panics.
        panic_info: Vec<(usize, WorkerPanicInfo)>,
    },
}

impl DetailedError for Error {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::Config(error) => error.error_code(),
            Self::WorkerPanic { .. } => Cow::from("WorkerPanic"),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(error) => error.fmt(f),
            Self::WorkerPanic { panic_info } => {
                writeln!(f, "one or more worker threads terminated unexpectedly")?;
                for (rank, info) in panic_info.iter() {
                    writeln!(f, "worker thread of rank {rank} panicked")?;
                    writeln!(f, "{info}")?;
                }
                Ok(())
            }
        }
    }
}

impl StdError for Error {}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Self {
        Self::Config(error)
    }
}

// Rust source code location of a panic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanicLocation {
    file: String,
    line: u32,
    col: u32,
}

impl Display for PanicLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

impl PanicLocation {
    fn new(loc: &Location) -> Self {
        Self {
            file: loc.file().to_string(),
            line: loc.line(),
            col: loc.column(),
        }
    }
}

/// Information about a panic in a worker thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerPanicInfo {
    /// Panic message, if any.
    pub message: Option<String>,
    /// Panic location.
    pub location: Option<PanicLocation>,
    /// Backtrace captured at the panic site.
    pub backtrace: String,
}

impl Display for WorkerPanicInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => writeln!(f, "panic message: {message}")?,
            None => writeln!(f, "panic message (none)")?,
        }
        match &self.location {
            Some(location) => writeln!(f, "panic location: {location}")?,
            None => writeln!(f, "panic location: unknown")?,
        }
        writeln!(f, "stack trace:\n{}", self.backtrace)
    }
}

impl WorkerPanicInfo {
    /// Assembles panic info from the unwind payload plus whatever the panic
    /// hook captured at the panic site on this thread.
    pub fn from_payload(payload: &(dyn std::any::Any + Send)) -> Self {
        #[allow(clippy::manual_map)]
        let message = if let Some(v) = payload.downcast_ref::<String>() {
            Some(v.clone())
        } else if let Some(v) = payload.downcast_ref::<&str>() {
            Some(v.to_string())
        } else {
            None
        };
        let captured = take_captured();
        Self {
            message,
            location: captured.as_ref().and_then(|c| c.location.clone()),
            backtrace: captured
                .map(|c| c.backtrace)
                .unwrap_or_else(|| "<no backtrace captured>".to_string()),
        }
    }
}

struct CapturedPanic {
    location: Option<PanicLocation>,
    backtrace: String,
}

thread_local! {
    // Filled by the panic hook at the panic site, drained by the worker's
    // catch_unwind handler on the same thread.
    static CAPTURED: RefCell<Option<CapturedPanic>> = const { RefCell::new(None) };
}

fn take_captured() -> Option<CapturedPanic> {
    CAPTURED.with(|slot| slot.borrow_mut().take())
}

/// Stores the default Rust panic hook, so we can invoke it as part of
/// the custom hook on threads that are not engine workers.
#[allow(clippy::type_complexity)]
static DEFAULT_PANIC_HOOK: Lazy<Box<dyn Fn(&PanicHookInfo<'_>) + 'static + Sync + Send>> =
    Lazy::new(|| {
        let _ = panic::take_hook();
        panic::take_hook()
    });

static INSTALL_HOOK: Lazy<()> = Lazy::new(|| {
    let default_hook: &'static _ = &*DEFAULT_PANIC_HOOK;
    panic::set_hook(Box::new(move |panic_info| {
        let is_worker = std::thread::current()
            .name()
            .is_some_and(|name| name.contains("-worker-"));
        if is_worker {
            let captured = CapturedPanic {
                location: panic_info.location().map(PanicLocation::new),
                backtrace: Backtrace::force_capture().to_string(),
            };
            CAPTURED.with(|slot| *slot.borrow_mut() = Some(captured));
        } else {
            default_hook(panic_info);
        }
    }));
});

/// Installs the worker panic hook. Idempotent; called once per process at
/// runtime launch.
pub fn install_panic_hook() {
    Lazy::force(&INSTALL_HOOK);
}
