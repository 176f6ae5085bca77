//! Thin wrapper over `slog` so the rest of the crate can say
//! `logging::debug!(...)` and construct loggers without caring about drains.

pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Root terminal logger for binaries and tests.
pub fn root() -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().expect("terminal logger construction failed")
}

/// A logger that drops everything. The fallback when a component is
/// constructed without one.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
