//! Standardized logging utility for Wawona Wire
//!
//! Diagnostics about individual clients (protocol violations, teardown
//! reasons) go through a [`LogHandler`] owned by the display instead of a
//! process-wide hook. The `wlog!` macro formats a message and hands it to
//! such a handler.

use std::fmt;

use tracing::Level;

#[macro_export]
macro_rules! wlog {
    ($logger:expr, $level:expr, $module:expr, $($arg:tt)*) => {{
        $logger.log($level, $module, format_args!($($arg)*))
    }};
}

/// Standardized module identifiers
pub const DISPLAY: &str = "DISPLAY";
pub const CLIENT: &str = "CLIENT";
pub const SOCKET: &str = "SOCKET";

/// Sink for runtime diagnostics, injected into a display at construction.
pub trait LogHandler {
    fn log(&self, level: Level, module: &str, message: fmt::Arguments<'_>);
}

/// Forwards to the `tracing` subscriber of the process. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl LogHandler for TracingLog {
    fn log(&self, level: Level, module: &str, message: fmt::Arguments<'_>) {
        match level {
            Level::ERROR => tracing::error!(module, "{}", message),
            Level::WARN => tracing::warn!(module, "{}", message),
            Level::INFO => tracing::info!(module, "{}", message),
            Level::DEBUG => tracing::debug!(module, "{}", message),
            _ => tracing::trace!(module, "{}", message),
        }
    }
}

/// Writes `YYYY-MM-DD HH:MM:SS [MODULE] Message` lines to stderr.
#[derive(Debug, Clone, Copy)]
pub struct StderrLog {
    pub min_level: Level,
}

impl Default for StderrLog {
    fn default() -> Self {
        Self { min_level: Level::INFO }
    }
}

impl StderrLog {
    pub fn format_line(module: &str, message: fmt::Arguments<'_>) -> String {
        let now = chrono::Local::now();
        format!("{} [{}] {}", now.format("%Y-%m-%d %H:%M:%S"), module, message)
    }
}

impl LogHandler for StderrLog {
    fn log(&self, level: Level, module: &str, message: fmt::Arguments<'_>) {
        // tracing orders levels by verbosity: ERROR < TRACE
        if level <= self.min_level {
            eprintln!("{}", Self::format_line(module, message));
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Keeps every line for assertions.
    #[derive(Debug, Default)]
    pub struct MemoryLog {
        pub lines: RefCell<Vec<(Level, String, String)>>,
    }

    impl MemoryLog {
        pub fn contains(&self, needle: &str) -> bool {
            self.lines.borrow().iter().any(|(_, _, line)| line.contains(needle))
        }
    }

    impl LogHandler for MemoryLog {
        fn log(&self, level: Level, module: &str, message: fmt::Arguments<'_>) {
            self.lines
                .borrow_mut()
                .push((level, module.to_string(), message.to_string()));
        }
    }
}
