//! Leveled, indented progress logging for a deobfuscation run.
//!
//! A [`Logger`] is owned by the caller and handed to the pipeline by reference. It applies
//! the formatting rules of the console output (indentation for detail levels, `ERROR: ` /
//! `WARNING: ` prefixes, per-template duplicate suppression) and forwards every emitted line
//! to the [`log`] facade, so any `log` backend (such as `env_logger`) receives the output.
//! The most recent lines are also kept in memory for inspection.
//!
//! The `deob_*!` macros take a format literal and its arguments. The literal is the
//! duplicate-suppression key, so two errors differing only in their arguments count as
//! duplicates.
//!
//! # Example
//!
//! ```rust
//! use dotscope_deob::deobfuscation::logger::{LogLevel, Logger};
//!
//! let logger = Logger::new();
//! logger.log(LogLevel::Info, "Detected {}", "Detected Babel.NET");
//! logger.indent();
//! logger.log(LogLevel::Verbose, "hidden", "hidden");
//! assert_eq!(logger.history(), vec!["Detected Babel.NET".to_string()]);
//! ```

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Mutex,
    },
};

use dashmap::DashSet;
use strum::{Display, EnumIter};

/// Number of emitted lines kept by [`Logger::history`].
pub const HISTORY_CAPACITY: usize = 1024;

const INDENT_SIZE: usize = 2;

/// Severity of a log message, from most to least important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
pub enum LogLevel {
    /// A failure the user should know about
    #[strum(to_string = "error")]
    Error,
    /// Something unexpected but recoverable
    #[strum(to_string = "warning")]
    Warning,
    /// Normal progress output
    #[strum(to_string = "info")]
    Info,
    /// Detail output
    #[strum(to_string = "verbose")]
    Verbose,
    /// Everything
    #[strum(to_string = "very-verbose")]
    VeryVerbose,
}

impl LogLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Error,
            1 => LogLevel::Warning,
            2 => LogLevel::Info,
            3 => LogLevel::Verbose,
            _ => LogLevel::VeryVerbose,
        }
    }

    /// Parse a level name as printed by `Display`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        use strum::IntoEnumIterator;
        LogLevel::iter().find(|level| level.to_string().eq_ignore_ascii_case(name))
    }
}

/// An explicit logging sink.
///
/// All methods take `&self`; state lives in atomics and concurrent collections so a shared
/// reference can be handed to every stage of a run.
#[derive(Debug)]
pub struct Logger {
    max_level: AtomicU8,
    indent: AtomicUsize,
    can_ignore: bool,
    seen: DashSet<String>,
    ignored: AtomicUsize,
    history: Mutex<VecDeque<String>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// Create a logger at [`LogLevel::Info`] with duplicate suppression on.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(LogLevel::Info, true)
    }

    /// Create a logger with an explicit maximum level and suppression setting.
    #[must_use]
    pub fn with_settings(max_level: LogLevel, can_ignore: bool) -> Self {
        Logger {
            max_level: AtomicU8::new(max_level as u8),
            indent: AtomicUsize::new(0),
            can_ignore,
            seen: DashSet::new(),
            ignored: AtomicUsize::new(0),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// The most detailed level still emitted.
    pub fn max_level(&self) -> LogLevel {
        LogLevel::from_u8(self.max_level.load(Ordering::Relaxed))
    }

    /// Change the most detailed level still emitted.
    pub fn set_max_level(&self, level: LogLevel) {
        self.max_level.store(level as u8, Ordering::Relaxed);
    }

    /// Returns true if messages at `level` are dropped.
    pub fn ignores(&self, level: LogLevel) -> bool {
        level > self.max_level()
    }

    /// Increase indentation by one step.
    pub fn indent(&self) {
        self.indent.fetch_add(INDENT_SIZE, Ordering::Relaxed);
    }

    /// Decrease indentation by one step, never below zero.
    pub fn deindent(&self) {
        let _ = self
            .indent
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| {
                Some(i.saturating_sub(INDENT_SIZE))
            });
    }

    /// Number of error and warning messages dropped as duplicates.
    pub fn ignored_messages(&self) -> usize {
        self.ignored.load(Ordering::Relaxed)
    }

    /// A copy of the retained output lines, oldest first.
    pub fn history(&self) -> Vec<String> {
        match self.history.lock() {
            Ok(history) => history.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Emit `message`, suppressing repeats of `template` at error and warning level.
    pub fn log(&self, level: LogLevel, template: &str, message: &str) {
        self.log_impl(true, level, template, message);
    }

    /// Emit an error even if the same template was already reported.
    pub fn error_dont_ignore(&self, message: &str) {
        self.log_impl(false, LogLevel::Error, message, message);
    }

    fn log_impl(&self, can_ignore: bool, level: LogLevel, template: &str, message: &str) {
        if self.ignores(level) {
            return;
        }

        if can_ignore
            && self.can_ignore
            && level <= LogLevel::Warning
            && !self.seen.insert(template.to_string())
        {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match level {
            LogLevel::Error | LogLevel::Warning => {
                let prefix = if level == LogLevel::Error {
                    "ERROR: "
                } else {
                    "WARNING: "
                };
                for line in message.split('\n') {
                    self.emit(level, format!("{prefix}{line}"));
                }
            }
            _ => {
                let indent = self.indent.load(Ordering::Relaxed);
                self.emit(level, format!("{:indent$}{message}", ""));
            }
        }
    }

    fn emit(&self, level: LogLevel, line: String) {
        match level {
            LogLevel::Error => log::error!("{line}"),
            LogLevel::Warning => log::warn!("{line}"),
            LogLevel::Info => log::info!("{line}"),
            LogLevel::Verbose => log::debug!("{line}"),
            LogLevel::VeryVerbose => log::trace!("{line}"),
        }

        let mut history = match self.history.lock() {
            Ok(history) => history,
            Err(poisoned) => poisoned.into_inner(),
        };
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(line);
    }
}

/// Log an error through a [`Logger`], keyed on the format literal.
macro_rules! deob_error {
    ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $logger.log(
            $crate::deobfuscation::logger::LogLevel::Error,
            $fmt,
            &format!($fmt $(, $arg)*),
        )
    };
}

/// Log a warning through a [`Logger`], keyed on the format literal.
macro_rules! deob_warn {
    ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $logger.log(
            $crate::deobfuscation::logger::LogLevel::Warning,
            $fmt,
            &format!($fmt $(, $arg)*),
        )
    };
}

/// Log progress through a [`Logger`].
macro_rules! deob_info {
    ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $logger.log(
            $crate::deobfuscation::logger::LogLevel::Info,
            $fmt,
            &format!($fmt $(, $arg)*),
        )
    };
}

/// Log detail through a [`Logger`].
macro_rules! deob_verbose {
    ($logger:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $logger.log(
            $crate::deobfuscation::logger::LogLevel::Verbose,
            $fmt,
            &format!($fmt $(, $arg)*),
        )
    };
}
