//! Explicit logger handles
//!
//! Records still go through the `log` facade (and `env_logger` in the binary),
//! but every component owns a `Logger` with its own target and threshold
//! instead of consulting process-wide state.

use log::{Level, LevelFilter};
use std::fmt::Display;

#[derive(Debug, Clone)]
pub struct Logger {
    target: String,
    level: LevelFilter,
}

impl Logger {
    pub fn new(target: impl Into<String>, level: LevelFilter) -> Self {
        Self {
            target: target.into(),
            level,
        }
    }

    /// Logger that never emits anything.
    pub fn silent() -> Self {
        Self::new("ppmi", LevelFilter::Off)
    }

    /// Derive a logger for a sub-component, e.g. `ppmi` -> `ppmi::poller`.
    pub fn child(&self, name: &str) -> Self {
        Self {
            target: format!("{}::{}", self.target, name),
            level: self.level,
        }
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level
    }

    pub fn log(&self, level: Level, message: impl Display) {
        if self.enabled(level) {
            log::log!(target: self.target.as_str(), level, "{}", message);
        }
    }

    pub fn debug(&self, message: impl Display) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: impl Display) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: impl Display) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: impl Display) {
        self.log(Level::Error, message);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("ppmi", LevelFilter::Info)
    }
}

/// Install `env_logger` for the binary. `RUST_LOG` wins over `verbosity`.
pub fn init(verbosity: u8) -> LevelFilter {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    level
}
