//! Structured logging utilities for twincache components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use twincache_config::log_sync_debug;
//!
//! log_sync_debug!("Populating page", object = 7, index = 0);
//! log_file_debug!("Write through to resident page", index = 3);
//! ```

use std::str::FromStr;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const SYNC: &'static str = "SYNC";
    pub const FILE: &'static str = "FILE";
    pub const FLAGS: &'static str = "FLAGS";
    pub const CLI: &'static str = "CLI";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

// === SYNC (dual cache synchronizer) logging macros ===

#[macro_export]
macro_rules! log_sync_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "SYNC", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_sync_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "SYNC", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_sync_trace {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::trace!(component = "SYNC", $($key = $value,)* $msg)
    };
}

// === FILE (entry points) logging macros ===

#[macro_export]
macro_rules! log_file_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "FILE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_file_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "FILE", $($key = $value,)* $msg)
    };
}

// === FLAGS logging macros ===

#[macro_export]
macro_rules! log_flags_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "FLAGS", $($key = $value,)* $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CLI", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cli_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CLI", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup; `TWINCACHE_LOG` and `RUST_LOG`
/// take precedence over `level`.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_env("TWINCACHE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::SYNC, "SYNC");
        assert_eq!(Component::FILE, "FILE");
        assert_eq!(Component::FLAGS, "FLAGS");
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("DEBUG".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Trace.as_filter(), "trace");
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging(LogLevel::Error);
        init_logging(LogLevel::Debug);
        log_sync_debug!("still fine", index = 1u64);
    }
}
