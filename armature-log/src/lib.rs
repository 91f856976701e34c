//! Armature Logging Framework
//!
//! Lightweight logging macros shared by the Armature crates, controlled by
//! environment variables and forwarded to the [`log`] facade so that
//! applications with their own logger still receive every record.
//!
//! # Usage
//!
//! ```rust
//! use armature_log::{debug, info, warn, error, trace};
//!
//! debug!("Processing request");
//! info!("Connected to {} servers", 3);
//! warn!("Connection pool low");
//! error!("Failed to connect");
//!
//! let server = "10.0.0.1:11211";
//! debug!(target: "armature::memcache", "Server {} reconnected", server);
//! ```
//!
//! # Environment Variables
//!
//! - `ARMATURE_DEBUG=1` - Enable debug logging
//! - `ARMATURE_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//! - `ARMATURE_LOG_FORMAT=compact|json` - Set output format
//! - `ARMATURE_LOG_TIMESTAMPS=1|0` - Include timestamps (compact format)

use once_cell::sync::Lazy;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

// ============================================================================
// Log Levels
// ============================================================================

/// Log level for Armature logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Level {
    /// Trace level (most verbose)
    Trace = 0,
    /// Debug level
    Debug = 1,
    /// Info level
    Info = 2,
    /// Warning level
    Warn = 3,
    /// Error level (least verbose)
    Error = 4,
    /// Off (no logging)
    Off = 5,
}

impl Level {
    /// Get level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Off => "OFF",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Level::Trace,
            1 => Level::Debug,
            2 => Level::Info,
            3 => Level::Warn,
            4 => Level::Error,
            _ => Level::Off,
        }
    }

    fn to_log(self) -> Option<log::Level> {
        match self {
            Level::Trace => Some(log::Level::Trace),
            Level::Debug => Some(log::Level::Debug),
            Level::Info => Some(log::Level::Info),
            Level::Warn => Some(log::Level::Warn),
            Level::Error => Some(log::Level::Error),
            Level::Off => None,
        }
    }
}

impl FromStr for Level {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "off" | "none" => Ok(Level::Off),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Single-line `time LEVEL target: message`
    Compact,
    /// One JSON object per line
    Json,
}

impl FromStr for Format {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compact" | "pretty" => Ok(Format::Compact),
            "json" => Ok(Format::Json),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Global Configuration
// ============================================================================

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

static CONFIG: Lazy<LogConfig> = Lazy::new(|| {
    let config = LogConfig::from_env();
    DEBUG_ENABLED.store(config.debug, Ordering::SeqCst);
    LOG_LEVEL.store(config.level as u8, Ordering::SeqCst);
    config
});

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Whether debug mode is enabled
    pub debug: bool,
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether to include timestamps
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: Level::Info,
            format: Format::Json,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Create config from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(default)
        };

        let debug = flag("ARMATURE_DEBUG", false);
        let level = lookup("ARMATURE_LOG_LEVEL")
            .and_then(|s| s.parse().ok())
            .unwrap_or(if debug { Level::Debug } else { Level::Info });
        let format = lookup("ARMATURE_LOG_FORMAT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(Format::Json);

        Self {
            debug,
            level,
            format,
            timestamps: flag("ARMATURE_LOG_TIMESTAMPS", true),
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Initialize the logging system eagerly.
pub fn init() {
    Lazy::force(&CONFIG);
}

/// Check if debug logging is enabled.
#[inline]
pub fn is_debug_enabled() -> bool {
    init();
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Check if a log level is enabled.
#[inline]
pub fn is_level_enabled(level: Level) -> bool {
    init();
    level != Level::Off && level as u8 >= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Get current log level.
pub fn current_level() -> Level {
    init();
    Level::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level at runtime.
pub fn set_level(level: Level) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Enable or disable debug mode at runtime.
pub fn set_debug(enabled: bool) {
    init();
    DEBUG_ENABLED.store(enabled, Ordering::SeqCst);
    if enabled && current_level() > Level::Debug {
        set_level(Level::Debug);
    }
}

/// Get the global configuration.
pub fn config() -> &'static LogConfig {
    &CONFIG
}

// ============================================================================
// Log Output
// ============================================================================

/// Log a message with the given level.
#[doc(hidden)]
pub fn log(level: Level, target: &str, message: &str) {
    let Some(facade_level) = level.to_log() else {
        return;
    };

    capture::record(level, target, message);

    log::log!(target: target, facade_level, "{}", message);

    let config = config();
    match config.format {
        Format::Compact => write_compact(level, target, message, config.timestamps),
        Format::Json => write_json(level, target, message),
    }
}

fn write_compact(level: Level, target: &str, message: &str, timestamps: bool) {
    let mut stderr = std::io::stderr().lock();
    if timestamps {
        let _ = write!(stderr, "{} ", chrono::Local::now().format("%H:%M:%S%.3f"));
    }
    let _ = writeln!(stderr, "{:5} {}: {}", level.as_str(), target, message);
}

#[cfg(feature = "json")]
fn write_json(level: Level, target: &str, message: &str) {
    use serde::Serialize;

    #[derive(Serialize)]
    struct LogEntry<'a> {
        timestamp: String,
        level: &'a str,
        target: &'a str,
        message: &'a str,
    }

    let entry = LogEntry {
        timestamp: chrono::Utc::now().to_rfc3339(),
        level: level.as_str(),
        target,
        message,
    };

    if let Ok(json) = serde_json::to_string(&entry) {
        eprintln!("{}", json);
    }
}

#[cfg(not(feature = "json"))]
fn write_json(level: Level, target: &str, message: &str) {
    // Without serde only the compact form is available.
    write_compact(level, target, message, true);
}

// ============================================================================
// Capture
// ============================================================================

pub mod capture {
    //! In-memory record capture.
    //!
    //! Records are only retained while at least one [`LogCapture`] is alive.
    //! Captures are process wide, so tests running in parallel should match
    //! on something unique to them (a key, a server address).

    use super::Level;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static ACTIVE: AtomicUsize = AtomicUsize::new(0);

    static RECORDS: Lazy<Mutex<Vec<Record>>> = Lazy::new(|| Mutex::new(Vec::new()));

    /// A captured log record.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Record {
        /// Record level
        pub level: Level,
        /// Record target (module path unless overridden)
        pub target: String,
        /// Formatted message
        pub message: String,
    }

    /// Guard that keeps capture enabled for its lifetime.
    #[derive(Debug)]
    pub struct LogCapture {
        _private: (),
    }

    impl LogCapture {
        /// Start capturing records.
        pub fn start() -> Self {
            ACTIVE.fetch_add(1, Ordering::SeqCst);
            Self { _private: () }
        }

        /// Snapshot of every record captured so far.
        pub fn records(&self) -> Vec<Record> {
            lock().clone()
        }

        /// Whether a record at `level` whose message contains `needle` was captured.
        pub fn contains(&self, level: Level, needle: &str) -> bool {
            lock()
                .iter()
                .any(|r| r.level == level && r.message.contains(needle))
        }
    }

    impl Drop for LogCapture {
        fn drop(&mut self) {
            if ACTIVE.fetch_sub(1, Ordering::SeqCst) == 1 {
                lock().clear();
            }
        }
    }

    fn lock() -> std::sync::MutexGuard<'static, Vec<Record>> {
        RECORDS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn record(level: Level, target: &str, message: &str) {
        if ACTIVE.load(Ordering::SeqCst) == 0 {
            return;
        }
        lock().push(Record {
            level,
            target: target.to_string(),
            message: message.to_string(),
        });
    }
}

// ============================================================================
// Macros
// ============================================================================

/// Log a trace message.
#[macro_export]
macro_rules! trace {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Trace) {
            $crate::log($crate::Level::Trace, $target, &format!($($arg)+));
        }
    };
    ($($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Trace) {
            $crate::log($crate::Level::Trace, module_path!(), &format!($($arg)+));
        }
    };
}

/// Log a debug message.
///
/// Enabled by `ARMATURE_DEBUG=1` or `ARMATURE_LOG_LEVEL=debug`.
#[macro_export]
macro_rules! debug {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::is_debug_enabled() || $crate::is_level_enabled($crate::Level::Debug) {
            $crate::log($crate::Level::Debug, $target, &format!($($arg)+));
        }
    };
    ($($arg:tt)+) => {
        if $crate::is_debug_enabled() || $crate::is_level_enabled($crate::Level::Debug) {
            $crate::log($crate::Level::Debug, module_path!(), &format!($($arg)+));
        }
    };
}

/// Log an info message.
#[macro_export]
macro_rules! info {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Info) {
            $crate::log($crate::Level::Info, $target, &format!($($arg)+));
        }
    };
    ($($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Info) {
            $crate::log($crate::Level::Info, module_path!(), &format!($($arg)+));
        }
    };
}

/// Log a warning message.
#[macro_export]
macro_rules! warn {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Warn) {
            $crate::log($crate::Level::Warn, $target, &format!($($arg)+));
        }
    };
    ($($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Warn) {
            $crate::log($crate::Level::Warn, module_path!(), &format!($($arg)+));
        }
    };
}

/// Log an error message.
#[macro_export]
macro_rules! error {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Error) {
            $crate::log($crate::Level::Error, $target, &format!($($arg)+));
        }
    };
    ($($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Error) {
            $crate::log($crate::Level::Error, module_path!(), &format!($($arg)+));
        }
    };
}

// ============================================================================
// Tracing Integration
// ============================================================================

#[cfg(feature = "tracing")]
pub mod tracing_compat {
    //! Tracing subscriber honoring the Armature log level.

    use super::*;

    /// Create a tracing subscriber that respects Armature config.
    pub fn subscriber() -> impl tracing::Subscriber {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::{EnvFilter, fmt};

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(current_level().as_str().to_lowercase()));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Error < Level::Off);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("DEBUG".parse::<Level>(), Ok(Level::Debug));
        assert_eq!("warning".parse::<Level>(), Ok(Level::Warn));
        assert!("loud".parse::<Level>().is_err());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("ARMATURE_DEBUG", "true"),
            ("ARMATURE_LOG_FORMAT", "compact"),
            ("ARMATURE_LOG_TIMESTAMPS", "0"),
        ]
        .into_iter()
        .collect();

        let config = LogConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert!(config.debug);
        assert_eq!(config.level, Level::Debug);
        assert_eq!(config.format, Format::Compact);
        assert!(!config.timestamps);
    }

    #[test]
    fn test_config_defaults() {
        assert_eq!(LogConfig::from_lookup(|_| None), LogConfig::default());
    }

    #[test]
    fn test_capture_records_warnings() {
        let capture = capture::LogCapture::start();
        warn!(target: "armature::test", "capture-probe {}", 7);
        assert!(capture.contains(Level::Warn, "capture-probe 7"));
        assert!(!capture.contains(Level::Error, "capture-probe 7"));
    }

    #[test]
    fn test_off_is_never_enabled() {
        assert!(!is_level_enabled(Level::Off));
    }
}
