//! Logging initialisation.
//!
//! The protocol core only emits `tracing` events; this module installs the
//! subscriber that turns them into output. `log` records from embedding
//! applications are bridged into `tracing` as well.

use tracing::Level;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::Config;

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level (default: INFO)
    pub level: Level,

    /// Whether to log to stderr (default: true)
    pub log_to_stderr: bool,

    /// Whether to log to a file (default: false)
    pub log_to_file: bool,

    /// Directory to store log files (default: "./logs")
    pub log_dir: String,

    /// Base filename for log files (default: "assuan")
    pub log_file_name: String,

    /// Whether to use JSON format for logs (default: false)
    pub json_format: bool,

    /// Whether to include file and line information (default: false)
    pub include_file_line: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            log_to_stderr: true,
            log_to_file: false,
            log_dir: "./logs".to_string(),
            log_file_name: "assuan".to_string(),
            json_format: false,
            include_file_line: false,
        }
    }
}

/// Parse a textual level, falling back to INFO.
pub fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with the given options.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure file logs are flushed. Output goes to stderr because stdout is
/// frequently the protocol channel of a pipe server.
///
/// # Examples
///
/// ```
/// use assuan_utils::logging::{init_logging, LogOptions};
/// use tracing::Level;
///
/// let options = LogOptions {
///     level: Level::DEBUG,
///     ..Default::default()
/// };
///
/// let _guard = init_logging(options);
/// ```
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    // Bridge `log` crate records into `tracing` so legacy logs are captured
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());

    let mut layers = Vec::new();
    let mut guard = None;

    if options.log_to_stderr {
        let stderr_layer = fmt::layer()
            .with_file(options.include_file_line)
            .with_line_number(options.include_file_line)
            .with_target(true)
            .with_writer(std::io::stderr);

        let stderr_layer = if options.json_format {
            stderr_layer.json().boxed()
        } else {
            stderr_layer.boxed()
        };

        layers.push(stderr_layer);
    }

    if options.log_to_file {
        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, &options.log_dir, &options.log_file_name);

        let (non_blocking, worker_guard) = NonBlocking::new(file_appender);
        guard = Some(worker_guard);

        let file_layer = fmt::layer()
            .with_file(options.include_file_line)
            .with_line_number(options.include_file_line)
            .with_target(true)
            .with_ansi(false)
            .with_writer(non_blocking);

        let file_layer = if options.json_format {
            file_layer.json().boxed()
        } else {
            file_layer.boxed()
        };

        layers.push(file_layer);
    }

    // Set the global subscriber (ignore if already set in this process)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    guard
}

/// Build log options from a loaded configuration.
pub fn options_from_config(config: &Config) -> LogOptions {
    LogOptions {
        level: parse_level(&config.log_level),
        log_to_file: config.logging.log_to_file,
        log_dir: config.logging.log_dir.clone(),
        log_file_name: config.logging.log_file_name.clone(),
        json_format: config.logging.json_format,
        ..Default::default()
    }
}

/// Initialize logging from a configuration.
///
/// # Examples
///
/// ```
/// use assuan_utils::config::Config;
/// use assuan_utils::logging::init_logging_from_config;
///
/// let config = Config::default();
/// let _guard = init_logging_from_config(&config);
/// ```
pub fn init_logging_from_config(config: &Config) -> Option<WorkerGuard> {
    init_logging(options_from_config(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use tracing::{debug, info, warn};

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("TRACE"), Level::TRACE);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.log_level = "debug".to_string();
        config.logging.json_format = true;
        config.logging.log_file_name = "agent".to_string();

        let options = options_from_config(&config);
        assert_eq!(options.level, Level::DEBUG);
        assert!(options.json_format);
        assert!(!options.log_to_file);
        assert_eq!(options.log_file_name, "agent");
    }

    #[test]
    fn test_init_logging() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().to_str().unwrap().to_string();

        let options = LogOptions {
            level: Level::TRACE,
            log_to_stderr: false,
            log_to_file: true,
            log_dir,
            log_file_name: "test.log".to_string(),
            ..Default::default()
        };

        let guard = init_logging(options);
        assert!(guard.is_some());

        debug!("This is a debug message");
        info!("This is an info message");
        warn!("This is a warning message");

        // The rolling appender creates its file eagerly
        let entries = fs::read_dir(dir.path()).unwrap();
        assert!(entries.count() > 0);
    }
}
