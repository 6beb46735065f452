//! Logging for the robotline console
//!
//! Everything goes to a daily-rolling file in the log directory (the XDG
//! state dir unless `[logging] directory` is set). Chatter from the HTTP
//! stack is capped at `warn` so session events stay readable. When
//! `[logging] stderr_level` is set, events at that level and above are also
//! echoed to stderr, which is handy while following `robotline watch`.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Prefix of the rolling log files
pub const LOG_FILE_PREFIX: &str = "robotline.log";

/// Dependencies that log every request at `info`/`debug`
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

/// Set up the global subscriber. Keep the guard alive until exit.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(config.max_files.max(1))
        .build(&log_dir)
        .map_err(|e| Error::Config(format!("failed to create log file: {}", e)))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => session_filter(&config.level)?,
    };

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stderr_layer = match config.stderr_level.as_deref() {
        Some(level) => Some(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(stderr_filter(level)?),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        stderr = config.stderr_level.as_deref().unwrap_or("off"),
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Filter for `level` with the HTTP stack held at `warn`.
///
/// `level` may be a bare level or a full directive list such as
/// `robotline_core::session=debug,info`.
pub fn session_filter(level: &str) -> Result<EnvFilter> {
    let mut directives = level.trim().to_string();
    if directives.is_empty() {
        return Err(Error::Config("logging.level must not be empty".to_string()));
    }
    for target in QUIET_TARGETS {
        directives.push_str(&format!(",{}=warn", target));
    }
    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Config(format!("invalid logging.level {:?}: {}", level, e)))
}

fn stderr_filter(level: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(level.trim())
        .map_err(|_| Error::Config(format!("invalid logging.stderr_level {:?}", level)))
}

/// Check both level settings without installing anything.
pub fn validate(config: &LoggingConfig) -> Result<()> {
    session_filter(&config.level)?;
    if let Some(level) = config.stderr_level.as_deref() {
        stderr_filter(level)?;
    }
    Ok(())
}

/// Initialize logging for tests (logs to the test writer)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Flushes pending log writes when dropped
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Path of the current log file for `config`
pub fn log_file_path(config: &LoggingConfig) -> PathBuf {
    log_file_in(&config.log_dir())
}

fn log_file_in(dir: &Path) -> PathBuf {
    dir.join(LOG_FILE_PREFIX)
}
