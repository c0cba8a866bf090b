//! Logging setup shared by the soakwatch binaries.
//!
//! ```ignore
//! let mut log_config = LogConfig::from_env("info").with_stderr();
//! if verbose {
//!     log_config = log_config.with_level("debug");
//! }
//! let _guards = init_logging(&log_config)?;
//! ```
//!
//! Environment:
//! - `SOAKWATCH_LOG`: filter directive (overrides the default level)
//! - `SOAKWATCH_LOG_FORMAT`: `pretty`, `compact` or `json`
//! - `SOAKWATCH_LOG_FILE`: also write JSON lines to this file

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("failed to prepare log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `soakwatch_monitor=debug,info`.
    pub filter: String,
    pub format: LogFormat,
    /// Emit console output to stderr instead of stdout.
    pub stderr: bool,
    /// Optional JSON-lines log file.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Build a configuration from `SOAKWATCH_LOG*` variables, falling back to
    /// `default_level`.
    pub fn from_env(default_level: &str) -> Self {
        Self::from_lookup(default_level, |name| std::env::var(name).ok())
    }

    /// Same as [`LogConfig::from_env`] with an explicit variable lookup.
    pub fn from_lookup(default_level: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let filter = lookup("SOAKWATCH_LOG")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());
        let format = lookup("SOAKWATCH_LOG_FORMAT")
            .and_then(|value| LogFormat::parse(&value))
            .unwrap_or_default();
        let file = lookup("SOAKWATCH_LOG_FILE")
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        Self {
            filter,
            format,
            stderr: false,
            file,
        }
    }

    #[must_use]
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: &str) -> Self {
        self.filter = level.to_string();
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_json(self) -> Self {
        self.with_format(LogFormat::Json)
    }

    #[must_use]
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }
}

/// Keeps non-blocking writers flushing until dropped.
#[must_use = "dropping the guards stops log file output"]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global tracing subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let filter =
        EnvFilter::try_new(&config.filter).map_err(|e| LoggingError::InvalidFilter {
            filter: config.filter.clone(),
            message: e.to_string(),
        })?;

    let mut guards = Vec::new();

    let (console_writer, console_guard) = if config.stderr {
        tracing_appender::non_blocking(std::io::stderr())
    } else {
        tracing_appender::non_blocking(std::io::stdout())
    };
    guards.push(console_guard);

    let console_layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(console_writer)
            .with_target(false)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .with_writer(console_writer)
            .with_target(false)
            .compact()
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(console_writer)
            .json()
            .with_current_span(true)
            .boxed(),
    };

    let file_layer = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::LogDir {
                path: dir.to_path_buf(),
                source,
            })?;
            let file_name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "soakwatch.jsonl".into());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(LoggingGuards { _guards: guards })
}
