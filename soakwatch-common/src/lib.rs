//! Shared types and utilities for soakwatch.
//!
//! Everything the monitor, the performance pipeline and the CLI agree on
//! lives here: the log/outcome data model, the error catalog, configuration
//! loading, logging setup and the bounded retry helper for file operations.

#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod fsutil;
pub mod logging;
pub mod retry;
pub mod types;

pub use config::{ConfigError, EnvError, EnvParser, SoakwatchConfig, expand_path};
pub use errors::{ErrorCategory, ErrorCode, ErrorEntry};
pub use logging::{LogConfig, LogFormat, LoggingError, LoggingGuards, init_logging};
pub use retry::{RetryPolicy, RetryableError, retry_io};
pub use types::{
    DEFAULT_CHANNEL, ENSURE_MARKER, EXIT_CODE_NOT_DIAGNOSTIC, ErrorRule, LogLevel, LogLine,
    PassOutcome, PassResult, ProcessExit, SuppressionEntry, SuppressionKind, TerminationReason,
    is_preflight_build, normalize_platform,
};
