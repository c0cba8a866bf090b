//! Bounded retry for file-system operations.
//!
//! Cache directories and staging areas frequently live on network shares
//! where reads and writes fail transiently. Every file operation in the
//! pipeline goes through [`retry_io`]: a fixed number of attempts with a fixed
//! delay, then the last error is handed back for the caller to log.

use std::io;
use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, warn};

/// Errors that can be retried.
pub trait RetryableError {
    /// Whether this error is worth another attempt.
    fn is_retryable(&self) -> bool;
}

impl RetryableError for io::Error {
    fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
                | io::ErrorKind::ResourceBusy
                | io::ErrorKind::StaleNetworkFileHandle
                | io::ErrorKind::Other
        )
    }
}

/// Retry policy for file operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts including the first try (minimum 1).
    pub max_attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted.
pub fn retry_io<T, E, F>(operation: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: RetryableError + std::fmt::Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match op() {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "File operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                debug!(
                    operation,
                    attempt,
                    max_attempts,
                    error = %err,
                    delay_ms = policy.delay.as_millis() as u64,
                    "File operation failed, retrying"
                );
                if !policy.delay.is_zero() {
                    sleep(policy.delay);
                }
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(operation, attempt, error = %err, "All retries exhausted");
                }
                return Err(err);
            }
        }
    }
}
