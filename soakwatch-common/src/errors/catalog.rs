//! Error catalog for soakwatch.
//!
//! Every failure the monitor or the performance pipeline can surface maps to
//! a stable `SW-Exxx` code with remediation steps, so log lines and CLI
//! output can be grepped and cross-referenced.
//!
//! | Range      | Category    | Description                               |
//! |------------|-------------|-------------------------------------------|
//! | E001-E099  | Config      | Configuration and setup errors            |
//! | E100-E199  | Monitor     | Log tailing and classification            |
//! | E200-E299  | Artifact    | Sample discovery and staging              |
//! | E300-E399  | Store       | Performance cache and report generation   |
//! | E400-E499  | Export      | Remote ingestion                          |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all soakwatch error scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file could not be read
    ConfigReadError,
    /// Configuration file contains invalid TOML
    ConfigParseError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// Suppression list exists but could not be parsed
    SuppressionParseError,

    // =========================================================================
    // Monitor Errors (E100-E199)
    // =========================================================================
    /// A configured failure signature was found in the log
    ClassificationMatch,
    /// Error-level line with no rule and no suppression
    UnclassifiedError,
    /// The monitored log stream cannot be read at all
    LogUnreadable,
    /// Controller operation invoked in the wrong state
    ControllerState,

    // =========================================================================
    // Artifact Errors (E200-E299)
    // =========================================================================
    /// No valid performance sample was produced by a pass
    ArtifactMissing,
    /// A candidate sample was present but had unusable metadata
    ArtifactInvalid,
    /// Copying artifacts into the staging area failed
    StagingFailed,

    // =========================================================================
    // Store Errors (E300-E399)
    // =========================================================================
    /// The performance cache cannot be created or written
    StoreUnavailable,
    /// A line of the cache summary index could not be decoded
    StoreIndexCorrupt,
    /// A report could not be rendered
    ReportFailed,
    /// A file operation failed transiently and exhausted its retries
    TransientIo,

    // =========================================================================
    // Export Errors (E400-E499)
    // =========================================================================
    /// Sample encoding for export failed
    ExportEncodeFailed,
    /// The ingestion endpoint rejected or did not receive the batch
    ExportSubmitFailed,
}

impl ErrorCode {
    /// Returns the numeric code (e.g., 1 for SW-E001).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigReadError => 1,
            Self::ConfigParseError => 2,
            Self::ConfigEnvError => 3,
            Self::SuppressionParseError => 4,

            Self::ClassificationMatch => 100,
            Self::UnclassifiedError => 101,
            Self::LogUnreadable => 102,
            Self::ControllerState => 103,

            Self::ArtifactMissing => 200,
            Self::ArtifactInvalid => 201,
            Self::StagingFailed => 202,

            Self::StoreUnavailable => 300,
            Self::StoreIndexCorrupt => 301,
            Self::ReportFailed => 302,
            Self::TransientIo => 303,

            Self::ExportEncodeFailed => 400,
            Self::ExportSubmitFailed => 401,
        }
    }

    /// Returns the formatted error code string (e.g., "SW-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("SW-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Monitor,
            200..=299 => ErrorCategory::Artifact,
            300..=399 => ErrorCategory::Store,
            _ => ErrorCategory::Export,
        }
    }

    /// Whether the condition can change a pass result.
    ///
    /// Only a classified failure signature or an unreadable log fails a pass;
    /// everything in the performance pipeline is best-effort.
    #[must_use]
    pub const fn affects_pass_result(&self) -> bool {
        matches!(self, Self::ClassificationMatch | Self::LogUnreadable)
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigReadError => "Failed to read configuration file",
            Self::ConfigParseError => "Configuration file contains invalid TOML syntax",
            Self::ConfigEnvError => "Environment variable has invalid value",
            Self::SuppressionParseError => "Suppression list could not be parsed",

            Self::ClassificationMatch => "Known failure signature found in the client log",
            Self::UnclassifiedError => "Client logged an error that matches no rule",
            Self::LogUnreadable => "Client log stream cannot be read",
            Self::ControllerState => "Pass controller used out of order",

            Self::ArtifactMissing => "No valid performance sample was found for the pass",
            Self::ArtifactInvalid => "Performance sample is missing required metadata",
            Self::StagingFailed => "Failed to stage pass artifacts",

            Self::StoreUnavailable => "Performance cache is unavailable",
            Self::StoreIndexCorrupt => "Performance cache index contains an unreadable entry",
            Self::ReportFailed => "Report generation failed",
            Self::TransientIo => "File operation failed after all retries",

            Self::ExportEncodeFailed => "Failed to encode samples for export",
            Self::ExportSubmitFailed => "Failed to submit samples to the ingestion service",
        }
    }

    /// Returns remediation steps for this error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigReadError => &[
                "Check that the file passed with --config exists",
                "Verify file permissions",
            ],
            Self::ConfigParseError => &[
                "Validate the file with a TOML linter",
                "Compare against the documented soakwatch.toml sections",
            ],
            Self::ConfigEnvError => &["Check SOAKWATCH_* environment variables for typos"],
            Self::SuppressionParseError => &[
                "The file must be a JSON array of {scope, kind, pattern} records",
                "kind is one of: ensure, warning, error",
            ],
            Self::ClassificationMatch => &["Inspect the quoted log line and the client log"],
            Self::UnclassifiedError => &[
                "Add an error rule if this should fail the pass",
                "Add a suppression entry if this is a known issue",
            ],
            Self::LogUnreadable => &[
                "Check that the client writes its log where the launcher expects",
                "Verify the log file is readable by the monitor",
            ],
            Self::ControllerState => &["Call start() before tick() or finish()"],
            Self::ArtifactMissing => &[
                "Check that the client was started with CSV profiling enabled",
                "Verify the candidate sample directories in [collector]",
            ],
            Self::ArtifactInvalid => &["Ensure the sample carries at least a platform tag"],
            Self::StagingFailed => &["Check free space and permissions on the staging root"],
            Self::StoreUnavailable => &[
                "Check that the cache root exists or can be created",
                "Verify the volume is mounted and writable",
            ],
            Self::StoreIndexCorrupt => &[
                "The entry is skipped; inspect summary_index.jsonl for a truncated line",
            ],
            Self::ReportFailed => &[
                "Check the renderer command in [report]",
                "Re-run `soakwatch report` once the cause is fixed",
            ],
            Self::TransientIo => &["Check network share availability and retry"],
            Self::ExportEncodeFailed => &["Verify the staged CSV files are intact"],
            Self::ExportSubmitFailed => &[
                "Staged data was kept; re-run `soakwatch export` to resubmit",
                "Check the ingestion endpoint or import directory",
            ],
        }
    }

    /// Returns all error codes.
    #[must_use]
    pub fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigEnvError,
            Self::SuppressionParseError,
            Self::ClassificationMatch,
            Self::UnclassifiedError,
            Self::LogUnreadable,
            Self::ControllerState,
            Self::ArtifactMissing,
            Self::ArtifactInvalid,
            Self::StagingFailed,
            Self::StoreUnavailable,
            Self::StoreIndexCorrupt,
            Self::ReportFailed,
            Self::TransientIo,
            Self::ExportEncodeFailed,
            Self::ExportSubmitFailed,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Configuration and setup errors (E001-E099)
    Config,
    /// Log tailing and classification (E100-E199)
    Monitor,
    /// Sample discovery and staging (E200-E299)
    Artifact,
    /// Performance cache and reports (E300-E399)
    Store,
    /// Remote ingestion (E400-E499)
    Export,
}

impl ErrorCategory {
    /// Returns a human-readable name for the category.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Monitor => "Monitor",
            Self::Artifact => "Artifact",
            Self::Store => "Store",
            Self::Export => "Export",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "SW-E001")
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numbers_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::all() {
            let num = code.code_number();
            assert!(
                seen.insert(num),
                "Duplicate error code number: {} for {:?}",
                num,
                code
            );
        }
    }

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigReadError.code_string(), "SW-E001");
        assert_eq!(ErrorCode::ClassificationMatch.code_string(), "SW-E100");
        assert_eq!(ErrorCode::ArtifactMissing.code_string(), "SW-E200");
        assert_eq!(ErrorCode::StoreUnavailable.code_string(), "SW-E300");
        assert_eq!(ErrorCode::ExportSubmitFailed.code_string(), "SW-E401");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ErrorCode::ConfigEnvError.category(), ErrorCategory::Config);
        assert_eq!(
            ErrorCode::UnclassifiedError.category(),
            ErrorCategory::Monitor
        );
        assert_eq!(ErrorCode::StagingFailed.category(), ErrorCategory::Artifact);
        assert_eq!(ErrorCode::TransientIo.category(), ErrorCategory::Store);
        assert_eq!(
            ErrorCode::ExportEncodeFailed.category(),
            ErrorCategory::Export
        );
    }

    #[test]
    fn test_only_classified_failures_affect_result() {
        let affecting: Vec<_> = ErrorCode::all()
            .iter()
            .filter(|code| code.affects_pass_result())
            .collect();
        assert_eq!(
            affecting,
            vec![&ErrorCode::ClassificationMatch, &ErrorCode::LogUnreadable]
        );
        assert!(!ErrorCode::UnclassifiedError.affects_pass_result());
        assert!(!ErrorCode::StoreUnavailable.affects_pass_result());
    }

    #[test]
    fn test_every_code_has_remediation() {
        for code in ErrorCode::all() {
            assert!(
                !code.remediation().is_empty(),
                "{:?} has no remediation steps",
                code
            );
        }
    }

    #[test]
    fn test_entry_formatting() {
        let entry = ErrorCode::StoreUnavailable.entry();
        assert_eq!(entry.format_brief(), "[SW-E300] Performance cache is unavailable");
        let full = entry.format_full();
        assert!(full.contains("Remediation steps:"));
        assert!(full.contains("1. Check that the cache root"));
    }
}
