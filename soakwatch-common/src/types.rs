//! Common types used across soakwatch components.

use serde::{Deserialize, Serialize};

/// Channel assigned to lines that carry no recognised `<Channel>: ` prefix.
pub const DEFAULT_CHANNEL: &str = "default";

/// Exit code meaning "the reason string already encodes the cause".
pub const EXIT_CODE_NOT_DIAGNOSTIC: i32 = -1;

/// Text the instrumented client prints when an ensure/assertion fires.
pub const ENSURE_MARKER: &str = "Ensure condition failed";

/// Severity of a single log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Map a level token from the line prefix (`Error`, `Warning`, `Display`, ...).
    ///
    /// Returns `None` for tokens that are not levels, in which case the token is
    /// part of the message text.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "Error" | "Fatal" => Some(Self::Error),
            "Warning" => Some(Self::Warning),
            "Display" | "Log" | "Verbose" | "VeryVerbose" => Some(Self::Info),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "Info"),
            Self::Warning => write!(f, "Warning"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// One line extracted from the monitored process's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub channel: String,
    pub level: LogLevel,
    pub text: String,
    /// Zero-based line number within the whole stream.
    pub sequence: usize,
}

impl LogLine {
    /// Whether this line reports a fired ensure.
    pub fn is_ensure(&self) -> bool {
        self.level == LogLevel::Error && self.text.contains(ENSURE_MARKER)
    }
}

/// A known failure signature with the message to report when it is seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRule {
    /// Channel the error must be logged on. `None` matches any channel.
    #[serde(default, alias = "category")]
    pub match_category: Option<String>,
    #[serde(alias = "substring")]
    pub match_substring: String,
    #[serde(alias = "message")]
    pub user_message: String,
    /// Quote the offending line in the failure reason.
    #[serde(default)]
    pub verbose: bool,
}

impl ErrorRule {
    pub fn new(
        category: Option<&str>,
        substring: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            match_category: category.map(str::to_string),
            match_substring: substring.into(),
            user_message: message.into(),
            verbose: false,
        }
    }

    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Whether this rule matches the given line. Only Error lines can match.
    pub fn matches(&self, line: &LogLine) -> bool {
        if line.level != LogLevel::Error {
            return false;
        }
        if let Some(category) = &self.match_category
            && category != &line.channel
        {
            return false;
        }
        line.text.contains(&self.match_substring)
    }
}

/// Which class of reportable message a suppression entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuppressionKind {
    Ensure,
    Warning,
    Error,
}

/// A known, accepted issue that must not be surfaced for a given test scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionEntry {
    /// Test identifier the entry applies to; `*` applies to every scope.
    pub scope: String,
    pub kind: SuppressionKind,
    pub pattern: String,
}

impl SuppressionEntry {
    pub fn new(
        scope: impl Into<String>,
        kind: SuppressionKind,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            kind,
            pattern: pattern.into(),
        }
    }

    pub fn applies_to_scope(&self, scope: &str) -> bool {
        self.scope == "*" || self.scope == scope
    }
}

/// Terminal result of a single pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassResult {
    Passed,
    Failed,
    TimedOut,
}

impl std::fmt::Display for PassResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Outcome of one pass, immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassOutcome {
    pub result: PassResult,
    pub exit_reason: String,
    pub exit_code: i32,
}

impl PassOutcome {
    pub fn passed(reason: impl Into<String>) -> Self {
        Self {
            result: PassResult::Passed,
            exit_reason: reason.into(),
            exit_code: 0,
        }
    }

    pub fn failed(reason: impl Into<String>, exit_code: i32) -> Self {
        Self {
            result: PassResult::Failed,
            exit_reason: reason.into(),
            exit_code,
        }
    }

    pub fn timed_out(reason: impl Into<String>) -> Self {
        Self {
            result: PassResult::TimedOut,
            exit_reason: reason.into(),
            exit_code: EXIT_CODE_NOT_DIAGNOSTIC,
        }
    }

    pub fn is_passed(&self) -> bool {
        self.result == PassResult::Passed
    }
}

/// Why the monitored process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The process exited on its own.
    Exited,
    /// The process was killed by a signal or aborted.
    Crashed,
    /// The process exceeded its deadline.
    TimedOut,
    /// The run was cancelled from outside.
    Cancelled,
    /// The monitor stopped the process after a failure latched.
    Stopped,
}

/// Termination signal delivered by the process collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub exit_code: i32,
    pub reason: TerminationReason,
}

impl ProcessExit {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            reason: TerminationReason::Exited,
        }
    }

    pub fn with_reason(reason: TerminationReason) -> Self {
        Self {
            exit_code: EXIT_CODE_NOT_DIAGNOSTIC,
            reason,
        }
    }
}

/// Map a build platform name to the name instrumented clients record in
/// their samples. `Win64` is written as `Windows` by the CSV profiler.
pub fn normalize_platform(platform: &str) -> String {
    match platform.trim() {
        p if p.eq_ignore_ascii_case("win64") => "Windows".to_string(),
        p => p.to_string(),
    }
}

/// Whether a build name identifies a preflight (pre-submit) build.
pub fn is_preflight_build(build_name: &str) -> bool {
    let upper = build_name.to_ascii_uppercase();
    upper.contains("PF-") || upper.ends_with("-PF") || upper.contains("PREFLIGHT")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(channel: &str, level: LogLevel, text: &str) -> LogLine {
        LogLine {
            channel: channel.to_string(),
            level,
            text: text.to_string(),
            sequence: 0,
        }
    }

    #[test]
    fn test_level_tokens() {
        assert_eq!(LogLevel::from_token("Error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_token("Fatal"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_token("Warning"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::from_token("Display"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_token("AutoTest failure"), None);
    }

    #[test]
    fn test_rule_requires_error_level() {
        let rule = ErrorRule::new(Some("Test"), "OOM", "Out of memory");
        assert!(rule.matches(&line("Test", LogLevel::Error, "OOM detected")));
        assert!(!rule.matches(&line("Test", LogLevel::Warning, "OOM detected")));
    }

    #[test]
    fn test_rule_category_filter() {
        let rule = ErrorRule::new(Some("Test"), "OOM", "Out of memory");
        assert!(!rule.matches(&line("Render", LogLevel::Error, "OOM detected")));

        let any = ErrorRule::new(None, "OOM", "Out of memory");
        assert!(any.matches(&line("Render", LogLevel::Error, "OOM detected")));
    }

    #[test]
    fn test_ensure_detection() {
        assert!(line("Core", LogLevel::Error, "Ensure condition failed: ptr").is_ensure());
        assert!(!line("Core", LogLevel::Warning, "Ensure condition failed: ptr").is_ensure());
        assert!(!line("Core", LogLevel::Error, "plain error").is_ensure());
    }

    #[test]
    fn test_suppression_scope_wildcard() {
        let entry = SuppressionEntry::new("*", SuppressionKind::Warning, "shader");
        assert!(entry.applies_to_scope("AutoTest"));
        let scoped = SuppressionEntry::new("AutoTest", SuppressionKind::Warning, "shader");
        assert!(scoped.applies_to_scope("AutoTest"));
        assert!(!scoped.applies_to_scope("MemoryReport"));
    }

    #[test]
    fn test_normalize_platform() {
        assert_eq!(normalize_platform("Win64"), "Windows");
        assert_eq!(normalize_platform("win64"), "Windows");
        assert_eq!(normalize_platform("Linux"), "Linux");
    }

    #[test]
    fn test_preflight_detection() {
        assert!(is_preflight_build("++Main-CL-1234-PF-5678"));
        assert!(is_preflight_build("build-1234-pf"));
        assert!(!is_preflight_build("++Main-CL-1234"));
    }

    #[test]
    fn test_outcome_constructors() {
        assert!(PassOutcome::passed("ok").is_passed());
        let failed = PassOutcome::failed("boom", EXIT_CODE_NOT_DIAGNOSTIC);
        assert_eq!(failed.result, PassResult::Failed);
        assert_eq!(failed.exit_code, -1);
        assert_eq!(PassOutcome::timed_out("slow").exit_code, -1);
    }

    #[test]
    fn test_rule_deserializes_short_names() {
        let rule: ErrorRule = serde_json::from_str(
            r#"{"category":"AutoTest","substring":"AutoTest","message":"AutoTest failure:","verbose":true}"#,
        )
        .unwrap();
        assert_eq!(rule.match_category.as_deref(), Some("AutoTest"));
        assert!(rule.verbose);
    }
}
