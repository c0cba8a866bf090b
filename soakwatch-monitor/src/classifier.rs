//! Two-phase classification of log lines.
//!
//! Phase 1 ([`find_failure`]) scans error lines in order against the rule list
//! and latches on the first match. Phase 2 ([`filter_reportable`]) only runs
//! when nothing latched: it drops suppressed warnings and errors and returns
//! the rest for reporting. Errors that match no rule are reported but never
//! fail a pass.

use serde::Serialize;
use soakwatch_common::{ErrorRule, LogLevel, LogLine};

use crate::suppression::SuppressionList;

/// Prefix of every rule-derived failure reason.
pub const FAILURE_REASON_PREFIX: &str = "Test Error:";

/// The rule and line that decided a pass failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureMatch {
    /// Position of the rule in the configured list.
    pub rule_index: usize,
    pub rule: ErrorRule,
    pub line: LogLine,
}

impl FailureMatch {
    /// Human-readable failure reason. Verbose rules quote the offending line.
    pub fn reason(&self) -> String {
        if self.rule.verbose {
            format!(
                "{FAILURE_REASON_PREFIX} {} \"{}\"",
                self.rule.user_message, self.line.text
            )
        } else {
            format!("{FAILURE_REASON_PREFIX} {}", self.rule.user_message)
        }
    }
}

/// Warnings and errors that survived suppression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reportable {
    pub warnings: Vec<LogLine>,
    pub errors: Vec<LogLine>,
    /// Lines dropped by a suppression entry.
    pub suppressed: usize,
}

/// Result of classifying a batch of lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub warnings: Vec<LogLine>,
    pub errors: Vec<LogLine>,
    pub suppressed: usize,
    pub failure: Option<FailureMatch>,
}

impl Classification {
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Phase 1: the first error line (in sequence order) matched by any rule.
///
/// For each line the rules are tried in configured order, so when several
/// rules match the same line the earliest rule wins.
pub fn find_failure(lines: &[LogLine], rules: &[ErrorRule]) -> Option<FailureMatch> {
    lines
        .iter()
        .filter(|line| line.level == LogLevel::Error)
        .find_map(|line| {
            rules
                .iter()
                .position(|rule| rule.matches(line))
                .map(|rule_index| FailureMatch {
                    rule_index,
                    rule: rules[rule_index].clone(),
                    line: line.clone(),
                })
        })
}

/// Phase 2: warnings and errors not suppressed for `scope`.
pub fn filter_reportable(
    lines: &[LogLine],
    suppressions: &SuppressionList,
    scope: &str,
) -> Reportable {
    let mut out = Reportable::default();
    for line in lines {
        let bucket = match line.level {
            LogLevel::Warning => &mut out.warnings,
            LogLevel::Error => &mut out.errors,
            LogLevel::Info => continue,
        };
        if suppressions.is_suppressed(scope, line) {
            out.suppressed += 1;
        } else {
            bucket.push(line.clone());
        }
    }
    out
}

/// Run both phases. Suppression filtering is skipped once a rule latched.
pub fn classify(
    lines: &[LogLine],
    rules: &[ErrorRule],
    suppressions: &SuppressionList,
    scope: &str,
) -> Classification {
    if let Some(failure) = find_failure(lines, rules) {
        return Classification {
            failure: Some(failure),
            ..Classification::default()
        };
    }

    let reportable = filter_reportable(lines, suppressions, scope);
    Classification {
        warnings: reportable.warnings,
        errors: reportable.errors,
        suppressed: reportable.suppressed,
        failure: None,
    }
}
