//! Per-pass state machine.
//!
//! ```text
//! NotStarted --start--> Running --latch/finish/cancel--> Completed
//!                          ^                                |
//!                          +------------start---------------+
//! ```
//!
//! The line cursor belongs to the controller instance and is reset to zero
//! in [`PassController::start`]. Each tick only classifies lines after the
//! cursor and then advances it by the number of lines consumed.

use std::path::PathBuf;

use serde::Serialize;
use soakwatch_common::{
    ErrorCode, ErrorRule, LogLine, PassOutcome, ProcessExit, RetryPolicy, TerminationReason,
    EXIT_CODE_NOT_DIAGNOSTIC,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classifier::{FailureMatch, classify, find_failure};
use crate::sink::{ClassifiedEvent, EventSink};
use crate::suppression::SuppressionList;
use crate::tail::{LogStream, LogTailReader};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("log stream {stream} is unreadable: {source}")]
    LogUnreadable {
        stream: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot {operation} while the pass is {state}")]
    InvalidState {
        operation: &'static str,
        state: PassState,
    },
}

impl MonitorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::LogUnreadable { .. } => ErrorCode::LogUnreadable,
            Self::InvalidState { .. } => ErrorCode::ControllerState,
        }
    }
}

/// Lifecycle of a single pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    NotStarted,
    Running,
    Completed,
}

impl std::fmt::Display for PassState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Where the suppression list for a pass comes from.
#[derive(Debug, Clone, Default)]
pub enum SuppressionSource {
    #[default]
    None,
    Fixed(SuppressionList),
    Branch {
        settings_root: PathBuf,
        branch: String,
    },
}

impl SuppressionSource {
    fn load(&self, policy: &RetryPolicy) -> SuppressionList {
        match self {
            Self::None => SuppressionList::empty(),
            Self::Fixed(list) => list.clone(),
            Self::Branch {
                settings_root,
                branch,
            } => SuppressionList::load_for_branch(settings_root, branch, policy),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PassControllerConfig {
    /// Test scope used for suppression lookups.
    pub scope: String,
    /// Channel to tail; `None` tails every channel.
    pub channel: Option<String>,
    /// Failure rules in priority order.
    pub rules: Vec<ErrorRule>,
    pub suppression: SuppressionSource,
    pub retry: RetryPolicy,
}

/// What one tick observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Lines consumed by this tick.
    pub new_lines: usize,
    pub warnings: usize,
    pub errors: usize,
    pub suppressed: usize,
    /// Failure reason, when a rule latched during this tick.
    pub failure: Option<String>,
    /// Whether the pass is now complete.
    pub completed: bool,
}

/// Running totals for the current pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub lines: usize,
    pub warnings: usize,
    pub errors: usize,
    pub suppressed: usize,
}

/// Drives one pass at a time: tails the log, classifies new lines, and
/// resolves the outcome.
#[derive(Debug)]
pub struct PassController {
    config: PassControllerConfig,
    state: PassState,
    pass: u32,
    reader: Option<LogTailReader>,
    suppressions: SuppressionList,
    cursor: usize,
    failure: Option<FailureMatch>,
    outcome: Option<PassOutcome>,
    stats: PassStats,
}

impl PassController {
    pub fn new(config: PassControllerConfig) -> Self {
        Self {
            config,
            state: PassState::NotStarted,
            pass: 0,
            reader: None,
            suppressions: SuppressionList::empty(),
            cursor: 0,
            failure: None,
            outcome: None,
            stats: PassStats::default(),
        }
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    pub fn pass(&self) -> u32 {
        self.pass
    }

    /// Number of lines already classified in the current pass.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn failure(&self) -> Option<&FailureMatch> {
        self.failure.as_ref()
    }

    pub fn outcome(&self) -> Option<&PassOutcome> {
        self.outcome.as_ref()
    }

    pub fn stats(&self) -> PassStats {
        self.stats
    }

    pub fn suppressions(&self) -> &SuppressionList {
        &self.suppressions
    }

    /// Begin pass `pass` reading from `stream`.
    ///
    /// Resets the cursor and all per-pass state, then loads the suppression
    /// list for this pass.
    pub fn start(&mut self, pass: u32, stream: Box<dyn LogStream>) -> Result<(), MonitorError> {
        if self.state == PassState::Running {
            return Err(MonitorError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        self.pass = pass;
        self.cursor = 0;
        self.failure = None;
        self.outcome = None;
        self.stats = PassStats::default();
        self.suppressions = self.config.suppression.load(&self.config.retry);
        self.reader = Some(LogTailReader::new(stream, self.config.channel.clone()));
        self.state = PassState::Running;

        info!(
            pass,
            scope = %self.config.scope,
            rules = self.config.rules.len(),
            suppressions = self.suppressions.entries().len(),
            "Pass started"
        );
        Ok(())
    }

    /// Classify lines appended since the last tick and emit reportable
    /// events. A latched rule completes the pass.
    pub fn tick(&mut self, sink: &mut dyn EventSink) -> Result<TickReport, MonitorError> {
        match self.state {
            PassState::Running => {}
            PassState::Completed => {
                return Ok(TickReport {
                    completed: true,
                    ..TickReport::default()
                });
            }
            PassState::NotStarted => {
                return Err(MonitorError::InvalidState {
                    operation: "tick",
                    state: self.state,
                });
            }
        }

        let new_lines = self.pull_new_lines(false)?;
        let report = self.consume(&new_lines, sink);
        Ok(report)
    }

    /// Resolve the pass outcome once the process has terminated.
    ///
    /// A latched rule wins regardless of the exit condition. Otherwise the
    /// remaining log is drained and classified, the rules are applied once
    /// more to the whole captured log, and finally the exit condition is
    /// mapped.
    pub fn finish(
        &mut self,
        exit: &ProcessExit,
        sink: &mut dyn EventSink,
    ) -> Result<PassOutcome, MonitorError> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }
        if self.state != PassState::Running {
            return Err(MonitorError::InvalidState {
                operation: "finish",
                state: self.state,
            });
        }

        let remaining = self.pull_new_lines(true)?;
        self.consume(&remaining, sink);
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }

        // Rules apply to every channel of the captured log, not only the tailed one.
        let full_log = self
            .reader
            .as_ref()
            .map(LogTailReader::all_lines)
            .unwrap_or_default();
        let rescan = find_failure(full_log, &self.config.rules);
        if let Some(found) = &rescan {
            debug!(
                pass = self.pass,
                line = found.line.sequence,
                "Failure found in full log rescan"
            );
        }
        let outcome = resolve_outcome(rescan.as_ref(), exit);
        self.failure = rescan;
        Ok(self.complete(outcome, sink))
    }

    /// Stop the pass from outside. The outcome is `TimedOut` unless the pass
    /// already completed.
    pub fn cancel(&mut self, sink: &mut dyn EventSink) -> PassOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        warn!(pass = self.pass, "Pass cancelled");
        self.complete(PassOutcome::timed_out("Pass was cancelled"), sink)
    }

    fn pull_new_lines(&mut self, drain: bool) -> Result<Vec<LogLine>, MonitorError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(MonitorError::InvalidState {
                operation: "read the log",
                state: self.state,
            });
        };
        let result = if drain {
            reader.drain().map(|_| ())
        } else {
            reader.poll().map(|_| ())
        };
        result.map_err(|source| {
            let stream = reader.source();
            warn!(
                pass = self.pass,
                code = %ErrorCode::LogUnreadable.code_string(),
                error = %source,
                "Log stream unreadable"
            );
            MonitorError::LogUnreadable { stream, source }
        })?;
        Ok(reader.lines_since(self.cursor).to_vec())
    }

    fn consume(&mut self, new_lines: &[LogLine], sink: &mut dyn EventSink) -> TickReport {
        let pass = self.pass;
        let classification = classify(
            new_lines,
            &self.config.rules,
            &self.suppressions,
            &self.config.scope,
        );

        self.cursor += new_lines.len();
        self.stats.lines += new_lines.len();

        let mut report = TickReport {
            new_lines: new_lines.len(),
            warnings: classification.warnings.len(),
            errors: classification.errors.len(),
            suppressed: classification.suppressed,
            ..TickReport::default()
        };
        self.stats.warnings += report.warnings;
        self.stats.errors += report.errors;
        self.stats.suppressed += report.suppressed;

        if let Some(failure) = classification.failure {
            let reason = failure.reason();
            info!(
                pass,
                rule = failure.rule_index,
                line = failure.line.sequence,
                "Failure rule latched"
            );
            sink.emit(ClassifiedEvent::Failure {
                pass,
                reason: reason.clone(),
                line: failure.line.clone(),
            });
            self.failure = Some(failure);
            report.failure = Some(reason.clone());
            report.completed = true;
            self.complete(PassOutcome::failed(reason, EXIT_CODE_NOT_DIAGNOSTIC), sink);
            return report;
        }

        let mut events: Vec<(usize, ClassifiedEvent)> = classification
            .warnings
            .into_iter()
            .map(|line| (line.sequence, ClassifiedEvent::Warning { pass, line }))
            .chain(
                classification
                    .errors
                    .into_iter()
                    .map(|line| (line.sequence, ClassifiedEvent::Error { pass, line })),
            )
            .collect();
        events.sort_by_key(|(sequence, _)| *sequence);
        for (_, event) in events {
            sink.emit(event);
        }

        report
    }

    fn complete(&mut self, outcome: PassOutcome, sink: &mut dyn EventSink) -> PassOutcome {
        self.state = PassState::Completed;
        self.outcome = Some(outcome.clone());
        sink.emit(ClassifiedEvent::Completed {
            pass: self.pass,
            outcome: outcome.clone(),
        });
        outcome
    }
}

/// Decide a pass outcome from an optional rule match and the exit condition.
///
/// A rule match always fails the pass with exit code -1, meaning the reason
/// already encodes the cause.
pub fn resolve_outcome(failure: Option<&FailureMatch>, exit: &ProcessExit) -> PassOutcome {
    if let Some(failure) = failure {
        return PassOutcome::failed(failure.reason(), EXIT_CODE_NOT_DIAGNOSTIC);
    }

    match exit.reason {
        TerminationReason::Exited if exit.exit_code == 0 => {
            PassOutcome::passed("Process exited with code 0")
        }
        TerminationReason::Exited => PassOutcome::failed(
            format!("Process exited with code {}", exit.exit_code),
            exit.exit_code,
        ),
        TerminationReason::Crashed => PassOutcome::failed(
            format!("Process crashed (exit code {})", exit.exit_code),
            exit.exit_code,
        ),
        TerminationReason::Stopped => {
            PassOutcome::failed("Process was stopped by the monitor", exit.exit_code)
        }
        TerminationReason::TimedOut => PassOutcome::timed_out("Process exceeded its time limit"),
        TerminationReason::Cancelled => PassOutcome::timed_out("Pass was cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;
    use crate::tail::MemoryLog;
    use soakwatch_common::{PassResult, SuppressionEntry, SuppressionKind};

    fn controller(rules: Vec<ErrorRule>) -> PassController {
        PassController::new(PassControllerConfig {
            scope: "Soak".into(),
            channel: None,
            rules,
            suppression: SuppressionSource::None,
            retry: RetryPolicy::none(),
        })
    }

    fn oom_rule() -> ErrorRule {
        ErrorRule::new(Some("Test"), "OOM", "Client ran out of memory")
    }

    #[test]
    fn test_tick_before_start_is_invalid() {
        let mut c = controller(vec![]);
        let mut sink = RecordingSink::new();
        assert!(matches!(
            c.tick(&mut sink),
            Err(MonitorError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_cursor_advances_and_never_rewinds() {
        let log = MemoryLog::new();
        let mut c = controller(vec![oom_rule()]);
        let mut sink = RecordingSink::new();
        c.start(0, Box::new(log.stream())).unwrap();

        log.append("A: one\nA: Warning: two\nA: thr");
        let report = c.tick(&mut sink).unwrap();
        assert_eq!(report.new_lines, 2);
        assert_eq!(report.warnings, 1);
        assert_eq!(c.cursor(), 2);

        let report = c.tick(&mut sink).unwrap();
        assert_eq!(report.new_lines, 0);
        assert_eq!(c.cursor(), 2);

        log.append("ee\n");
        assert_eq!(c.tick(&mut sink).unwrap().new_lines, 1);
        assert_eq!(c.cursor(), 3);
        assert_eq!(sink.warnings().len(), 1);
    }

    #[test]
    fn test_latched_rule_completes_pass() {
        let log = MemoryLog::new();
        let mut c = controller(vec![oom_rule()]);
        let mut sink = RecordingSink::new();
        c.start(1, Box::new(log.stream())).unwrap();

        log.append_line("Test: Error: OOM detected");
        let report = c.tick(&mut sink).unwrap();
        assert!(report.completed);
        assert_eq!(report.failure.as_deref(), Some("Test Error: Client ran out of memory"));
        assert_eq!(c.state(), PassState::Completed);

        // Exit code 0 does not override the latched rule.
        let outcome = c.finish(&ProcessExit::exited(0), &mut sink).unwrap();
        assert_eq!(outcome.result, PassResult::Failed);
        assert_eq!(outcome.exit_code, EXIT_CODE_NOT_DIAGNOSTIC);
    }

    #[test]
    fn test_finish_rescans_lines_written_after_last_tick() {
        let log = MemoryLog::new();
        let mut c = controller(vec![oom_rule()]);
        let mut sink = RecordingSink::new();
        c.start(0, Box::new(log.stream())).unwrap();
        c.tick(&mut sink).unwrap();

        log.append("Test: Error: OOM at shutdown");
        let outcome = c.finish(&ProcessExit::exited(0), &mut sink).unwrap();
        assert_eq!(outcome.result, PassResult::Failed);
        assert!(outcome.exit_reason.contains("ran out of memory"));
    }

    #[test]
    fn test_finish_applies_rules_to_untailed_channels() {
        let log = MemoryLog::new();
        let mut c = PassController::new(PassControllerConfig {
            scope: "Soak".into(),
            channel: Some("AutoTest".into()),
            rules: vec![ErrorRule::new(None, "Fatal error!", "Client crashed")],
            suppression: SuppressionSource::None,
            retry: RetryPolicy::none(),
        });
        let mut sink = RecordingSink::new();
        c.start(0, Box::new(log.stream())).unwrap();

        log.append_line("AutoTest: checkpoint 1 reached");
        log.append_line("LogCore: Error: Fatal error! access violation");
        let report = c.tick(&mut sink).unwrap();
        // The tick only classifies the tailed channel.
        assert_eq!(report.new_lines, 1);
        assert!(!report.completed);

        let outcome = c.finish(&ProcessExit::exited(0), &mut sink).unwrap();
        assert_eq!(outcome.result, PassResult::Failed);
        assert!(outcome.exit_reason.contains("Client crashed"));
        assert_eq!(c.failure().map(|f| f.line.channel.as_str()), Some("LogCore"));
    }

    #[test]
    fn test_clean_exit_passes_with_unclassified_errors() {
        let log = MemoryLog::new();
        let mut c = controller(vec![oom_rule()]);
        let mut sink = RecordingSink::new();
        c.start(0, Box::new(log.stream())).unwrap();
        log.append_line("LogNet: Error: connection reset");
        c.tick(&mut sink).unwrap();

        let outcome = c.finish(&ProcessExit::exited(0), &mut sink).unwrap();
        assert!(outcome.is_passed());
        assert_eq!(sink.errors().len(), 1);
        assert_eq!(c.stats().errors, 1);
    }

    #[test]
    fn test_exit_mapping() {
        assert_eq!(
            resolve_outcome(None, &ProcessExit::exited(3)).result,
            PassResult::Failed
        );
        assert_eq!(resolve_outcome(None, &ProcessExit::exited(3)).exit_code, 3);
        assert_eq!(
            resolve_outcome(None, &ProcessExit::with_reason(TerminationReason::TimedOut)).result,
            PassResult::TimedOut
        );
        assert_eq!(
            resolve_outcome(None, &ProcessExit::with_reason(TerminationReason::Crashed)).result,
            PassResult::Failed
        );
    }

    #[test]
    fn test_cancel_is_timed_out() {
        let log = MemoryLog::new();
        let mut c = controller(vec![]);
        let mut sink = RecordingSink::new();
        c.start(0, Box::new(log.stream())).unwrap();
        let outcome = c.cancel(&mut sink);
        assert_eq!(outcome.result, PassResult::TimedOut);
        assert_eq!(c.state(), PassState::Completed);
        assert_eq!(c.cancel(&mut sink), outcome);
    }

    #[test]
    fn test_start_resets_cursor_and_reloads_suppressions() {
        let mut c = PassController::new(PassControllerConfig {
            scope: "Soak".into(),
            suppression: SuppressionSource::Fixed(SuppressionList::new(vec![
                SuppressionEntry::new("Soak", SuppressionKind::Warning, "hitch"),
            ])),
            retry: RetryPolicy::none(),
            ..PassControllerConfig::default()
        });
        let mut sink = RecordingSink::new();

        let first = MemoryLog::new();
        c.start(0, Box::new(first.stream())).unwrap();
        first.append("A: Warning: hitch\nA: Warning: other\n");
        let report = c.tick(&mut sink).unwrap();
        assert_eq!(report.suppressed, 1);
        c.finish(&ProcessExit::exited(0), &mut sink).unwrap();
        assert_eq!(c.cursor(), 2);

        let second = MemoryLog::new();
        c.start(1, Box::new(second.stream())).unwrap();
        assert_eq!(c.cursor(), 0);
        assert_eq!(c.state(), PassState::Running);
        assert_eq!(c.suppressions().entries().len(), 1);
    }

    #[test]
    fn test_start_while_running_is_invalid() {
        let log = MemoryLog::new();
        let mut c = controller(vec![]);
        c.start(0, Box::new(log.stream())).unwrap();
        let err = c.start(1, Box::new(log.stream())).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ControllerState);
    }
}
