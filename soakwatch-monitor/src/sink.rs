//! Destinations for classified events.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use soakwatch_common::{ErrorCode, LogLine, PassOutcome};
use tracing::{error, info, warn};

/// An event surfaced while a pass runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClassifiedEvent {
    /// A warning that survived suppression.
    Warning { pass: u32, line: LogLine },
    /// An error that survived suppression and matched no rule.
    Error { pass: u32, line: LogLine },
    /// A rule latched; the pass is failing.
    Failure {
        pass: u32,
        reason: String,
        line: LogLine,
    },
    /// The pass reached its terminal outcome.
    Completed { pass: u32, outcome: PassOutcome },
}

/// Receives classified events as soon as they are produced.
pub trait EventSink {
    fn emit(&mut self, event: ClassifiedEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&mut self, event: ClassifiedEvent) {
        match event {
            ClassifiedEvent::Warning { pass, line } => {
                warn!(pass, channel = %line.channel, line = line.sequence, "{}", line.text);
            }
            // Unclassified errors are report items; only a rule match fails a pass.
            ClassifiedEvent::Error { pass, line } => {
                warn!(
                    pass,
                    code = %ErrorCode::UnclassifiedError.code_string(),
                    channel = %line.channel,
                    line = line.sequence,
                    "{}",
                    line.text
                );
            }
            ClassifiedEvent::Failure { pass, reason, line } => {
                error!(
                    pass,
                    code = %ErrorCode::ClassificationMatch.code_string(),
                    channel = %line.channel,
                    line = line.sequence,
                    "{reason}"
                );
            }
            ClassifiedEvent::Completed { pass, outcome } => {
                info!(
                    pass,
                    result = %outcome.result,
                    exit_code = outcome.exit_code,
                    reason = %outcome.exit_reason,
                    "Pass completed"
                );
            }
        }
    }
}

/// Keeps every event in memory. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<ClassifiedEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ClassifiedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn warnings(&self) -> Vec<LogLine> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ClassifiedEvent::Warning { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<LogLine> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ClassifiedEvent::Error { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: ClassifiedEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

/// Sends every event to both sinks.
pub struct TeeSink<'a> {
    first: &'a mut dyn EventSink,
    second: &'a mut dyn EventSink,
}

impl<'a> TeeSink<'a> {
    pub fn new(first: &'a mut dyn EventSink, second: &'a mut dyn EventSink) -> Self {
        Self { first, second }
    }
}

impl EventSink for TeeSink<'_> {
    fn emit(&mut self, event: ClassifiedEvent) {
        self.first.emit(event.clone());
        self.second.emit(event);
    }
}
