//! Live monitoring of a single test pass.
//!
//! [`tail`] turns a growing log into parsed lines, [`classifier`] decides
//! which lines fail the pass and which are merely reportable,
//! [`suppression`] loads the branch ignore list, and [`controller`] ties them
//! together into the per-pass state machine.

#![forbid(unsafe_code)]

pub mod classifier;
pub mod controller;
pub mod sink;
pub mod suppression;
pub mod tail;

pub use classifier::{
    Classification, FailureMatch, Reportable, classify, filter_reportable, find_failure,
};
pub use controller::{
    MonitorError, PassController, PassControllerConfig, PassState, PassStats, SuppressionSource,
    TickReport, resolve_outcome,
};
pub use sink::{ClassifiedEvent, EventSink, RecordingSink, TeeSink, TracingSink};
pub use suppression::{SuppressionError, SuppressionList, suppression_path};
pub use tail::{
    FileLogStream, LogStream, LogTailReader, MemoryLog, MemoryLogStream, extract_new_lines,
    parse_line,
};
