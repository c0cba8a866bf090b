//! Soak test supervision.
//!
//! The [`orchestrator`] drives a multi-pass run against any
//! [`PassLauncher`]; [`process`] provides the child-process launcher used by
//! the `soakwatch` binary.

#![forbid(unsafe_code)]

pub mod orchestrator;
pub mod process;

pub use orchestrator::{
    LaunchedPass, MonitoredProcess, OrchestratorError, PassLauncher, PassRecord, RunOrchestrator,
    RunReport, RunSettings,
};
pub use process::{ChildProcess, CommandLauncher};
