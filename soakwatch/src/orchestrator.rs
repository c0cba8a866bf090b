//! Multi-pass run orchestration.
//!
//! A run launches the test once per pass, feeds the pass log to a
//! [`PassController`] on a fixed tick, and stages the pass's performance
//! sample when it passes. The run stops at the first pass that does not
//! pass. After the final pass of a run where every pass passed, the
//! performance pipeline merges, reports and exports.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use soakwatch_common::{
    ErrorCode, PassOutcome, PassResult, ProcessExit, SoakwatchConfig, TerminationReason,
};
use soakwatch_monitor::{
    EventSink, LogStream, MonitorError, PassController, PassControllerConfig, SuppressionSource,
};
use soakwatch_perf::{PerfPipeline, PipelineReport};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to launch pass {pass}: {source}")]
    Launch {
        pass: u32,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("first pass {first} is outside a run of {passes} passes")]
    InvalidPassRange { first: u32, passes: u32 },
}

/// A running test process, as seen by the orchestrator.
pub trait MonitoredProcess {
    /// Non-blocking: `Some` once the process has terminated. Deadline
    /// enforcement belongs here; an expired process reports
    /// [`TerminationReason::TimedOut`].
    fn poll_exit(&mut self) -> std::io::Result<Option<ProcessExit>>;

    /// Stop the process. Returns the recorded exit when it already stopped.
    fn terminate(&mut self, reason: TerminationReason) -> std::io::Result<ProcessExit>;
}

/// Everything one launched pass provides.
pub struct LaunchedPass {
    pub process: Box<dyn MonitoredProcess>,
    pub log: Box<dyn LogStream>,
    /// Where the pass leaves its samples and companion log.
    pub artifact_root: PathBuf,
}

/// Starts the test for a pass.
pub trait PassLauncher {
    fn launch(&mut self, pass: u32) -> std::io::Result<LaunchedPass>;
}

/// Run-level settings.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub run_id: Uuid,
    pub passes: u32,
    pub tick_interval: Duration,
}

/// One finished pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassRecord {
    pub pass: u32,
    pub outcome: PassOutcome,
    pub staged: bool,
}

/// Summary of a run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub result: PassResult,
    pub passes: Vec<PassRecord>,
    pub pipeline: Option<PipelineReport>,
}

impl RunReport {
    pub fn is_passed(&self) -> bool {
        self.result == PassResult::Passed
    }

    /// Reason of the pass that decided the run.
    pub fn reason(&self) -> Option<&str> {
        self.passes.last().map(|p| p.outcome.exit_reason.as_str())
    }
}

pub struct RunOrchestrator {
    settings: RunSettings,
    controller: PassController,
    pipeline: PerfPipeline,
    cancel: Arc<AtomicBool>,
}

impl RunOrchestrator {
    pub fn new(
        settings: RunSettings,
        controller: PassControllerConfig,
        pipeline: PerfPipeline,
    ) -> Self {
        Self {
            settings,
            controller: PassController::new(controller),
            pipeline,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(config: &SoakwatchConfig, run_id: Uuid) -> Self {
        let suppression = match &config.suppression.settings_root {
            Some(root) => SuppressionSource::Branch {
                settings_root: root.clone(),
                branch: config.run.branch.clone(),
            },
            None => SuppressionSource::None,
        };
        let controller = PassControllerConfig {
            scope: config.run.scope.clone(),
            channel: config.run.channel.clone(),
            rules: config.rules.clone(),
            suppression,
            retry: config.retry.policy(),
        };
        let settings = RunSettings {
            run_id,
            passes: config.run.passes,
            tick_interval: config.run.tick_interval,
        };
        Self::new(settings, controller, PerfPipeline::from_config(config, run_id))
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Setting the flag cancels the running pass at its next tick.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run every pass.
    pub fn run(
        &mut self,
        launcher: &mut dyn PassLauncher,
        sink: &mut dyn EventSink,
    ) -> Result<RunReport, OrchestratorError> {
        self.run_from(0, launcher, sink)
    }

    /// Run passes `first..passes`. Starting past pass 0 retries the tail of
    /// a run and keeps what earlier passes staged.
    pub fn run_from(
        &mut self,
        first: u32,
        launcher: &mut dyn PassLauncher,
        sink: &mut dyn EventSink,
    ) -> Result<RunReport, OrchestratorError> {
        let passes = self.settings.passes;
        if first >= passes {
            return Err(OrchestratorError::InvalidPassRange { first, passes });
        }
        info!(run_id = %self.settings.run_id, passes, first, "Run started");

        let mut report = RunReport {
            run_id: self.settings.run_id,
            result: PassResult::Passed,
            passes: Vec::new(),
            pipeline: None,
        };

        for pass in first..passes {
            if pass == 0
                && let Err(e) = self.pipeline.collector().reset_staging()
            {
                warn!(
                    code = %ErrorCode::StagingFailed.code_string(),
                    error = %e,
                    "Cannot clear staging area"
                );
            }

            let LaunchedPass {
                mut process,
                log,
                artifact_root,
            } = launcher
                .launch(pass)
                .map_err(|source| OrchestratorError::Launch { pass, source })?;
            let outcome = self.run_pass(pass, process.as_mut(), log, sink)?;

            if !outcome.is_passed() {
                report.result = outcome.result;
                report.passes.push(PassRecord {
                    pass,
                    outcome,
                    staged: false,
                });
                break;
            }

            let staged = match self.pipeline.collector().stage(pass, &artifact_root) {
                Ok(staged) => staged.is_some(),
                Err(e) => {
                    warn!(
                        code = %ErrorCode::StagingFailed.code_string(),
                        pass,
                        error = %e,
                        "Staging failed"
                    );
                    false
                }
            };
            report.passes.push(PassRecord {
                pass,
                outcome,
                staged,
            });

            if pass + 1 == passes {
                report.pipeline = Some(self.pipeline.finalize(Utc::now()));
            }
        }

        info!(
            run_id = %self.settings.run_id,
            result = %report.result,
            passes_run = report.passes.len(),
            "Run finished"
        );
        Ok(report)
    }

    fn run_pass(
        &mut self,
        pass: u32,
        process: &mut dyn MonitoredProcess,
        log: Box<dyn LogStream>,
        sink: &mut dyn EventSink,
    ) -> Result<PassOutcome, OrchestratorError> {
        self.controller.start(pass, log)?;

        let outcome = loop {
            if self.cancel.load(Ordering::SeqCst) {
                if let Err(e) = process.terminate(TerminationReason::Cancelled) {
                    warn!(pass, error = %e, "Failed to stop cancelled process");
                }
                break self.controller.cancel(sink);
            }

            let tick = self.controller.tick(sink)?;
            if tick.completed {
                if let Err(e) = process.terminate(TerminationReason::Stopped) {
                    warn!(pass, error = %e, "Failed to stop process after failure");
                }
                break self
                    .controller
                    .finish(&ProcessExit::with_reason(TerminationReason::Stopped), sink)?;
            }

            match process.poll_exit() {
                Ok(Some(exit)) => {
                    debug!(pass, ?exit, "Process terminated");
                    break self.controller.finish(&exit, sink)?;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(pass, error = %e, "Lost track of the test process");
                    let exit = process
                        .terminate(TerminationReason::Crashed)
                        .unwrap_or(ProcessExit::with_reason(TerminationReason::Crashed));
                    break self.controller.finish(&exit, sink)?;
                }
            }

            sleep(self.settings.tick_interval);
        };

        info!(
            pass,
            result = %outcome.result,
            exit_code = outcome.exit_code,
            reason = %outcome.exit_reason,
            "Pass finished"
        );
        Ok(outcome)
    }
}
