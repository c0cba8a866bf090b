//! Child-process adapter for the orchestrator.
//!
//! [`CommandLauncher`] starts the configured test command once per pass with
//! stdout and stderr redirected into the pass log, and [`ChildProcess`] maps
//! its termination to a [`ProcessExit`].

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use soakwatch_common::{ProcessExit, TerminationReason};
use soakwatch_monitor::FileLogStream;
use tracing::{debug, info, warn};

use crate::orchestrator::{LaunchedPass, MonitoredProcess, PassLauncher};

/// Environment variable carrying the pass index into the test process.
pub const PASS_ENV: &str = "SOAKWATCH_PASS";
/// Environment variable carrying the artifact root into the test process.
pub const ARTIFACT_ENV: &str = "SOAKWATCH_ARTIFACT_ROOT";

fn exit_from_status(status: ExitStatus) -> ProcessExit {
    match status.code() {
        Some(code) => ProcessExit::exited(code),
        None => ProcessExit::with_reason(TerminationReason::Crashed),
    }
}

/// A spawned test process with an optional deadline.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    started: Instant,
    max_duration: Option<Duration>,
    exit: Option<ProcessExit>,
}

impl ChildProcess {
    pub fn new(child: Child, max_duration: Option<Duration>) -> Self {
        Self {
            child,
            started: Instant::now(),
            max_duration,
            exit: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl MonitoredProcess for ChildProcess {
    fn poll_exit(&mut self) -> io::Result<Option<ProcessExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        if let Some(status) = self.child.try_wait()? {
            let exit = exit_from_status(status);
            self.exit = Some(exit);
            return Ok(Some(exit));
        }
        if let Some(limit) = self.max_duration
            && self.started.elapsed() >= limit
        {
            warn!(
                pid = self.child.id(),
                limit = %humantime::format_duration(limit),
                "Test process exceeded its time limit"
            );
            return self.terminate(TerminationReason::TimedOut).map(Some);
        }
        Ok(None)
    }

    fn terminate(&mut self, reason: TerminationReason) -> io::Result<ProcessExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        match self.child.kill() {
            Ok(()) => {}
            // Already exited but not yet reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        self.child.wait()?;
        debug!(pid = self.child.id(), ?reason, "Test process stopped");
        let exit = ProcessExit::with_reason(reason);
        self.exit = Some(exit);
        Ok(exit)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Launches `program args...` for each pass.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    artifact_root: PathBuf,
    /// Pass log, relative to the artifact root.
    log_file: PathBuf,
    max_duration: Option<Duration>,
}

impl CommandLauncher {
    pub fn new(command: &[String], artifact_root: &Path, log_file: &Path) -> io::Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no test command given")
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            artifact_root: artifact_root.to_path_buf(),
            log_file: log_file.to_path_buf(),
            max_duration: None,
        })
    }

    #[must_use]
    pub fn with_max_duration(mut self, max_duration: Option<Duration>) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn log_path(&self) -> PathBuf {
        self.artifact_root.join(&self.log_file)
    }
}

impl PassLauncher for CommandLauncher {
    fn launch(&mut self, pass: u32) -> io::Result<LaunchedPass> {
        let log_path = self.log_path();
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Each pass starts from an empty log.
        let stdout = File::create(&log_path)?;
        let stderr = stdout.try_clone()?;

        let child = Command::new(&self.program)
            .args(&self.args)
            .env(PASS_ENV, pass.to_string())
            .env(ARTIFACT_ENV, &self.artifact_root)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()?;
        info!(
            pass,
            pid = child.id(),
            program = %self.program,
            log = %log_path.display(),
            "Launched test process"
        );

        Ok(LaunchedPass {
            process: Box::new(ChildProcess::new(child, self.max_duration)),
            log: Box::new(FileLogStream::new(&log_path)),
            artifact_root: self.artifact_root.clone(),
        })
    }
}
