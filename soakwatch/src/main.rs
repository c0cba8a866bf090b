//! soakwatch - soak test supervisor
//!
//! Runs a test command for a number of passes while classifying its log,
//! stages the performance sample of every passed pass, and after a fully
//! passed run merges the samples into the cache, renders reports and
//! exports them.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use soakwatch::{CommandLauncher, RunOrchestrator};
use soakwatch_common::config::CONFIG_FILE_NAME;
use soakwatch_common::{EnvParser, LogConfig, PassResult, SoakwatchConfig, init_logging};
use soakwatch_monitor::{
    SuppressionList, TracingSink, classify, extract_new_lines, find_failure,
};
use soakwatch_perf::{
    CollectorConfig, ExportMetadata, PerformanceCache, PerformanceSample, RemoteExporter,
    ReportGenerator, SampleCollector, client_from_settings,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "soakwatch")]
#[command(author, version, about = "Soak test supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, env = "SOAKWATCH_CONFIG", default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test command for every configured pass
    Run {
        /// Directory the test leaves its samples and client log in
        #[arg(long)]
        artifacts: PathBuf,

        /// Override the number of passes
        #[arg(long)]
        passes: Option<u32>,

        /// Resume a run at this pass, keeping earlier staged samples
        #[arg(long, default_value = "0")]
        first_pass: u32,

        /// Kill a pass that runs longer than this (e.g. "2h", "90m")
        #[arg(long, value_parser = humantime::parse_duration)]
        max_duration: Option<Duration>,

        /// Test command and its arguments
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },

    /// Classify a captured log against the configured rules
    Classify {
        /// Log file to classify
        log: PathBuf,

        /// Test scope used for suppression lookups
        #[arg(long)]
        scope: Option<String>,
    },

    /// Stage the newest sample of an artifact directory
    Stage {
        #[arg(long)]
        pass: u32,

        #[arg(long)]
        artifacts: PathBuf,
    },

    /// Merge every staged sample into the performance cache
    Merge,

    /// Render the historic reports from the performance cache
    Report {
        /// Platform to report on (defaults to the configured platform)
        #[arg(long)]
        platform: Option<String>,
    },

    /// Export the staged samples
    Export,
}

fn load_config(path: &Path) -> Result<SoakwatchConfig> {
    let mut config = SoakwatchConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config
        .apply_env(&mut EnvParser::new())
        .context("Invalid SOAKWATCH_ environment override")?;
    Ok(config)
}

fn collector(config: &SoakwatchConfig) -> SampleCollector {
    SampleCollector::new(CollectorConfig::from_settings(
        &config.collector,
        config.retry.policy(),
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if cli.json_logs {
        log_config = log_config.with_json();
    }
    let logging_guards = init_logging(&log_config)?;

    let config = load_config(&cli.config)?;
    let code = execute(cli.command, config)?;

    // Flush buffered log output before exiting with the run's status.
    drop(logging_guards);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Run one subcommand. Returns the process exit code.
fn execute(command: Commands, mut config: SoakwatchConfig) -> Result<i32> {
    match command {
        Commands::Run {
            artifacts,
            passes,
            first_pass,
            max_duration,
            command,
        } => {
            if let Some(passes) = passes {
                config.run.passes = passes;
            }
            if max_duration.is_some() {
                config.run.max_duration = max_duration;
            }
            let run_id = Uuid::new_v4();
            let mut launcher = CommandLauncher::new(
                &command,
                &artifacts,
                Path::new(&config.collector.companion_log),
            )?
            .with_max_duration(config.run.max_duration);

            let mut orchestrator = RunOrchestrator::from_config(&config, run_id);
            let report = orchestrator.run_from(first_pass, &mut launcher, &mut TracingSink)?;
            print_json(&report)?;

            Ok(match report.result {
                PassResult::Passed => 0,
                PassResult::Failed => 1,
                PassResult::TimedOut => 2,
            })
        }

        Commands::Classify { log, scope } => {
            let text = std::fs::read_to_string(&log)
                .with_context(|| format!("Failed to read {}", log.display()))?;
            let lines = extract_new_lines(&text, config.run.channel.as_deref(), 0);
            let suppressions = match &config.suppression.settings_root {
                Some(root) => SuppressionList::load_for_branch(
                    root,
                    &config.run.branch,
                    &config.retry.policy(),
                ),
                None => SuppressionList::empty(),
            };
            let scope = scope.unwrap_or_else(|| config.run.scope.clone());
            let mut result = classify(&lines, &config.rules, &suppressions, &scope);
            if result.failure.is_none() {
                result.failure = find_failure(&extract_new_lines(&text, None, 0), &config.rules);
            }

            print_json(&serde_json::json!({
                "lines": lines.len(),
                "warnings": result.warnings,
                "errors": result.errors,
                "suppressed": result.suppressed,
                "failure": result.failure.as_ref().map(|f| f.reason()),
            }))?;
            Ok(i32::from(result.is_failure()))
        }

        Commands::Stage { pass, artifacts } => {
            match collector(&config).stage(pass, &artifacts)? {
                Some(staged) => info!(pass, dir = %staged.dir.display(), "Staged"),
                None => warn!(pass, "Nothing to stage"),
            }
            Ok(0)
        }

        Commands::Merge => {
            let retry = config.retry.policy();
            let staged = collector(&config).staged_samples()?;
            let samples = staged
                .iter()
                .map(|s| {
                    PerformanceSample::load(&s.csv_path, &retry)
                        .map(|sample| sample.with_pass_index(s.pass_index))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let cache = PerformanceCache::open(&config.cache.root, retry)?;
            print_json(&cache.merge(&samples)?)?;
            Ok(0)
        }

        Commands::Report { platform } => {
            let retry = config.retry.policy();
            let platform = platform.unwrap_or_else(|| config.run.platform.clone());
            let cache = PerformanceCache::open(&config.cache.root, retry.clone())?;
            let generator = ReportGenerator::from_settings(&config.report, retry);
            let result = generator.generate_historic(&cache, &platform, Utc::now());
            print_json(&result.generated)?;
            if !result.all_succeeded() {
                let failed: Vec<&str> = result.failed.iter().map(|(n, _)| n.as_str()).collect();
                bail!("Reports failed: {}", failed.join(", "));
            }
            Ok(0)
        }

        Commands::Export => {
            let retry = config.retry.policy();
            let Some(client) = client_from_settings(&config.export, &retry) else {
                bail!("No export endpoint or import directory configured");
            };
            let collector = collector(&config);
            let staged = collector.staged_samples()?;
            let exporter = RemoteExporter::new(
                client,
                ExportMetadata::from_settings(&config.export, Uuid::new_v4()),
                retry,
            );
            let receipt = exporter.export(&staged, collector.staging_root())?;
            info!(entries = receipt.entries, destination = %receipt.target, "Export complete");
            Ok(0)
        }
    }
}
