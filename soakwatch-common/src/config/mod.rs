//! Configuration for soakwatch.
//!
//! Configuration is read from `soakwatch.toml` (every section optional) and
//! then overridden from `SOAKWATCH_` environment variables:
//!
//! | Variable                  | Field                  |
//! |---------------------------|------------------------|
//! | `SOAKWATCH_PASSES`        | `run.passes`           |
//! | `SOAKWATCH_TICK_INTERVAL` | `run.tick_interval`    |
//! | `SOAKWATCH_BRANCH`        | `run.branch`           |
//! | `SOAKWATCH_PLATFORM`      | `run.platform`         |
//! | `SOAKWATCH_CACHE_ROOT`    | `cache.root`           |
//! | `SOAKWATCH_REPORT_ROOT`   | `report.output_root`   |
//! | `SOAKWATCH_EXPORT`        | `export.enabled`       |
//! | `SOAKWATCH_JOB_ID`        | `export.job_id`        |
//! | `SOAKWATCH_BUILD_NAME`    | `export.build_name`    |

pub mod env;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::errors::ErrorCode;
use crate::retry::RetryPolicy;
use crate::types::{DEFAULT_CHANNEL, ErrorRule, is_preflight_build};

pub use env::{EnvError, EnvParser};

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "soakwatch.toml";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment overrides: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Read { .. } => ErrorCode::ConfigReadError,
            Self::Parse { .. } | Self::Invalid(_) => ErrorCode::ConfigParseError,
            Self::Env(_) => ErrorCode::ConfigEnvError,
        }
    }
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoakwatchConfig {
    pub run: RunConfig,
    /// Failure rules, evaluated in file order.
    pub rules: Vec<ErrorRule>,
    pub suppression: SuppressionConfig,
    pub collector: CollectorSettings,
    pub cache: CacheSettings,
    pub report: ReportSettings,
    pub export: ExportSettings,
    pub retry: RetrySettings,
}

/// `[run]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Number of passes per run.
    pub passes: u32,
    /// How often the log is polled.
    #[serde(with = "duration_str")]
    pub tick_interval: Duration,
    /// Hard limit for one pass; `None` means no limit.
    #[serde(with = "opt_duration_str")]
    pub max_duration: Option<Duration>,
    /// Test scope used to select suppression entries.
    pub scope: String,
    pub branch: String,
    pub platform: String,
    /// Channel the monitor tails; `None` tails every channel.
    pub channel: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            passes: 1,
            tick_interval: Duration::from_secs(1),
            max_duration: None,
            scope: DEFAULT_CHANNEL.to_string(),
            branch: "main".to_string(),
            platform: "Win64".to_string(),
            channel: None,
        }
    }
}

/// `[suppression]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuppressionConfig {
    /// Directory holding `<branch>/IgnoredIssueList.json` files.
    pub settings_root: Option<PathBuf>,
}

/// `[collector]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Directories searched for CSV samples, relative to the artifact root.
    pub candidate_dirs: Vec<PathBuf>,
    /// Token a sample's file name must contain (case-insensitive).
    pub marker: String,
    /// Companion log, relative to the artifact root, staged next to each sample.
    pub companion_log: String,
    pub staging_root: PathBuf,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            candidate_dirs: vec![
                PathBuf::from("Client/Profiling/FPSChartStats"),
                PathBuf::from("Client/Settings/Saved/Profiling/FPSChartStats"),
            ],
            marker: "csvprofile".to_string(),
            companion_log: "Client/ClientOutput.log".to_string(),
            staging_root: std::env::temp_dir().join("soakwatch-staging"),
        }
    }
}

/// `[cache]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub root: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            root: base.join("soakwatch").join("perf-cache"),
        }
    }
}

/// `[report]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    pub output_root: PathBuf,
    /// External renderer invoked as `<cmd> <view.json> <output-dir>`.
    pub renderer_command: Option<Vec<String>>,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("reports"),
            renderer_command: None,
        }
    }
}

/// `[export]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub enabled: bool,
    /// HTTP ingestion endpoint.
    pub endpoint: Option<String>,
    /// Drop directory used when no endpoint is configured.
    pub import_dir: Option<PathBuf>,
    pub job_id: Option<String>,
    pub build_name: String,
    pub data_source: String,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            import_dir: None,
            job_id: None,
            build_name: "local".to_string(),
            data_source: "Automation.Soak.Perf".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl ExportSettings {
    /// Whether the configured build is a preflight build.
    pub fn is_preflight(&self) -> bool {
        is_preflight_build(&self.build_name)
    }
}

/// `[retry]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: u32,
    #[serde(with = "duration_str")]
    pub delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            attempts: policy.max_attempts,
            delay: policy.delay,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, self.delay)
    }
}

impl SoakwatchConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.expand_paths()?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!(path = %path.display(), "Loading configuration");
                Self::from_toml(&text, path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No configuration file, using defaults");
                let mut config = Self::default();
                config.expand_paths()?;
                Ok(config)
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Apply `SOAKWATCH_` overrides. All invalid variables are reported
    /// together.
    pub fn apply_env(&mut self, parser: &mut EnvParser) -> Result<(), ConfigError> {
        if let Some(passes) = parser.get_u32_range("PASSES", 1, 10_000) {
            self.run.passes = passes;
        }
        if let Some(tick) = parser.get_duration("TICK_INTERVAL") {
            self.run.tick_interval = tick;
        }
        if let Some(branch) = parser.get_string("BRANCH") {
            self.run.branch = branch;
        }
        if let Some(platform) = parser.get_string("PLATFORM") {
            self.run.platform = platform;
        }
        if let Some(root) = parser.get_path("CACHE_ROOT") {
            self.cache.root = root;
        }
        if let Some(root) = parser.get_path("REPORT_ROOT") {
            self.report.output_root = root;
        }
        if let Some(enabled) = parser.get_bool("EXPORT") {
            self.export.enabled = enabled;
        }
        if let Some(job) = parser.get_string("JOB_ID") {
            self.export.job_id = Some(job);
        }
        if let Some(build) = parser.get_string("BUILD_NAME") {
            self.export.build_name = build;
        }

        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        self.validate()
    }

    fn expand_paths(&mut self) -> Result<(), ConfigError> {
        let expand = |p: &Path| -> Result<PathBuf, ConfigError> {
            expand_path(&p.to_string_lossy()).map_err(ConfigError::Invalid)
        };

        if let Some(root) = &self.suppression.settings_root {
            self.suppression.settings_root = Some(expand(root)?);
        }
        self.collector.staging_root = expand(&self.collector.staging_root)?;
        self.cache.root = expand(&self.cache.root)?;
        self.report.output_root = expand(&self.report.output_root)?;
        if let Some(dir) = &self.export.import_dir {
            self.export.import_dir = Some(expand(dir)?);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.run.passes == 0 {
            return Err(ConfigError::Invalid("run.passes must be at least 1".into()));
        }
        if self.run.tick_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "run.tick_interval must be non-zero".into(),
            ));
        }
        if self.collector.marker.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "collector.marker must not be empty".into(),
            ));
        }
        if let Some((index, _)) = self
            .rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.match_substring.is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "rules[{index}] has an empty substring"
            )));
        }
        if matches!(&self.report.renderer_command, Some(cmd) if cmd.is_empty()) {
            return Err(ConfigError::Invalid(
                "report.renderer_command must name a program".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `~` and `$VAR` in a path.
pub fn expand_path(raw: &str) -> Result<PathBuf, String> {
    shellexpand::full(raw)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| e.to_string())
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod opt_duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
