//! Report rendering.
//!
//! Every report is rendered from an [`AggregatedView`]. The detailed report
//! covers the samples staged by the current run; the historic reports cover
//! the cache through the named [`HistoricWindow`]s. Reports land in
//! `<output_root>/<platform>/`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::Serialize;
use soakwatch_common::fsutil::{ensure_dir, write_atomic};
use soakwatch_common::{ErrorCode, RetryPolicy, RetryableError, normalize_platform, retry_io};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{AggregatedView, CacheError, HistoricWindow, PerformanceCache, TimeWindowFilter};
use crate::sample::SampleSummary;

pub const DETAILED_REPORT_NAME: &str = "DetailedReport";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode report view: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to start renderer {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("renderer {program} exited with {status:?}: {stderr}")]
    Renderer {
        program: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("renderer command is empty")]
    EmptyCommand,

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ReportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Cache(e) => e.code(),
            _ => ErrorCode::ReportFailed,
        }
    }
}

impl RetryableError for ReportError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Io { source, .. } => source.is_retryable(),
            Self::Renderer { .. } => true,
            Self::Cache(e) => e.is_retryable(),
            Self::Encode(_) | Self::Spawn { .. } | Self::EmptyCommand => false,
        }
    }
}

/// Turns a view into report files inside `out_dir`.
pub trait ReportRenderer: Send + Sync {
    fn render(
        &self,
        name: &str,
        view: &AggregatedView,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, ReportError>;
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    name: &'a str,
    generated_at: DateTime<Utc>,
    #[serde(flatten)]
    view: &'a AggregatedView,
}

fn write_view_json(
    name: &str,
    view: &AggregatedView,
    out_dir: &Path,
    retry: &RetryPolicy,
) -> Result<PathBuf, ReportError> {
    let doc = ReportDocument {
        name,
        generated_at: Utc::now(),
        view,
    };
    let json = serde_json::to_vec_pretty(&doc)?;
    let path = out_dir.join(format!("{name}.json"));
    write_atomic(&path, &json, retry).map_err(|source| ReportError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Built-in renderer: a JSON view plus a static HTML summary table.
#[derive(Debug, Clone, Default)]
pub struct HtmlReportRenderer {
    retry: RetryPolicy,
}

impl HtmlReportRenderer {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_html(name: &str, view: &AggregatedView) -> String {
    let mut html = String::new();
    let title = escape_html(name);
    let platform = escape_html(&view.filter.platform);
    let _ = writeln!(html, "<!DOCTYPE html>");
    let _ = writeln!(
        html,
        "<html><head><meta charset=\"utf-8\"><title>{title}</title></head><body>"
    );
    let _ = writeln!(html, "<h1>{title}</h1>");
    let _ = writeln!(
        html,
        "<p>Platform: {platform} &middot; Samples: {}</p>",
        view.sample_count
    );
    let _ = writeln!(html, "<table>");
    let _ = writeln!(
        html,
        "<tr><th>Metric</th><th>Samples</th><th>Mean</th><th>Min</th><th>Max</th><th>Mean P95</th></tr>"
    );
    for (metric, agg) in &view.metrics {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td><td>{:.2}</td></tr>",
            escape_html(metric),
            agg.samples,
            agg.mean,
            agg.min,
            agg.max,
            agg.mean_p95
        );
    }
    let _ = writeln!(html, "</table>");
    let _ = writeln!(html, "</body></html>");
    html
}

impl ReportRenderer for HtmlReportRenderer {
    fn render(
        &self,
        name: &str,
        view: &AggregatedView,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, ReportError> {
        let json = write_view_json(name, view, out_dir, &self.retry)?;
        let html_path = out_dir.join(format!("{name}.html"));
        write_atomic(&html_path, render_html(name, view).as_bytes(), &self.retry).map_err(
            |source| ReportError::Io {
                path: html_path.clone(),
                source,
            },
        )?;
        Ok(vec![html_path, json])
    }
}

/// Delegates rendering to an external tool invoked as
/// `<program> <args...> <view.json> <out_dir>`.
#[derive(Debug, Clone)]
pub struct CommandReportRenderer {
    command: Vec<String>,
    retry: RetryPolicy,
}

impl CommandReportRenderer {
    pub fn new(command: Vec<String>, retry: RetryPolicy) -> Self {
        Self { command, retry }
    }
}

impl ReportRenderer for CommandReportRenderer {
    fn render(
        &self,
        name: &str,
        view: &AggregatedView,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, ReportError> {
        let (program, args) = self.command.split_first().ok_or(ReportError::EmptyCommand)?;
        let json = write_view_json(name, view, out_dir, &self.retry)?;

        debug!(program = %program, report = name, "Running external renderer");
        let output = Command::new(program)
            .args(args)
            .arg(&json)
            .arg(out_dir)
            .output()
            .map_err(|source| ReportError::Spawn {
                program: program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ReportError::Renderer {
                program: program.clone(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(vec![json])
    }
}

/// A rendered report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedReport {
    pub name: String,
    pub sample_count: usize,
    pub files: Vec<PathBuf>,
}

/// Result of rendering the historic windows. Each window is independent.
#[derive(Debug, Default)]
pub struct HistoricReports {
    pub generated: Vec<GeneratedReport>,
    pub failed: Vec<(String, ReportError)>,
}

impl HistoricReports {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ReportGenerator {
    output_root: PathBuf,
    renderer: Box<dyn ReportRenderer>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ReportGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportGenerator")
            .field("output_root", &self.output_root)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ReportGenerator {
    pub fn new(output_root: &Path, renderer: Box<dyn ReportRenderer>, retry: RetryPolicy) -> Self {
        Self {
            output_root: output_root.to_path_buf(),
            renderer,
            retry,
        }
    }

    /// Use the external renderer when a command is configured, otherwise the
    /// built-in HTML renderer.
    pub fn from_settings(
        settings: &soakwatch_common::config::ReportSettings,
        retry: RetryPolicy,
    ) -> Self {
        let renderer: Box<dyn ReportRenderer> = match &settings.renderer_command {
            Some(command) if !command.is_empty() => {
                Box::new(CommandReportRenderer::new(command.clone(), retry.clone()))
            }
            _ => Box::new(HtmlReportRenderer::new(retry.clone())),
        };
        Self::new(&settings.output_root, renderer, retry)
    }

    /// Directory the reports for `platform` are written to.
    pub fn platform_dir(&self, platform: &str) -> PathBuf {
        self.output_root.join(normalize_platform(platform))
    }

    fn render_view(
        &self,
        name: &str,
        view: &AggregatedView,
    ) -> Result<GeneratedReport, ReportError> {
        let out_dir = self.platform_dir(&view.filter.platform);
        ensure_dir(&out_dir, &self.retry).map_err(|source| ReportError::Io {
            path: out_dir.clone(),
            source,
        })?;
        let files = self.renderer.render(name, view, &out_dir)?;
        Ok(GeneratedReport {
            name: name.to_string(),
            sample_count: view.sample_count,
            files,
        })
    }

    /// Render the report for the samples of the current run.
    pub fn generate_detailed(
        &self,
        platform: &str,
        summaries: Vec<SampleSummary>,
    ) -> Result<GeneratedReport, ReportError> {
        let view = AggregatedView::from_summaries(TimeWindowFilter::new(platform, None), summaries);
        let report = retry_io(DETAILED_REPORT_NAME, &self.retry, || {
            self.render_view(DETAILED_REPORT_NAME, &view)
        })?;
        info!(
            report = DETAILED_REPORT_NAME,
            samples = report.sample_count,
            "Generated report"
        );
        Ok(report)
    }

    /// Render one historic window from the cache.
    pub fn generate_window(
        &self,
        cache: &PerformanceCache,
        window: HistoricWindow,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<GeneratedReport, ReportError> {
        let filter = window.filter(platform, now);
        retry_io(window.name, &self.retry, || {
            let view = cache.query(&filter)?;
            self.render_view(window.name, &view)
        })
    }

    /// Render every standard historic window. A failing window is logged and
    /// does not stop the others.
    pub fn generate_historic(
        &self,
        cache: &PerformanceCache,
        platform: &str,
        now: DateTime<Utc>,
    ) -> HistoricReports {
        let mut result = HistoricReports::default();
        for window in HistoricWindow::STANDARD {
            match self.generate_window(cache, window, platform, now) {
                Ok(report) => {
                    info!(
                        report = window.name,
                        samples = report.sample_count,
                        "Generated report"
                    );
                    result.generated.push(report);
                }
                Err(e) => {
                    warn!(
                        code = %e.code().code_string(),
                        report = window.name,
                        error = %e,
                        "Historic report failed"
                    );
                    result.failed.push((window.name.to_string(), e));
                }
            }
        }
        result
    }
}
