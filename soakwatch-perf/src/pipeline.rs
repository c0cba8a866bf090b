//! End-of-run processing: merge, report, export.
//!
//! Runs once, after the final pass of a run that passed. Nothing here can
//! fail the run: every stage logs its error and the remaining stages carry
//! on with whatever they have.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use soakwatch_common::{ErrorCode, RetryPolicy, SoakwatchConfig};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CacheError, MergeReport, PerformanceCache};
use crate::collector::{CollectorConfig, SampleCollector, StagedSample};
use crate::export::{ExportMetadata, RemoteExporter, SubmitReceipt, client_from_settings};
use crate::report::{DETAILED_REPORT_NAME, GeneratedReport, ReportGenerator};
use crate::sample::{PerformanceSample, SampleSummary};

/// What [`PerfPipeline::finalize`] managed to do.
#[derive(Debug, Default, Serialize)]
pub struct PipelineReport {
    pub staged: usize,
    pub samples: usize,
    pub merge: Option<MergeReport>,
    pub reports: Vec<GeneratedReport>,
    pub failed_reports: Vec<String>,
    pub export: Option<ExportSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub destination: String,
    pub entries: usize,
}

impl From<SubmitReceipt> for ExportSummary {
    fn from(receipt: SubmitReceipt) -> Self {
        Self {
            destination: receipt.target,
            entries: receipt.entries,
        }
    }
}

pub struct PerfPipeline {
    collector: SampleCollector,
    cache_root: PathBuf,
    reports: ReportGenerator,
    exporter: Option<RemoteExporter>,
    retry: RetryPolicy,
}

impl PerfPipeline {
    pub fn new(
        collector: SampleCollector,
        cache_root: &Path,
        reports: ReportGenerator,
        exporter: Option<RemoteExporter>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            collector,
            cache_root: cache_root.to_path_buf(),
            reports,
            exporter,
            retry,
        }
    }

    /// Build the pipeline described by `config` for the run `run_id`.
    pub fn from_config(config: &SoakwatchConfig, run_id: Uuid) -> Self {
        let retry = config.retry.policy();
        let collector = SampleCollector::new(CollectorConfig::from_settings(
            &config.collector,
            retry.clone(),
        ));
        let reports = ReportGenerator::from_settings(&config.report, retry.clone());
        let exporter = if config.export.enabled {
            match client_from_settings(&config.export, &retry) {
                Some(client) => Some(RemoteExporter::new(
                    client,
                    ExportMetadata::from_settings(&config.export, run_id),
                    retry.clone(),
                )),
                None => {
                    warn!("Export enabled but neither an endpoint nor an import dir is configured");
                    None
                }
            }
        } else {
            None
        };
        Self::new(collector, &config.cache.root, reports, exporter, retry)
    }

    pub fn collector(&self) -> &SampleCollector {
        &self.collector
    }

    fn load_staged(
        &self,
        report: &mut PipelineReport,
    ) -> (Vec<StagedSample>, Vec<PerformanceSample>) {
        let staged = match self.collector.staged_samples() {
            Ok(staged) => staged,
            Err(e) => {
                warn!(
                    code = %ErrorCode::StagingFailed.code_string(),
                    error = %e,
                    "Cannot list staged samples"
                );
                Vec::new()
            }
        };
        report.staged = staged.len();

        let mut samples = Vec::with_capacity(staged.len());
        for item in &staged {
            match PerformanceSample::load(&item.csv_path, &self.retry) {
                Ok(sample) => samples.push(sample.with_pass_index(item.pass_index)),
                Err(e) => warn!(
                    code = %ErrorCode::ArtifactInvalid.code_string(),
                    pass = item.pass_index,
                    error = %e,
                    "Skipping staged sample"
                ),
            }
        }
        report.samples = samples.len();
        (staged, samples)
    }

    /// Merge the staged samples, render every report, then export.
    pub fn finalize(&self, now: DateTime<Utc>) -> PipelineReport {
        let mut report = PipelineReport::default();
        let (staged, samples) = self.load_staged(&mut report);
        if samples.is_empty() {
            warn!(
                code = %ErrorCode::ArtifactMissing.code_string(),
                "No staged performance samples; skipping reports"
            );
            return report;
        }

        let mut by_platform: BTreeMap<String, Vec<SampleSummary>> = BTreeMap::new();
        for sample in &samples {
            by_platform
                .entry(sample.metadata.platform.clone())
                .or_default()
                .push(sample.summarize());
        }

        let mut cache = match PerformanceCache::open(&self.cache_root, self.retry.clone()) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(
                    code = %e.code().code_string(),
                    error = %e,
                    "Performance cache unavailable; skipping merge and historic reports"
                );
                None
            }
        };

        if let Some(store) = &cache {
            match store.merge(&samples) {
                Ok(merge) => report.merge = Some(merge),
                Err(e @ CacheError::StoreUnavailable { .. }) => {
                    warn!(
                        code = %e.code().code_string(),
                        error = %e,
                        "Performance cache unwritable; skipping historic reports"
                    );
                    cache = None;
                }
                Err(e) => warn!(code = %e.code().code_string(), error = %e, "Cache merge failed"),
            }
        }

        for (platform, summaries) in by_platform {
            match self.reports.generate_detailed(&platform, summaries) {
                Ok(generated) => report.reports.push(generated),
                Err(e) => {
                    warn!(
                        code = %e.code().code_string(),
                        platform = %platform,
                        error = %e,
                        "Detailed report failed"
                    );
                    report.failed_reports.push(DETAILED_REPORT_NAME.to_string());
                }
            }
            if let Some(cache) = &cache {
                let historic = self.reports.generate_historic(cache, &platform, now);
                report.reports.extend(historic.generated);
                report
                    .failed_reports
                    .extend(historic.failed.into_iter().map(|(name, _)| name));
            }
        }

        let staging_root = self.collector.staging_root();
        report.export = self
            .exporter
            .as_ref()
            .and_then(|exporter| exporter.export(&staged, staging_root).ok())
            .map(ExportSummary::from);

        info!(
            samples = report.samples,
            reports = report.reports.len(),
            failed = report.failed_reports.len(),
            exported = report.export.is_some(),
            "Performance pipeline finished"
        );
        report
    }
}
