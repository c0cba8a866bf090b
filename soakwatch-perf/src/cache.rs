//! Persistent, platform-partitioned performance cache.
//!
//! Layout:
//!
//! ```text
//! <root>/<platform>/samples/<content-hash>.csv
//! <root>/<platform>/summary_index.jsonl
//! ```
//!
//! The cache is append-only. Merging checks every sample's identity against
//! the index before writing anything, so merging the same sample any number
//! of times leaves the cache unchanged. Queries read only the summary index.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use soakwatch_common::fsutil::{append_line, ensure_dir, read_optional, write_atomic};
use soakwatch_common::{ErrorCode, RetryPolicy, RetryableError, normalize_platform};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::sample::{PerformanceSample, SampleIdentity, SampleSummary};

pub const INDEX_FILE_NAME: &str = "summary_index.jsonl";
const SAMPLES_DIR: &str = "samples";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("performance cache at {path} is unavailable: {source}")]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache index {path} is corrupt at line {line}: {message}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

impl CacheError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::StoreUnavailable { .. } => ErrorCode::StoreUnavailable,
            Self::Io { .. } => ErrorCode::TransientIo,
            Self::Corrupt { .. } => ErrorCode::StoreIndexCorrupt,
        }
    }
}

impl RetryableError for CacheError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable { source, .. } | Self::Io { source, .. } => {
                source.is_retryable()
            }
            Self::Corrupt { .. } => false,
        }
    }
}

/// Which slice of history a query covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindowFilter {
    pub platform: String,
    /// Inclusive lower bound in Unix seconds; `None` is unbounded.
    pub min_timestamp: Option<i64>,
}

impl TimeWindowFilter {
    pub fn new(platform: &str, min_timestamp: Option<i64>) -> Self {
        Self {
            platform: normalize_platform(platform),
            min_timestamp,
        }
    }

    /// Whether `summary` falls inside this window. Samples without a start
    /// timestamp only appear in unbounded windows.
    pub fn admits(&self, summary: &SampleSummary) -> bool {
        if normalize_platform(&summary.platform) != self.platform {
            return false;
        }
        match self.min_timestamp {
            None => true,
            Some(min) => summary.start_timestamp().is_some_and(|t| t >= min),
        }
    }
}

/// A named historic window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoricWindow {
    pub name: &'static str,
    /// How far back the window reaches; `None` is all time.
    pub max_age: Option<Duration>,
}

const DAY: u64 = 24 * 60 * 60;

impl HistoricWindow {
    pub const ALL_TIME: Self = Self {
        name: "HistoricReport_AllTime",
        max_age: None,
    };
    pub const LAST_14_DAYS: Self = Self {
        name: "HistoricReport_14Days",
        max_age: Some(Duration::from_secs(14 * DAY)),
    };
    pub const LAST_7_DAYS: Self = Self {
        name: "HistoricReport_7Days",
        max_age: Some(Duration::from_secs(7 * DAY)),
    };

    /// The windows rendered after every passed run.
    pub const STANDARD: [Self; 3] = [Self::ALL_TIME, Self::LAST_14_DAYS, Self::LAST_7_DAYS];

    pub fn custom(name: &'static str, max_age: Option<Duration>) -> Self {
        Self { name, max_age }
    }

    /// The filter for this window relative to `now`.
    pub fn filter(&self, platform: &str, now: DateTime<Utc>) -> TimeWindowFilter {
        let min_timestamp = self
            .max_age
            .map(|age| now.timestamp() - i64::try_from(age.as_secs()).unwrap_or(i64::MAX));
        TimeWindowFilter::new(platform, min_timestamp)
    }
}

/// The summaries admitted by `filter`, oldest first.
pub fn evaluate_window<'a>(
    summaries: impl IntoIterator<Item = &'a SampleSummary>,
    filter: &TimeWindowFilter,
) -> Vec<&'a SampleSummary> {
    let mut admitted: Vec<&SampleSummary> = summaries
        .into_iter()
        .filter(|s| filter.admits(s))
        .collect();
    admitted.sort_by_key(|s| (s.start_timestamp(), s.identity.content_hash.clone()));
    admitted
}

/// Cross-sample statistics for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricAggregate {
    /// Samples that recorded the metric.
    pub samples: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub mean_p95: f64,
}

/// Result of a windowed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedView {
    pub filter: TimeWindowFilter,
    pub sample_count: usize,
    pub samples: Vec<SampleSummary>,
    pub metrics: BTreeMap<String, MetricAggregate>,
}

impl AggregatedView {
    pub fn from_summaries(filter: TimeWindowFilter, samples: Vec<SampleSummary>) -> Self {
        let mut acc: BTreeMap<String, (usize, f64, f64, f64, f64)> = BTreeMap::new();
        for sample in &samples {
            for (name, m) in &sample.metrics {
                let entry = acc
                    .entry(name.clone())
                    .or_insert((0, 0.0, f64::INFINITY, f64::NEG_INFINITY, 0.0));
                entry.0 += 1;
                entry.1 += m.mean;
                entry.2 = entry.2.min(m.min);
                entry.3 = entry.3.max(m.max);
                entry.4 += m.p95;
            }
        }
        let metrics = acc
            .into_iter()
            .map(|(name, (n, mean_sum, min, max, p95_sum))| {
                let n_f = n as f64;
                (
                    name,
                    MetricAggregate {
                        samples: n,
                        mean: mean_sum / n_f,
                        min,
                        max,
                        mean_p95: p95_sum / n_f,
                    },
                )
            })
            .collect();
        Self {
            filter,
            sample_count: samples.len(),
            samples,
            metrics,
        }
    }
}

/// Outcome of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub added: usize,
    pub duplicates: usize,
    pub per_platform: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    #[serde(flatten)]
    summary: SampleSummary,
    merged_at: DateTime<Utc>,
}

/// Handle to an on-disk cache.
#[derive(Debug, Clone)]
pub struct PerformanceCache {
    root: PathBuf,
    retry: RetryPolicy,
}

impl PerformanceCache {
    /// Open (creating if needed) the cache at `root`.
    pub fn open(root: &Path, retry: RetryPolicy) -> Result<Self, CacheError> {
        ensure_dir(root, &retry).map_err(|source| CacheError::StoreUnavailable {
            path: root.to_path_buf(),
            source,
        })?;
        debug!(root = %root.display(), "Opened performance cache");
        Ok(Self {
            root: root.to_path_buf(),
            retry,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition(&self, platform: &str) -> PathBuf {
        let name: String = normalize_platform(platform)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(name)
    }

    fn index_path(&self, platform: &str) -> PathBuf {
        self.partition(platform).join(INDEX_FILE_NAME)
    }

    /// Platforms with at least one partition, sorted.
    pub fn platforms(&self) -> Result<Vec<String>, CacheError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| CacheError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut platforms: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().join(INDEX_FILE_NAME).is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        platforms.sort();
        Ok(platforms)
    }

    /// Read the index strictly: any unreadable line is an error.
    fn read_index_strict(&self, platform: &str) -> Result<Vec<SampleSummary>, CacheError> {
        let path = self.index_path(platform);
        let text = read_optional(&path, &self.retry).map_err(|source| CacheError::Io {
            path: path.clone(),
            source,
        })?;
        let mut summaries = Vec::new();
        for (idx, line) in text.unwrap_or_default().lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: IndexRecord =
                serde_json::from_str(line).map_err(|e| CacheError::Corrupt {
                    path: path.clone(),
                    line: idx + 1,
                    message: e.to_string(),
                })?;
            summaries.push(record.summary);
        }
        Ok(summaries)
    }

    /// Read the index, skipping unreadable lines with a warning.
    fn read_index_lenient(&self, platform: &str) -> Result<Vec<SampleSummary>, CacheError> {
        let path = self.index_path(platform);
        let text = read_optional(&path, &self.retry).map_err(|source| CacheError::Io {
            path: path.clone(),
            source,
        })?;
        let mut summaries = Vec::new();
        for (idx, line) in text.unwrap_or_default().lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IndexRecord>(line) {
                Ok(record) => summaries.push(record.summary),
                Err(e) => warn!(
                    code = %ErrorCode::StoreIndexCorrupt.code_string(),
                    path = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "Skipping unreadable index line"
                ),
            }
        }
        Ok(summaries)
    }

    /// Merge `samples` into the cache.
    ///
    /// Samples already present (by identity) and duplicates within the batch
    /// are skipped. For each new sample the CSV is written before its index
    /// line, so an interrupted merge never leaves an index entry without
    /// data. A write that fails is reported as
    /// [`CacheError::StoreUnavailable`].
    pub fn merge(&self, samples: &[PerformanceSample]) -> Result<MergeReport, CacheError> {
        let mut by_platform: BTreeMap<String, Vec<&PerformanceSample>> = BTreeMap::new();
        for sample in samples {
            by_platform
                .entry(normalize_platform(&sample.metadata.platform))
                .or_default()
                .push(sample);
        }

        let mut report = MergeReport::default();
        for (platform, batch) in by_platform {
            let mut known: Vec<SampleIdentity> = self
                .read_index_strict(&platform)?
                .into_iter()
                .map(|s| s.identity)
                .collect();

            let partition = self.partition(&platform);
            let samples_dir = partition.join(SAMPLES_DIR);
            ensure_dir(&samples_dir, &self.retry).map_err(|source| {
                CacheError::StoreUnavailable {
                    path: samples_dir.clone(),
                    source,
                }
            })?;

            let mut added = 0;
            for sample in batch {
                let identity = sample.identity();
                if known.iter().any(|k| k.same_sample(&identity)) {
                    debug!(
                        platform = %platform,
                        hash = %identity.content_hash,
                        "Sample already cached"
                    );
                    report.duplicates += 1;
                    continue;
                }

                let file_name = format!("{}.csv", identity.content_hash);
                let sample_path = samples_dir.join(&file_name);
                write_atomic(&sample_path, sample.bytes(), &self.retry).map_err(|source| {
                    CacheError::StoreUnavailable {
                        path: sample_path.clone(),
                        source,
                    }
                })?;

                let mut summary = sample.summarize();
                summary.sample_file = Some(format!("{SAMPLES_DIR}/{file_name}"));
                let record = IndexRecord {
                    summary,
                    merged_at: Utc::now(),
                };
                let line = serde_json::to_string(&record).map_err(|e| CacheError::Corrupt {
                    path: self.index_path(&platform),
                    line: 0,
                    message: e.to_string(),
                })?;
                let index = self.index_path(&platform);
                append_line(&index, &line, &self.retry).map_err(|source| {
                    CacheError::StoreUnavailable {
                        path: index.clone(),
                        source,
                    }
                })?;

                known.push(identity);
                added += 1;
            }

            info!(platform = %platform, added, "Merged samples into cache");
            report.added += added;
            report.per_platform.insert(platform, added);
        }
        Ok(report)
    }

    /// Aggregate the samples admitted by `filter`.
    pub fn query(&self, filter: &TimeWindowFilter) -> Result<AggregatedView, CacheError> {
        let summaries = self.read_index_lenient(&filter.platform)?;
        let admitted: Vec<SampleSummary> = evaluate_window(&summaries, filter)
            .into_iter()
            .cloned()
            .collect();
        Ok(AggregatedView::from_summaries(filter.clone(), admitted))
    }

    /// Number of cached samples for `platform`.
    pub fn sample_count(&self, platform: &str) -> Result<usize, CacheError> {
        Ok(self.read_index_lenient(platform)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::MetricSummary;
    use tempfile::TempDir;

    fn sample(ts: i64, build: &str, frame: f64) -> PerformanceSample {
        let csv = format!(
            "FrameTime\n{frame}\n{}\n[platform],Win64,[starttimestamp],{ts},[buildversion],{build}\n",
            frame + 1.0
        );
        PerformanceSample::from_bytes(Path::new("s.csv"), csv.into_bytes(), None).unwrap()
    }

    fn summary(platform: &str, ts: Option<i64>) -> SampleSummary {
        SampleSummary {
            identity: SampleIdentity {
                content_hash: format!("{ts:?}"),
                start_timestamp: ts,
                build_version: None,
            },
            platform: platform.into(),
            pass_index: None,
            frame_count: 1,
            metrics: BTreeMap::from([(
                "FrameTime".to_string(),
                MetricSummary {
                    count: 1,
                    mean: 1.0,
                    min: 1.0,
                    max: 1.0,
                    p95: 1.0,
                },
            )]),
            sample_file: None,
        }
    }

    #[test]
    fn test_open_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("cache");
        PerformanceCache::open(&root, RetryPolicy::none()).unwrap();
        PerformanceCache::open(&root, RetryPolicy::none()).unwrap();
        assert!(root.is_dir());
    }

    #[test]
    fn test_open_unwritable_is_store_unavailable() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let err = PerformanceCache::open(&blocker.join("cache"), RetryPolicy::none()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreUnavailable);
    }

    #[test]
    fn test_merge_into_unwritable_partition_is_store_unavailable() {
        let tmp = TempDir::new().unwrap();
        let cache = PerformanceCache::open(tmp.path(), RetryPolicy::none()).unwrap();
        // A file where the samples directory belongs makes every write fail.
        std::fs::create_dir_all(tmp.path().join("Windows")).unwrap();
        std::fs::write(tmp.path().join("Windows").join(SAMPLES_DIR), "x").unwrap();

        let err = cache.merge(&[sample(1_700_000_000, "CL-1", 16.0)]).unwrap_err();
        assert!(matches!(err, CacheError::StoreUnavailable { .. }));
        assert_eq!(err.code(), ErrorCode::StoreUnavailable);
        assert_eq!(cache.sample_count("Win64").unwrap(), 0);
    }

    #[test]
    fn test_merge_twice_is_identical() {
        let tmp = TempDir::new().unwrap();
        let cache = PerformanceCache::open(tmp.path(), RetryPolicy::none()).unwrap();
        let s = sample(1_700_000_000, "CL-1", 16.0);

        let first = cache.merge(std::slice::from_ref(&s)).unwrap();
        assert_eq!(first.added, 1);
        let index = std::fs::read(tmp.path().join("Windows").join(INDEX_FILE_NAME)).unwrap();

        let second = cache.merge(&[s]).unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.duplicates, 1);
        let after = std::fs::read(tmp.path().join("Windows").join(INDEX_FILE_NAME)).unwrap();
        assert_eq!(index, after);
        assert_eq!(cache.sample_count("Win64").unwrap(), 1);
    }

    #[test]
    fn test_merge_dedups_within_batch_and_by_stamp() {
        let tmp = TempDir::new().unwrap();
        let cache = PerformanceCache::open(tmp.path(), RetryPolicy::none()).unwrap();
        let a = sample(100, "CL-1", 16.0);
        let same_stamp = sample(100, "CL-1", 30.0);
        let other = sample(200, "CL-1", 16.0);

        let report = cache.merge(&[a.clone(), a, same_stamp, other]).unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.duplicates, 2);
        assert_eq!(report.per_platform.get("Windows"), Some(&2));
    }

    #[test]
    fn test_merge_refuses_corrupt_index() {
        let tmp = TempDir::new().unwrap();
        let cache = PerformanceCache::open(tmp.path(), RetryPolicy::none()).unwrap();
        std::fs::create_dir_all(tmp.path().join("Windows")).unwrap();
        std::fs::write(tmp.path().join("Windows").join(INDEX_FILE_NAME), "not json\n").unwrap();

        let err = cache.merge(&[sample(1, "CL-1", 1.0)]).unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { line: 1, .. }));
        assert_eq!(cache.sample_count("Windows").unwrap(), 0);
    }

    #[test]
    fn test_window_filter_bounds() {
        let now = DateTime::<Utc>::from_timestamp(1_000 * DAY as i64, 0).unwrap();
        let f = HistoricWindow::LAST_7_DAYS.filter("Win64", now);
        assert_eq!(f.platform, "Windows");
        assert_eq!(f.min_timestamp, Some(now.timestamp() - 7 * DAY as i64));
        assert_eq!(HistoricWindow::ALL_TIME.filter("PS5", now).min_timestamp, None);

        let boundary = summary("Windows", f.min_timestamp);
        assert!(f.admits(&boundary));
        assert!(!f.admits(&summary("Windows", None)));
        assert!(!f.admits(&summary("PS5", Some(now.timestamp()))));
    }

    #[test]
    fn test_aggregate_metrics() {
        let mut a = summary("Windows", Some(1));
        a.metrics.get_mut("FrameTime").unwrap().mean = 10.0;
        let mut b = summary("Windows", Some(2));
        b.metrics.get_mut("FrameTime").unwrap().mean = 20.0;
        b.metrics.get_mut("FrameTime").unwrap().max = 40.0;

        let view =
            AggregatedView::from_summaries(TimeWindowFilter::new("Windows", None), vec![a, b]);
        let m = view.metrics["FrameTime"];
        assert_eq!(view.sample_count, 2);
        assert_eq!(m.samples, 2);
        assert_eq!(m.mean, 15.0);
        assert_eq!(m.max, 40.0);
        assert_eq!(m.min, 1.0);
    }
}
