//! CSV performance samples.
//!
//! A sample is a CSV time series written by the client's CSV profiler: a
//! header row of stat names, one numeric row per frame, and a trailing
//! metadata row of `[key],value` pairs:
//!
//! ```text
//! FrameTime,GameThreadTime,RenderThreadTime,EVENTS
//! 16.6,9.1,11.3,
//! 17.2,9.4,12.0,Checkpoint 1
//! FrameTime,GameThreadTime,RenderThreadTime,EVENTS
//! [HasHeaderRowAtEnd],1,[platform],Windows,[starttimestamp],1714550000,[buildversion],++Soak+Main-CL-48211
//! ```
//!
//! When `[HasHeaderRowAtEnd]` is set the row before the metadata repeats the
//! header and is dropped. An optional `<file>.meta.json` sidecar (a flat JSON
//! object of strings) fills in keys the metadata row lacks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use soakwatch_common::{RetryPolicy, normalize_platform, retry_io};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("failed to read sample {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sample {path} is empty")]
    Empty { path: PathBuf },

    #[error("sample {path} has no metadata row or sidecar")]
    MissingMetadata { path: PathBuf },

    #[error("sample {path} does not record a platform")]
    MissingPlatform { path: PathBuf },

    #[error("sample {path} has an unreadable sidecar: {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Metadata keys with a dedicated field.
const KEY_PLATFORM: &str = "platform";
const KEY_START_TIMESTAMP: &str = "starttimestamp";
const KEY_BUILD_VERSION: &str = "buildversion";
const KEY_TEST_BUILD_VERSION: &str = "testbuildversion";
const KEY_PASS_INDEX: &str = "passindex";
const KEY_HEADER_AT_END: &str = "hasheaderrowatend";

/// Metadata attached to a sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleMetadata {
    pub platform: String,
    /// Unix seconds at which the capture started.
    pub start_timestamp: Option<i64>,
    pub build_version: Option<String>,
    pub pass_index: Option<u32>,
    /// Every other key, lowercased.
    pub extra: BTreeMap<String, String>,
}

impl SampleMetadata {
    fn from_pairs(pairs: BTreeMap<String, String>) -> Self {
        let mut extra = pairs;
        let platform = extra
            .remove(KEY_PLATFORM)
            .map(|p| normalize_platform(&p))
            .unwrap_or_default();
        let start_timestamp = extra
            .remove(KEY_START_TIMESTAMP)
            .and_then(|v| v.trim().parse::<i64>().ok());
        let build_version = extra
            .remove(KEY_BUILD_VERSION)
            .or_else(|| extra.remove(KEY_TEST_BUILD_VERSION))
            .filter(|v| !v.is_empty());
        let pass_index = extra
            .remove(KEY_PASS_INDEX)
            .and_then(|v| v.trim().parse::<u32>().ok());
        extra.remove(KEY_HEADER_AT_END);
        Self {
            platform,
            start_timestamp,
            build_version,
            pass_index,
            extra,
        }
    }
}

/// Parsed CSV time series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsvProfile {
    pub columns: Vec<String>,
    /// Column-major values; non-numeric cells are `NaN`.
    pub values: Vec<Vec<f64>>,
    /// Raw `[key],value` metadata pairs, keys lowercased.
    pub metadata: BTreeMap<String, String>,
}

impl CsvProfile {
    pub fn frame_count(&self) -> usize {
        self.values.first().map_or(0, Vec::len)
    }

    /// Parse CSV text. Returns `None` for an input without a header row.
    pub fn parse(text: &str) -> Option<Self> {
        let mut rows: Vec<&str> = text
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty())
            .collect();
        if rows.is_empty() {
            return None;
        }

        let mut metadata = BTreeMap::new();
        if rows.len() > 1 && rows.last().is_some_and(|l| l.starts_with('[')) {
            let meta_row = rows.pop().unwrap_or_default();
            metadata = parse_metadata_row(meta_row);
            let header_at_end = metadata
                .get(KEY_HEADER_AT_END)
                .is_some_and(|v| v.trim() == "1");
            if header_at_end && rows.len() > 1 {
                rows.pop();
            }
        }

        let columns: Vec<String> = split_cells(rows[0])
            .into_iter()
            .map(|c| c.trim().to_string())
            .collect();
        let mut values = vec![Vec::with_capacity(rows.len() - 1); columns.len()];
        for row in &rows[1..] {
            let cells = split_cells(row);
            for (idx, column) in values.iter_mut().enumerate() {
                let value = cells
                    .get(idx)
                    .and_then(|c| c.trim().parse::<f64>().ok())
                    .unwrap_or(f64::NAN);
                column.push(value);
            }
        }

        Some(Self {
            columns,
            values,
            metadata,
        })
    }
}

/// Split one CSV row. A cell wrapped in double quotes may hold commas and
/// `""` for a literal quote; quoted cells never span rows.
fn split_cells(row: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = row.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                chars.next();
                cell.push('"');
            }
            '"' if quoted => quoted = false,
            '"' if cell.trim().is_empty() => {
                cell.clear();
                quoted = true;
            }
            ',' if !quoted => cells.push(std::mem::take(&mut cell)),
            _ => cell.push(ch),
        }
    }
    cells.push(cell);
    cells
}

fn parse_metadata_row(row: &str) -> BTreeMap<String, String> {
    let cells = split_cells(row);
    let mut pairs = BTreeMap::new();
    let mut iter = cells.iter();
    while let Some(key) = iter.next() {
        let key = key.trim();
        let Some(name) = key.strip_prefix('[').and_then(|k| k.strip_suffix(']')) else {
            continue;
        };
        let value = iter.next().map_or("", |v| v.trim());
        pairs.insert(name.to_ascii_lowercase(), value.to_string());
    }
    pairs
}

/// Summary statistics for one metric column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Nearest-rank 95th percentile.
    pub p95: f64,
}

impl MetricSummary {
    /// Summarise the finite values of `column`. `None` when there are none.
    pub fn from_values(column: &[f64]) -> Option<Self> {
        let mut finite: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return None;
        }
        finite.sort_by(f64::total_cmp);
        let count = finite.len();
        let sum: f64 = finite.iter().sum();
        let rank = ((count as f64) * 0.95).ceil() as usize;
        Some(Self {
            count,
            mean: sum / count as f64,
            min: finite[0],
            max: finite[count - 1],
            p95: finite[rank.clamp(1, count) - 1],
        })
    }
}

/// Stable identity used to deduplicate samples.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleIdentity {
    /// blake3 of the CSV bytes.
    pub content_hash: String,
    pub start_timestamp: Option<i64>,
    pub build_version: Option<String>,
}

impl SampleIdentity {
    /// Two samples are the same when their content hashes match, or when both
    /// carry the same (start timestamp, build) pair.
    pub fn same_sample(&self, other: &SampleIdentity) -> bool {
        if self.content_hash == other.content_hash {
            return true;
        }
        match (self.stamp(), other.stamp()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    pub fn stamp(&self) -> Option<(i64, &str)> {
        Some((self.start_timestamp?, self.build_version.as_deref()?))
    }
}

/// A loaded CSV sample and its metadata.
#[derive(Debug, Clone)]
pub struct PerformanceSample {
    pub source: PathBuf,
    pub metadata: SampleMetadata,
    pub profile: CsvProfile,
    pub content_hash: String,
    bytes: Vec<u8>,
}

impl PerformanceSample {
    /// Parse a sample from raw bytes, with optional sidecar metadata.
    pub fn from_bytes(
        source: &Path,
        bytes: Vec<u8>,
        sidecar: Option<BTreeMap<String, String>>,
    ) -> Result<Self, SampleError> {
        let text = String::from_utf8_lossy(&bytes);
        let profile = CsvProfile::parse(&text).ok_or_else(|| SampleError::Empty {
            path: source.to_path_buf(),
        })?;

        if profile.metadata.is_empty() && sidecar.is_none() {
            return Err(SampleError::MissingMetadata {
                path: source.to_path_buf(),
            });
        }

        let mut pairs = profile.metadata.clone();
        for (key, value) in sidecar.unwrap_or_default() {
            pairs.entry(key.to_ascii_lowercase()).or_insert(value);
        }
        let metadata = SampleMetadata::from_pairs(pairs);
        if metadata.platform.is_empty() {
            return Err(SampleError::MissingPlatform {
                path: source.to_path_buf(),
            });
        }

        let content_hash = blake3::hash(&bytes).to_hex().to_string();
        Ok(Self {
            source: source.to_path_buf(),
            metadata,
            profile,
            content_hash,
            bytes,
        })
    }

    /// Load and validate the sample at `path`, reading its sidecar if present.
    pub fn load(path: &Path, policy: &RetryPolicy) -> Result<Self, SampleError> {
        let bytes = retry_io("read_sample", policy, || std::fs::read(path)).map_err(|source| {
            SampleError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let sidecar_path = sidecar_path(path);
        let sidecar = match std::fs::read_to_string(&sidecar_path) {
            Ok(text) => Some(serde_json::from_str::<BTreeMap<String, String>>(&text).map_err(
                |source| SampleError::Sidecar {
                    path: sidecar_path.clone(),
                    source,
                },
            )?),
            Err(_) => None,
        };

        Self::from_bytes(path, bytes, sidecar)
    }

    #[must_use]
    pub fn with_pass_index(mut self, pass_index: u32) -> Self {
        self.metadata.pass_index.get_or_insert(pass_index);
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn identity(&self) -> SampleIdentity {
        SampleIdentity {
            content_hash: self.content_hash.clone(),
            start_timestamp: self.metadata.start_timestamp,
            build_version: self.metadata.build_version.clone(),
        }
    }

    /// Per-column statistics, skipping columns with no numeric values.
    pub fn metric_summaries(&self) -> BTreeMap<String, MetricSummary> {
        self.profile
            .columns
            .iter()
            .zip(&self.profile.values)
            .filter_map(|(name, column)| {
                MetricSummary::from_values(column).map(|summary| (name.clone(), summary))
            })
            .collect()
    }

    pub fn summarize(&self) -> SampleSummary {
        SampleSummary {
            identity: self.identity(),
            platform: self.metadata.platform.clone(),
            pass_index: self.metadata.pass_index,
            frame_count: self.profile.frame_count(),
            metrics: self.metric_summaries(),
            sample_file: None,
        }
    }
}

/// Path of the optional metadata sidecar for `csv`.
pub fn sidecar_path(csv: &Path) -> PathBuf {
    let mut name = csv.file_name().unwrap_or_default().to_os_string();
    name.push(".meta.json");
    csv.with_file_name(name)
}

/// Compact record of a sample, as stored in the cache index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSummary {
    pub identity: SampleIdentity,
    pub platform: String,
    pub pass_index: Option<u32>,
    pub frame_count: usize,
    pub metrics: BTreeMap<String, MetricSummary>,
    /// File holding the raw CSV, relative to the platform partition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_file: Option<String>,
}

impl SampleSummary {
    pub fn start_timestamp(&self) -> Option<i64> {
        self.identity.start_timestamp
    }
}
