//! Export of staged samples to a remote ingestion service.
//!
//! Each staged CSV is converted to a compact binary form:
//!
//! ```text
//! "SWCB" | u16 version | zstd(
//!     u32 metadata_len | metadata JSON
//!     u32 column_count | (u32 name_len | name)*
//!     u32 frame_count  | f64 LE values, column-major
//! )
//! ```
//!
//! The encoded samples are bundled with their companion logs into one batch
//! tagged with the job id, build name and preflight flag, and handed to an
//! [`IngestionClient`]. Export never changes a pass result; the caller logs
//! the error and moves on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use soakwatch_common::config::ExportSettings;
use soakwatch_common::fsutil::{ensure_dir, remove_dir_all_if_exists, write_atomic};
use soakwatch_common::{ErrorCode, RetryPolicy, RetryableError, is_preflight_build, retry_io};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collector::StagedSample;
use crate::sample::{PerformanceSample, SampleError, SampleMetadata};

const SAMPLE_MAGIC: &[u8; 4] = b"SWCB";
const BATCH_MAGIC: &[u8; 4] = b"SWBX";
const FORMAT_VERSION: u16 = 1;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no staged samples to export")]
    NoSamples,

    #[error(transparent)]
    Sample(#[from] SampleError),

    #[error("failed to encode sample: {0}")]
    Encode(String),

    #[error("export I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("submission to {target} failed: {message}")]
    Submit { target: String, message: String },

    #[error("ingestion endpoint {target} answered HTTP {status}")]
    Status { target: String, status: u16 },
}

impl ExportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoSamples | Self::Sample(_) => ErrorCode::ArtifactMissing,
            Self::Encode(_) => ErrorCode::ExportEncodeFailed,
            Self::Io { .. } | Self::Submit { .. } | Self::Status { .. } => {
                ErrorCode::ExportSubmitFailed
            }
        }
    }
}

impl RetryableError for ExportError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Io { source, .. } => source.is_retryable(),
            Self::Submit { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::NoSamples | Self::Sample(_) | Self::Encode(_) => false,
        }
    }
}

/// Tags attached to every batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub run_id: Uuid,
    pub job_id: Option<String>,
    pub build_name: String,
    pub preflight: bool,
    pub data_source: String,
}

impl ExportMetadata {
    pub fn from_settings(settings: &ExportSettings, run_id: Uuid) -> Self {
        Self {
            run_id,
            job_id: settings.job_id.clone(),
            build_name: settings.build_name.clone(),
            preflight: is_preflight_build(&settings.build_name),
            data_source: settings.data_source.clone(),
        }
    }
}

/// A decoded binary sample.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    pub metadata: SampleMetadata,
    pub columns: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

fn put_u32(buf: &mut Vec<u8>, value: usize) -> Result<(), ExportError> {
    let value = u32::try_from(value)
        .map_err(|_| ExportError::Encode(format!("length {value} does not fit in u32")))?;
    buf.extend_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Encode `sample` in the compact binary form.
pub fn encode_sample(sample: &PerformanceSample) -> Result<Vec<u8>, ExportError> {
    let mut payload = Vec::new();
    let meta =
        serde_json::to_vec(&sample.metadata).map_err(|e| ExportError::Encode(e.to_string()))?;
    put_u32(&mut payload, meta.len())?;
    payload.extend_from_slice(&meta);

    let profile = &sample.profile;
    put_u32(&mut payload, profile.columns.len())?;
    for column in &profile.columns {
        put_u32(&mut payload, column.len())?;
        payload.extend_from_slice(column.as_bytes());
    }
    put_u32(&mut payload, profile.frame_count())?;
    for column in &profile.values {
        for value in column {
            payload.extend_from_slice(&value.to_le_bytes());
        }
    }

    let compressed = zstd::encode_all(payload.as_slice(), ZSTD_LEVEL)
        .map_err(|e| ExportError::Encode(e.to_string()))?;
    let mut out = Vec::with_capacity(compressed.len() + 6);
    out.extend_from_slice(SAMPLE_MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ExportError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ExportError::Encode("truncated sample payload".into()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<usize, ExportError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw) as usize)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn f64(&mut self) -> Result<f64, ExportError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(raw))
    }
}

/// Decode a sample produced by [`encode_sample`].
pub fn decode_sample(bytes: &[u8]) -> Result<DecodedSample, ExportError> {
    if bytes.len() < 6 || &bytes[..4] != SAMPLE_MAGIC {
        return Err(ExportError::Encode("not a binary sample".into()));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(ExportError::Encode(format!("unsupported version {version}")));
    }
    let payload = zstd::decode_all(&bytes[6..]).map_err(|e| ExportError::Encode(e.to_string()))?;

    let mut cur = Cursor {
        data: &payload,
        pos: 0,
    };
    let meta_len = cur.u32()?;
    let metadata: SampleMetadata = serde_json::from_slice(cur.take(meta_len)?)
        .map_err(|e| ExportError::Encode(e.to_string()))?;
    // Counts come from the payload; never reserve more than it can hold.
    let column_count = cur.u32()?;
    let mut columns = Vec::with_capacity(column_count.min(cur.remaining() / 4));
    for _ in 0..column_count {
        let len = cur.u32()?;
        columns.push(String::from_utf8_lossy(cur.take(len)?).into_owned());
    }
    let frames = cur.u32()?;
    let mut values = Vec::with_capacity(columns.len());
    for _ in 0..column_count {
        let mut column = Vec::with_capacity(frames.min(cur.remaining() / 8));
        for _ in 0..frames {
            column.push(cur.f64()?);
        }
        values.push(column);
    }
    Ok(DecodedSample {
        metadata,
        columns,
        values,
    })
}

/// One sample in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub pass_index: u32,
    pub content_hash: String,
    pub sample_file: String,
    pub encoded: Vec<u8>,
    pub log_file: Option<String>,
    pub log: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub pass_index: u32,
    pub content_hash: String,
    pub sample_file: String,
    pub log_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    #[serde(flatten)]
    pub metadata: ExportMetadata,
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBatch {
    pub metadata: ExportMetadata,
    pub entries: Vec<ExportEntry>,
}

impl ExportBatch {
    pub fn manifest(&self) -> ExportManifest {
        ExportManifest {
            metadata: self.metadata.clone(),
            entries: self
                .entries
                .iter()
                .map(|e| ManifestEntry {
                    pass_index: e.pass_index,
                    content_hash: e.content_hash.clone(),
                    sample_file: e.sample_file.clone(),
                    log_file: e.log_file.clone(),
                })
                .collect(),
        }
    }

    /// Single-body framing used for HTTP submission:
    /// `"SWBX" | u16 version | u32 manifest_len | manifest JSON` followed by,
    /// per entry, `u32 sample_len | sample | u32 log_len | log`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ExportError> {
        let manifest =
            serde_json::to_vec(&self.manifest()).map_err(|e| ExportError::Encode(e.to_string()))?;
        let mut out = Vec::new();
        out.extend_from_slice(BATCH_MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        put_u32(&mut out, manifest.len())?;
        out.extend_from_slice(&manifest);
        for entry in &self.entries {
            put_u32(&mut out, entry.encoded.len())?;
            out.extend_from_slice(&entry.encoded);
            let log = entry.log.as_deref().unwrap_or_default();
            put_u32(&mut out, log.len())?;
            out.extend_from_slice(log);
        }
        Ok(out)
    }
}

/// Acknowledgement of a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub target: String,
    pub entries: usize,
    pub bytes: usize,
}

/// Destination for export batches.
pub trait IngestionClient: Send + Sync {
    fn submit(&self, batch: &ExportBatch) -> Result<SubmitReceipt, ExportError>;

    fn describe(&self) -> String;
}

/// Posts batches to an HTTP ingestion endpoint.
pub struct HttpIngestionClient {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpIngestionClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            endpoint: endpoint.to_string(),
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl IngestionClient for HttpIngestionClient {
    fn submit(&self, batch: &ExportBatch) -> Result<SubmitReceipt, ExportError> {
        let body = batch.to_bytes()?;
        let response = self
            .agent
            .post(&self.endpoint)
            .header("Content-Type", "application/octet-stream")
            .header("X-Soakwatch-Run", batch.metadata.run_id.to_string())
            .header("X-Soakwatch-Data-Source", &batch.metadata.data_source)
            .send(&body[..])
            .map_err(|e| ExportError::Submit {
                target: self.endpoint.clone(),
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExportError::Status {
                target: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }
        Ok(SubmitReceipt {
            target: self.endpoint.clone(),
            entries: batch.entries.len(),
            bytes: body.len(),
        })
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

/// Writes batches into an import directory: `<dir>/<run_id>/manifest.json`
/// plus the encoded samples and logs.
#[derive(Debug, Clone)]
pub struct DirectoryIngestionClient {
    dir: PathBuf,
    retry: RetryPolicy,
}

impl DirectoryIngestionClient {
    pub fn new(dir: &Path, retry: RetryPolicy) -> Self {
        Self {
            dir: dir.to_path_buf(),
            retry,
        }
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
        write_atomic(path, bytes, &self.retry).map_err(|source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl IngestionClient for DirectoryIngestionClient {
    fn submit(&self, batch: &ExportBatch) -> Result<SubmitReceipt, ExportError> {
        let out = self.dir.join(batch.metadata.run_id.to_string());
        ensure_dir(&out, &self.retry).map_err(|source| ExportError::Io {
            path: out.clone(),
            source,
        })?;

        let mut bytes = 0;
        for entry in &batch.entries {
            self.write(&out.join(&entry.sample_file), &entry.encoded)?;
            bytes += entry.encoded.len();
            if let (Some(name), Some(log)) = (&entry.log_file, &entry.log) {
                self.write(&out.join(name), log)?;
                bytes += log.len();
            }
        }
        let manifest = serde_json::to_vec_pretty(&batch.manifest())
            .map_err(|e| ExportError::Encode(e.to_string()))?;
        self.write(&out.join("manifest.json"), &manifest)?;

        Ok(SubmitReceipt {
            target: out.display().to_string(),
            entries: batch.entries.len(),
            bytes: bytes + manifest.len(),
        })
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Pick the client for `settings`: the endpoint when set, otherwise the
/// import directory. `None` when neither is configured.
pub fn client_from_settings(
    settings: &ExportSettings,
    retry: &RetryPolicy,
) -> Option<Box<dyn IngestionClient>> {
    if let Some(endpoint) = settings.endpoint.as_deref().filter(|e| !e.is_empty()) {
        return Some(Box::new(HttpIngestionClient::new(endpoint, settings.timeout)));
    }
    settings
        .import_dir
        .as_deref()
        .map(|dir| {
            Box::new(DirectoryIngestionClient::new(dir, retry.clone())) as Box<dyn IngestionClient>
        })
}

pub struct RemoteExporter {
    client: Box<dyn IngestionClient>,
    metadata: ExportMetadata,
    retry: RetryPolicy,
}

impl RemoteExporter {
    pub fn new(
        client: Box<dyn IngestionClient>,
        metadata: ExportMetadata,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            metadata,
            retry,
        }
    }

    pub fn metadata(&self) -> &ExportMetadata {
        &self.metadata
    }

    /// Build the batch for `staged`.
    pub fn build_batch(&self, staged: &[StagedSample]) -> Result<ExportBatch, ExportError> {
        if staged.is_empty() {
            return Err(ExportError::NoSamples);
        }
        let mut entries = Vec::with_capacity(staged.len());
        for item in staged {
            let sample = PerformanceSample::load(&item.csv_path, &self.retry)?
                .with_pass_index(item.pass_index);
            let encoded = encode_sample(&sample)?;
            let log = match &item.log_path {
                Some(path) => Some(
                    retry_io("read_log", &self.retry, || std::fs::read(path)).map_err(|source| {
                        ExportError::Io {
                            path: path.clone(),
                            source,
                        }
                    })?,
                ),
                None => None,
            };
            let prefix = format!("pass-{:03}", item.pass_index);
            entries.push(ExportEntry {
                pass_index: item.pass_index,
                content_hash: sample.content_hash.clone(),
                sample_file: format!("{prefix}.swcb"),
                encoded,
                log_file: log.as_ref().map(|_| format!("{prefix}.log")),
                log,
            });
        }
        Ok(ExportBatch {
            metadata: self.metadata.clone(),
            entries,
        })
    }

    /// Export the staged samples. The staging area is removed after a
    /// successful submission and kept after a failed one.
    pub fn export(
        &self,
        staged: &[StagedSample],
        staging_root: &Path,
    ) -> Result<SubmitReceipt, ExportError> {
        let submitted = self.build_batch(staged).and_then(|batch| {
            debug!(
                destination = %self.client.describe(),
                entries = batch.entries.len(),
                "Submitting export batch"
            );
            retry_io("submit_export", &self.retry, || self.client.submit(&batch))
        });

        let receipt = match submitted {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(
                    code = %e.code().code_string(),
                    destination = %self.client.describe(),
                    staging = %staging_root.display(),
                    error = %e,
                    "Export failed, keeping staged samples"
                );
                return Err(e);
            }
        };

        info!(
            destination = %receipt.target,
            entries = receipt.entries,
            bytes = receipt.bytes,
            job_id = ?self.metadata.job_id,
            preflight = self.metadata.preflight,
            "Exported performance samples"
        );
        if let Err(e) = remove_dir_all_if_exists(staging_root, &self.retry) {
            warn!(path = %staging_root.display(), error = %e, "Failed to remove staging area");
        }
        Ok(receipt)
    }
}
