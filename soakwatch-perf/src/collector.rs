//! Discovery and staging of per-pass samples.
//!
//! After each passed pass the newest valid CSV sample and the companion
//! client log are copied into `<staging_root>/pass-NNN/`, because the next
//! pass overwrites the artifact directory. Staging is cleared when a new run
//! starts.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use soakwatch_common::config::CollectorSettings;
use soakwatch_common::fsutil::{copy_into, ensure_dir, remove_dir_all_if_exists, walk_files};
use soakwatch_common::{ErrorCode, RetryPolicy};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::sample::{PerformanceSample, sidecar_path};

const PASS_DIR_PREFIX: &str = "pass-";

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to search {path}: {source}")]
    Discover {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stage into {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Collector settings.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Directories searched for samples, relative to the artifact root.
    pub candidate_dirs: Vec<PathBuf>,
    /// Token a sample's file name must contain (case-insensitive).
    pub marker: String,
    /// Companion log, relative to the artifact root.
    pub companion_log: PathBuf,
    pub staging_root: PathBuf,
    pub retry: RetryPolicy,
}

impl CollectorConfig {
    pub fn from_settings(settings: &CollectorSettings, retry: RetryPolicy) -> Self {
        Self {
            candidate_dirs: settings.candidate_dirs.clone(),
            marker: settings.marker.clone(),
            companion_log: PathBuf::from(&settings.companion_log),
            staging_root: settings.staging_root.clone(),
            retry,
        }
    }
}

/// A discovered sample file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    /// Creation time, or modification time where creation is unsupported.
    pub created: SystemTime,
}

/// The candidate with the latest creation time. Ties go to the
/// lexicographically first path, so the result never depends on directory
/// iteration order.
pub fn select_latest(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().max_by(|a, b| {
        a.created
            .cmp(&b.created)
            .then_with(|| b.path.cmp(&a.path))
    })
}

/// One staged pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSample {
    pub pass_index: u32,
    pub dir: PathBuf,
    pub csv_path: PathBuf,
    pub log_path: Option<PathBuf>,
}

/// Name of the staging directory for `pass_index`.
pub fn pass_dir_name(pass_index: u32) -> String {
    format!("{PASS_DIR_PREFIX}{pass_index:03}")
}

fn parse_pass_dir(name: &str) -> Option<u32> {
    name.strip_prefix(PASS_DIR_PREFIX)?.parse().ok()
}

#[derive(Debug, Clone)]
pub struct SampleCollector {
    config: CollectorConfig,
}

impl SampleCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn staging_root(&self) -> &Path {
        &self.config.staging_root
    }

    fn is_candidate(&self, path: &Path) -> bool {
        let is_csv = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        let marker = self.config.marker.to_lowercase();
        let name_matches = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().to_lowercase().contains(&marker));
        is_csv && name_matches
    }

    /// Every candidate sample under the configured directories of
    /// `artifact_root`.
    pub fn discover(&self, artifact_root: &Path) -> Result<Vec<Candidate>, CollectError> {
        let mut candidates = Vec::new();
        for dir in &self.config.candidate_dirs {
            let root = artifact_root.join(dir);
            let files = walk_files(&root).map_err(|source| CollectError::Discover {
                path: root.clone(),
                source,
            })?;
            for path in files.into_iter().filter(|p| self.is_candidate(p)) {
                let meta = std::fs::metadata(&path).map_err(|source| CollectError::Discover {
                    path: path.clone(),
                    source,
                })?;
                let created = meta
                    .created()
                    .or_else(|_| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                candidates.push(Candidate { path, created });
            }
        }
        debug!(
            root = %artifact_root.display(),
            found = candidates.len(),
            "Discovered sample candidates"
        );
        Ok(candidates)
    }

    /// Stage the newest valid sample of `artifact_root` for `pass_index`.
    ///
    /// Returns `Ok(None)` when no valid sample exists; that is logged but is
    /// not a failure. Re-staging a pass replaces its previous contents.
    pub fn stage(
        &self,
        pass_index: u32,
        artifact_root: &Path,
    ) -> Result<Option<StagedSample>, CollectError> {
        let candidates = self.discover(artifact_root)?;
        let valid: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| match PerformanceSample::load(&c.path, &self.config.retry) {
                Ok(_) => true,
                Err(e) => {
                    warn!(
                        code = %ErrorCode::ArtifactInvalid.code_string(),
                        path = %c.path.display(),
                        error = %e,
                        "Skipping invalid sample"
                    );
                    false
                }
            })
            .collect();

        let Some(chosen) = select_latest(&valid) else {
            let searched: Vec<String> = self
                .config
                .candidate_dirs
                .iter()
                .map(|d| artifact_root.join(d).display().to_string())
                .collect();
            warn!(
                code = %ErrorCode::ArtifactMissing.code_string(),
                pass = pass_index,
                searched = ?searched,
                "No valid performance sample found"
            );
            return Ok(None);
        };

        let dir = self.config.staging_root.join(pass_dir_name(pass_index));
        let stage_err = |source| CollectError::Stage {
            path: dir.clone(),
            source,
        };
        remove_dir_all_if_exists(&dir, &self.config.retry).map_err(stage_err)?;
        ensure_dir(&dir, &self.config.retry).map_err(stage_err)?;

        let csv_path = copy_into(&chosen.path, &dir, &self.config.retry).map_err(stage_err)?;
        let sidecar = sidecar_path(&chosen.path);
        if sidecar.is_file() {
            copy_into(&sidecar, &dir, &self.config.retry).map_err(stage_err)?;
        }

        let log_source = artifact_root.join(&self.config.companion_log);
        let log_path = if log_source.is_file() {
            Some(copy_into(&log_source, &dir, &self.config.retry).map_err(stage_err)?)
        } else {
            warn!(path = %log_source.display(), "No companion log found");
            None
        };

        info!(
            pass = pass_index,
            sample = %chosen.path.display(),
            staged = %dir.display(),
            "Staged performance sample"
        );
        Ok(Some(StagedSample {
            pass_index,
            dir,
            csv_path,
            log_path,
        }))
    }

    /// Remove everything staged by a previous run.
    pub fn reset_staging(&self) -> Result<(), CollectError> {
        let root = &self.config.staging_root;
        remove_dir_all_if_exists(root, &self.config.retry).map_err(|source| {
            CollectError::Stage {
                path: root.clone(),
                source,
            }
        })?;
        debug!(root = %root.display(), "Cleared staging area");
        Ok(())
    }

    /// All staged passes in pass order.
    pub fn staged_samples(&self) -> Result<Vec<StagedSample>, CollectError> {
        let root = &self.config.staging_root;
        let discover_err = |source| CollectError::Discover {
            path: root.clone(),
            source,
        };
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(discover_err(e)),
        };

        let mut staged = Vec::new();
        for entry in entries {
            let entry = entry.map_err(discover_err)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(pass_index) = parse_pass_dir(&name) else {
                continue;
            };
            let dir = entry.path();
            let files = walk_files(&dir).map_err(discover_err)?;
            let Some(csv_path) = files.iter().find(|p| self.is_candidate(p)).cloned() else {
                continue;
            };
            let log_name = self.config.companion_log.file_name();
            let log_path = files
                .iter()
                .find(|p| p.file_name().is_some() && p.file_name() == log_name)
                .cloned();
            staged.push(StagedSample {
                pass_index,
                dir,
                csv_path,
                log_path,
            });
        }
        staged.sort_by_key(|s| s.pass_index);
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn candidate(path: &str, secs: u64) -> Candidate {
        Candidate {
            path: PathBuf::from(path),
            created: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
        }
    }

    fn collector(root: &Path) -> SampleCollector {
        SampleCollector::new(CollectorConfig {
            candidate_dirs: vec![PathBuf::from("Profiling"), PathBuf::from("Saved/Profiling")],
            marker: "csvprofile".into(),
            companion_log: PathBuf::from("ClientOutput.log"),
            staging_root: root.join("staging"),
            retry: RetryPolicy::none(),
        })
    }

    const VALID: &str = "FrameTime\n16.0\n[platform],Windows\n";

    #[test]
    fn test_select_latest_prefers_newer() {
        let a = candidate("b/csvprofile_1.csv", 100);
        let b = candidate("a/csvprofile_2.csv", 200);
        assert_eq!(select_latest(&[a.clone(), b.clone()]), Some(&b));
        assert_eq!(select_latest(&[b.clone(), a]), Some(&b));
    }

    #[test]
    fn test_select_latest_tie_is_lexicographic() {
        let a = candidate("z/csvprofile.csv", 100);
        let b = candidate("a/csvprofile.csv", 100);
        assert_eq!(select_latest(&[a.clone(), b.clone()]).unwrap().path, b.path);
        assert_eq!(select_latest(&[b.clone(), a]).unwrap().path, b.path);
        assert!(select_latest(&[]).is_none());
    }

    #[test]
    fn test_discover_filters_marker_and_extension() {
        let tmp = TempDir::new().unwrap();
        let art = tmp.path().join("artifacts");
        std::fs::create_dir_all(art.join("Profiling/run1")).unwrap();
        std::fs::create_dir_all(art.join("Saved/Profiling")).unwrap();
        std::fs::write(art.join("Profiling/run1/CsvProfile_a.csv"), VALID).unwrap();
        std::fs::write(art.join("Profiling/run1/other.csv"), VALID).unwrap();
        std::fs::write(art.join("Saved/Profiling/csvprofile_b.txt"), VALID).unwrap();

        let found = collector(tmp.path()).discover(&art).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].path.ends_with("CsvProfile_a.csv"));
    }

    #[test]
    fn test_stage_copies_sample_and_log() {
        let tmp = TempDir::new().unwrap();
        let art = tmp.path().join("artifacts");
        std::fs::create_dir_all(art.join("Profiling")).unwrap();
        std::fs::write(art.join("Profiling/csvprofile_1.csv"), VALID).unwrap();
        std::fs::write(art.join("Profiling/csvprofile_bad.csv"), "FrameTime\n1\n").unwrap();
        std::fs::write(art.join("ClientOutput.log"), "LogInit: hello\n").unwrap();

        let c = collector(tmp.path());
        let staged = c.stage(4, &art).unwrap().unwrap();
        assert_eq!(staged.dir, tmp.path().join("staging/pass-004"));
        assert!(staged.csv_path.ends_with("csvprofile_1.csv"));
        assert!(staged.log_path.as_ref().unwrap().is_file());

        let listed = c.staged_samples().unwrap();
        assert_eq!(listed, vec![staged]);
    }

    #[test]
    fn test_stage_without_candidates_is_none() {
        let tmp = TempDir::new().unwrap();
        let c = collector(tmp.path());
        assert!(c.stage(0, &tmp.path().join("empty")).unwrap().is_none());
        assert!(c.staged_samples().unwrap().is_empty());
    }

    #[test]
    fn test_reset_staging_clears_previous_run() {
        let tmp = TempDir::new().unwrap();
        let c = collector(tmp.path());
        std::fs::create_dir_all(tmp.path().join("staging/pass-000")).unwrap();
        c.reset_staging().unwrap();
        assert!(!tmp.path().join("staging").exists());
        c.reset_staging().unwrap();
    }
}
