//! Branch-scoped suppression lists.
//!
//! A suppression list lives at
//! `<settings_root>/<branch with '/' replaced by '+'>/IgnoredIssueList.json`
//! and silently drops known warnings, errors and ensures for a test scope.
//! A missing file is the normal case and yields an empty list.
//!
//! Both a bare array of entries and `{ "entries": [...] }` are accepted.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use soakwatch_common::fsutil::read_optional;
use soakwatch_common::{
    ErrorCode, LogLevel, LogLine, RetryPolicy, SuppressionEntry, SuppressionKind,
};
use thiserror::Error;
use tracing::{info, warn};

/// File name of a branch suppression list.
pub const SUPPRESSION_FILE_NAME: &str = "IgnoredIssueList.json";

#[derive(Debug, Error)]
pub enum SuppressionError {
    #[error("failed to read suppression list {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse suppression list {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SuppressionFile {
    Entries(Vec<SuppressionEntry>),
    Wrapped { entries: Vec<SuppressionEntry> },
}

/// Location of the suppression list for `branch`.
pub fn suppression_path(settings_root: &Path, branch: &str) -> PathBuf {
    settings_root
        .join(branch.replace('/', "+"))
        .join(SUPPRESSION_FILE_NAME)
}

/// Ordered suppression entries, immutable for the duration of a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuppressionList {
    entries: Vec<SuppressionEntry>,
}

impl SuppressionList {
    pub fn new(entries: Vec<SuppressionEntry>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[SuppressionEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a suppression list from JSON text.
    pub fn from_json(text: &str, origin: &Path) -> Result<Self, SuppressionError> {
        let file: SuppressionFile =
            serde_json::from_str(text).map_err(|source| SuppressionError::Parse {
                path: origin.to_path_buf(),
                source,
            })?;
        let entries = match file {
            SuppressionFile::Entries(entries) | SuppressionFile::Wrapped { entries } => entries,
        };
        Ok(Self { entries })
    }

    /// Read the list at `path`. A missing file is an empty list.
    pub fn read(path: &Path, policy: &RetryPolicy) -> Result<Self, SuppressionError> {
        match read_optional(path, policy) {
            Ok(Some(text)) => Self::from_json(&text, path),
            Ok(None) => Ok(Self::empty()),
            Err(source) => Err(SuppressionError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Load the list for `branch`, degrading to an empty list on any error.
    ///
    /// Suppressions only ever hide issues, so an unreadable list means every
    /// issue stays visible.
    pub fn load_for_branch(settings_root: &Path, branch: &str, policy: &RetryPolicy) -> Self {
        let path = suppression_path(settings_root, branch);
        if !path.exists() {
            info!(path = %path.display(), "No suppression list found");
            return Self::empty();
        }
        match Self::read(&path, policy) {
            Ok(list) => {
                info!(
                    path = %path.display(),
                    entries = list.entries.len(),
                    "Loaded suppression list"
                );
                list
            }
            Err(e) => {
                warn!(
                    code = %ErrorCode::SuppressionParseError.code_string(),
                    error = %e,
                    "Ignoring unusable suppression list"
                );
                Self::empty()
            }
        }
    }

    /// Whether `line` is suppressed for `scope`.
    ///
    /// Each entry kind only matches lines of that kind (an ensure is an error
    /// line carrying the ensure marker). Matching is case-sensitive substring
    /// containment on the line text.
    pub fn is_suppressed(&self, scope: &str, line: &LogLine) -> bool {
        self.matching_entry(scope, line).is_some()
    }

    /// The first entry suppressing `line` for `scope`, if any.
    pub fn matching_entry(&self, scope: &str, line: &LogLine) -> Option<&SuppressionEntry> {
        self.entries.iter().find(|entry| {
            entry.applies_to_scope(scope)
                && kind_applies(entry.kind, line)
                && line.text.contains(&entry.pattern)
        })
    }
}

fn kind_applies(kind: SuppressionKind, line: &LogLine) -> bool {
    match kind {
        SuppressionKind::Ensure => line.is_ensure(),
        SuppressionKind::Error => line.level == LogLevel::Error,
        SuppressionKind::Warning => line.level == LogLevel::Warning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soakwatch_common::ENSURE_MARKER;
    use tempfile::TempDir;

    fn line(level: LogLevel, text: &str) -> LogLine {
        LogLine {
            channel: "LogTemp".to_string(),
            level,
            text: text.to_string(),
            sequence: 0,
        }
    }

    #[test]
    fn test_suppression_path_replaces_slashes() {
        let path = suppression_path(Path::new("/settings"), "release/5.4/hotfix");
        assert_eq!(
            path,
            PathBuf::from("/settings/release+5.4+hotfix/IgnoredIssueList.json")
        );
    }

    #[test]
    fn test_parse_both_shapes() {
        let bare = r#"[{"scope":"Soak","kind":"warning","pattern":"hitch"}]"#;
        let wrapped = r#"{"entries":[{"scope":"Soak","kind":"error","pattern":"x"}]}"#;
        let a = SuppressionList::from_json(bare, Path::new("a.json")).unwrap();
        let b = SuppressionList::from_json(wrapped, Path::new("b.json")).unwrap();
        assert_eq!(a.entries()[0].kind, SuppressionKind::Warning);
        assert_eq!(b.entries()[0].kind, SuppressionKind::Error);
    }

    #[test]
    fn test_kind_and_scope_must_match() {
        let list = SuppressionList::new(vec![
            SuppressionEntry::new("Soak", SuppressionKind::Warning, "texture streaming"),
            SuppressionEntry::new("*", SuppressionKind::Error, "shader compile"),
        ]);
        let warning = line(LogLevel::Warning, "texture streaming pool over budget");
        let error = line(LogLevel::Error, "texture streaming pool over budget");

        assert!(list.is_suppressed("Soak", &warning));
        assert!(!list.is_suppressed("Other", &warning));
        assert!(!list.is_suppressed("Soak", &error));
        assert!(list.is_suppressed("Other", &line(LogLevel::Error, "shader compile failed")));
    }

    #[test]
    fn test_ensure_entries_match_ensure_lines() {
        let list = SuppressionList::new(vec![SuppressionEntry::new(
            "Soak",
            SuppressionKind::Ensure,
            "IsValid(Actor)",
        )]);
        let ensure = line(
            LogLevel::Error,
            &format!("{ENSURE_MARKER}: IsValid(Actor) [File:Actor.cpp]"),
        );
        let plain = line(LogLevel::Error, "IsValid(Actor) returned false");
        assert!(list.is_suppressed("Soak", &ensure));
        assert!(!list.is_suppressed("Soak", &plain));
    }

    #[test]
    fn test_load_missing_is_empty() {
        let tmp = TempDir::new().unwrap();
        let list = SuppressionList::load_for_branch(tmp.path(), "main", &RetryPolicy::none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_load_invalid_degrades_to_empty() {
        let tmp = TempDir::new().unwrap();
        let path = suppression_path(tmp.path(), "dev/perf");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            SuppressionList::read(&path, &RetryPolicy::none()),
            Err(SuppressionError::Parse { .. })
        ));
        let list = SuppressionList::load_for_branch(tmp.path(), "dev/perf", &RetryPolicy::none());
        assert!(list.is_empty());
    }
}
