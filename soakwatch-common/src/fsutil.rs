//! File helpers shared by the collector, the cache and the exporter.
//!
//! All of them go through the bounded retry policy.

use std::fs;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::retry::{RetryPolicy, retry_io};

/// Create a directory and its parents. An existing directory is success.
pub fn ensure_dir(path: &Path, policy: &RetryPolicy) -> io::Result<()> {
    retry_io("create_dir", policy, || fs::create_dir_all(path))
}

/// Read a file that may legitimately be absent.
///
/// Returns `Ok(None)` when the file does not exist; other errors are retried.
pub fn read_optional(path: &Path, policy: &RetryPolicy) -> io::Result<Option<String>> {
    retry_io("read_file", policy, || match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    })
}

/// Copy `from` into `dest_dir`, keeping the file name. Returns the new path.
pub fn copy_into(from: &Path, dest_dir: &Path, policy: &RetryPolicy) -> io::Result<PathBuf> {
    let name = from.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", from.display()),
        )
    })?;
    let dest = dest_dir.join(name);
    retry_io("copy_file", policy, || fs::copy(from, &dest))?;
    Ok(dest)
}

/// Write `bytes` to `path` atomically: write a sibling temp file, then rename.
pub fn write_atomic(path: &Path, bytes: &[u8], policy: &RetryPolicy) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    retry_io("write_file", policy, || {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })
}

/// Append a single line to `path`, creating the file if needed.
///
/// A retried attempt first cuts the file back to where the first attempt
/// started, so a partly written or unsynced line is never left twice.
pub fn append_line(path: &Path, line: &str, policy: &RetryPolicy) -> io::Result<()> {
    let mut record = Vec::with_capacity(line.len() + 1);
    record.extend_from_slice(line.as_bytes());
    record.push(b'\n');
    let mut start = None;
    retry_io("append_line", policy, || {
        append_attempt(path, &record, &mut start)
    })
}

fn append_attempt(path: &Path, record: &[u8], start: &mut Option<u64>) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    let len = file.metadata()?.len();
    let offset = start.map_or(len, |s| s.min(len));
    *start = Some(offset);
    if len > offset {
        file.set_len(offset)?;
    }
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(record)?;
    file.sync_data()
}

/// Remove a directory tree. A missing directory is success.
pub fn remove_dir_all_if_exists(path: &Path, policy: &RetryPolicy) -> io::Result<()> {
    retry_io("remove_dir", policy, || match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    })
}

/// List every regular file under `root`, recursively. A missing root yields
/// an empty list. Symlinked directories are not followed.
pub fn walk_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}
