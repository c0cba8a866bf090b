//! Incremental tailing of a growing client log.
//!
//! Log lines follow the convention `<Channel>: <Level>: <text>` or
//! `<Channel>: <text>` (info level), optionally preceded by a
//! `[timestamp][frame]` decoration. Lines without a recognised channel prefix
//! belong to [`DEFAULT_CHANNEL`] at info level.
//!
//! Only complete lines (terminated by `\n`) are ever returned. A partial last
//! line is held back until the writer finishes it.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use soakwatch_common::{DEFAULT_CHANNEL, LogLevel, LogLine};
use tracing::{debug, warn};

const DECORATION_PATTERN: &str = r"^\[[^\]]*\]\[\s*\d+\]";
const PREFIX_PATTERN: &str =
    r"^([A-Za-z_][A-Za-z0-9_]*): (?:(Error|Warning|Display|Log|Verbose|VeryVerbose|Fatal): )?(.*)$";

fn decoration_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DECORATION_PATTERN).ok()).as_ref()
}

fn prefix_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PREFIX_PATTERN).ok()).as_ref()
}

/// Parse one raw line (without its terminator) into a [`LogLine`].
pub fn parse_line(raw: &str, sequence: usize) -> LogLine {
    let raw = raw.strip_suffix('\r').unwrap_or(raw);
    let body = match decoration_regex().and_then(|re| re.find(raw)) {
        Some(m) => &raw[m.end()..],
        None => raw,
    };

    if let Some(caps) = prefix_regex().and_then(|re| re.captures(body)) {
        let channel = caps.get(1).map_or(DEFAULT_CHANNEL, |m| m.as_str());
        let level = caps
            .get(2)
            .and_then(|m| LogLevel::from_token(m.as_str()))
            .unwrap_or(LogLevel::Info);
        let text = caps.get(3).map_or("", |m| m.as_str());
        return LogLine {
            channel: channel.to_string(),
            level,
            text: text.to_string(),
            sequence,
        };
    }

    LogLine {
        channel: DEFAULT_CHANNEL.to_string(),
        level: LogLevel::Info,
        text: body.to_string(),
        sequence,
    }
}

/// Length in bytes of the complete-line prefix of `bytes`.
fn complete_len(bytes: &[u8]) -> usize {
    memchr::memrchr(b'\n', bytes).map_or(0, |idx| idx + 1)
}

fn selects(channel: Option<&str>, line: &LogLine) -> bool {
    channel.is_none_or(|c| c == line.channel)
}

/// Parse every complete line of `chunk`, numbering from `first_sequence`.
/// Returns the number of complete lines seen (all channels).
fn parse_complete(
    chunk: &str,
    channel: Option<&str>,
    first_sequence: usize,
    out: &mut Vec<LogLine>,
) -> usize {
    let mut seen = 0;
    for raw in chunk.split_terminator('\n') {
        let line = parse_line(raw, first_sequence + seen);
        seen += 1;
        if selects(channel, &line) {
            out.push(line);
        }
    }
    seen
}

/// Lines of `channel` (every channel when `None`) that were appended after
/// the first `since` such lines.
///
/// `since` counts lines of the selected channel, so callers advance it by the
/// length of each returned batch. A trailing partial line is not returned.
pub fn extract_new_lines(text: &str, channel: Option<&str>, since: usize) -> Vec<LogLine> {
    let complete = &text[..complete_len(text.as_bytes())];
    let mut lines = Vec::new();
    parse_complete(complete, channel, 0, &mut lines);
    if since >= lines.len() {
        return Vec::new();
    }
    lines.split_off(since)
}

/// A source of appended log bytes.
pub trait LogStream {
    /// Bytes appended since the previous call. An empty vector means nothing
    /// new yet.
    fn read_appended(&mut self) -> io::Result<Vec<u8>>;

    /// Human-readable name used in diagnostics.
    fn describe(&self) -> String;
}

/// Tails a file on disk by byte offset.
///
/// A file that does not exist yet reads as empty. A file that shrinks is
/// treated as rewritten and read again from the start.
#[derive(Debug)]
pub struct FileLogStream {
    path: PathBuf,
    offset: u64,
}

impl FileLogStream {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            offset: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogStream for FileLogStream {
    fn read_appended(&mut self) -> io::Result<Vec<u8>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            warn!(
                path = %self.path.display(),
                offset = self.offset,
                len,
                "Log file shrank, reading from the start"
            );
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut buf)?;
        self.offset += buf.len() as u64;
        Ok(buf)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// An in-memory log shared between a writer and a stream.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw text. Lines are only visible once terminated.
    pub fn append(&self, text: &str) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.extend_from_slice(text.as_bytes());
    }

    /// Append one complete line.
    pub fn append_line(&self, line: &str) {
        self.append(line);
        self.append("\n");
    }

    /// Full contents written so far.
    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// A stream reading this log from the start.
    pub fn stream(&self) -> MemoryLogStream {
        MemoryLogStream {
            log: self.clone(),
            offset: 0,
        }
    }
}

/// Stream over a [`MemoryLog`].
#[derive(Debug)]
pub struct MemoryLogStream {
    log: MemoryLog,
    offset: usize,
}

impl LogStream for MemoryLogStream {
    fn read_appended(&mut self) -> io::Result<Vec<u8>> {
        let buffer = self.log.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let new = buffer.get(self.offset..).unwrap_or_default().to_vec();
        self.offset = buffer.len();
        Ok(new)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Stateful reader over a [`LogStream`].
///
/// Keeps every parsed line of the selected channel so that callers can ask
/// for "everything after line N" without re-reading the stream. Lines of
/// every channel are kept as well for whole-log checks.
pub struct LogTailReader {
    stream: Box<dyn LogStream>,
    channel: Option<String>,
    pending: Vec<u8>,
    lines: Vec<LogLine>,
    all_lines: Vec<LogLine>,
    drained: bool,
}

impl LogTailReader {
    pub fn new(stream: Box<dyn LogStream>, channel: Option<String>) -> Self {
        Self {
            stream,
            channel,
            pending: Vec::new(),
            lines: Vec::new(),
            all_lines: Vec::new(),
            drained: false,
        }
    }

    /// Pull appended bytes and parse every newly completed line.
    /// Returns the number of new lines of the selected channel.
    pub fn poll(&mut self) -> io::Result<usize> {
        if self.drained {
            return Ok(0);
        }
        let appended = self.stream.read_appended()?;
        if appended.is_empty() {
            return Ok(0);
        }
        self.pending.extend_from_slice(&appended);

        let cut = complete_len(&self.pending);
        if cut == 0 {
            return Ok(0);
        }
        let rest = self.pending.split_off(cut);
        let complete = std::mem::replace(&mut self.pending, rest);
        Ok(self.ingest(&complete))
    }

    fn ingest(&mut self, complete: &[u8]) -> usize {
        let text = String::from_utf8_lossy(complete);
        let first = self.all_lines.len();
        parse_complete(&text, None, first, &mut self.all_lines);

        let channel = self.channel.as_deref();
        let before = self.lines.len();
        self.lines.extend(
            self.all_lines[first..]
                .iter()
                .filter(|line| selects(channel, line))
                .cloned(),
        );
        let added = self.lines.len() - before;
        if added > 0 {
            debug!(
                source = %self.stream.describe(),
                added,
                total = self.lines.len(),
                "Parsed new log lines"
            );
        }
        added
    }

    /// Poll, then return the selected lines after the first `since`.
    pub fn extract_new_lines(&mut self, since: usize) -> io::Result<&[LogLine]> {
        self.poll()?;
        Ok(self.lines_since(since))
    }

    /// Already-parsed lines after the first `since`.
    pub fn lines_since(&self, since: usize) -> &[LogLine] {
        self.lines.get(since..).unwrap_or_default()
    }

    /// Name of the underlying stream.
    pub fn source(&self) -> String {
        self.stream.describe()
    }

    /// Every line of the selected channel parsed so far.
    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    /// Every line parsed so far, whatever its channel.
    pub fn all_lines(&self) -> &[LogLine] {
        &self.all_lines
    }

    /// Read everything that is left and treat an unterminated tail as a final
    /// line. Used once the writer has exited.
    pub fn drain(&mut self) -> io::Result<&[LogLine]> {
        self.poll()?;
        if !self.drained && !self.pending.is_empty() {
            let mut tail = std::mem::take(&mut self.pending);
            tail.push(b'\n');
            self.ingest(&tail);
        }
        self.drained = true;
        Ok(&self.lines)
    }
}

impl std::fmt::Debug for LogTailReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTailReader")
            .field("source", &self.stream.describe())
            .field("channel", &self.channel)
            .field("lines", &self.lines.len())
            .field("all_lines", &self.all_lines.len())
            .field("pending_bytes", &self.pending.len())
            .finish()
    }
}
