//! Streaming session event reader
//!
//! Discovers `*.jsonl` transcripts under one or more source roots and yields
//! `SessionEvent`s lazily, one file at a time. Malformed lines are skipped and
//! counted, never fatal. Events seen through several files (a live tree and
//! its backup copy) are yielded once.

use crate::error::{BackfillError, RunWarning};
use crate::models::{EventKey, SessionEvent, TranscriptLine};
use crate::parsers::line_events::LineDeriver;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// A transcript file with the project slug derived from its path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub project: String,
}

/// Files discovered under the readable source roots
#[derive(Debug, Default)]
pub struct SourceSet {
    pub files: Vec<SourceFile>,
    pub readable_roots: usize,
    pub warnings: Vec<RunWarning>,
}

impl SourceSet {
    /// Walk every root, roots in the given order and files sorted within each root
    ///
    /// Fails with `NoReadableSource` only when none of the roots can be read.
    pub fn discover(roots: &[PathBuf]) -> Result<Self, BackfillError> {
        let mut set = SourceSet::default();

        for root in roots {
            let metadata = match fs::metadata(root) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %root.display(), error = %e, "Source root is not readable");
                    set.warnings.push(RunWarning::unreadable(root, &e));
                    continue;
                }
            };

            if metadata.is_file() {
                set.readable_roots += 1;
                set.files.push(SourceFile {
                    path: root.clone(),
                    project: project_slug(root, root),
                });
                continue;
            }

            if let Err(e) = fs::read_dir(root) {
                warn!(path = %root.display(), error = %e, "Source root is not readable");
                set.warnings.push(RunWarning::unreadable(root, &e));
                continue;
            }
            set.readable_roots += 1;

            let before = set.files.len();
            for entry in WalkDir::new(root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
            {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let path = e.path().unwrap_or(root.as_path()).to_path_buf();
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "Skipping unreadable directory entry"
                        );
                        let io_error = e
                            .into_io_error()
                            .unwrap_or_else(|| io::Error::other("filesystem loop"));
                        set.warnings.push(RunWarning::unreadable(&path, &io_error));
                        continue;
                    }
                };

                let path = entry.path();
                if entry.file_type().is_file()
                    && path.extension().map(|e| e == "jsonl").unwrap_or(false)
                {
                    set.files.push(SourceFile {
                        path: path.to_path_buf(),
                        project: project_slug(root, path),
                    });
                }
            }

            debug!(
                root = %root.display(),
                count = set.files.len() - before,
                "Discovered session files"
            );
        }

        if set.readable_roots == 0 {
            return Err(BackfillError::NoReadableSource {
                paths: roots.to_vec(),
            });
        }

        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Project slug of a transcript file
///
/// Format: `<root>/.../projects/-Users-foo-myproject/<session>.jsonl` gives
/// `-Users-foo-myproject`. Outside a `projects/` tree the first directory
/// below the root is used, then the parent directory name.
pub fn project_slug(root: &Path, path: &Path) -> String {
    let components: Vec<&str> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
        .collect();

    if let Some(pos) = components.iter().rposition(|c| *c == "projects") {
        // The slug must be a directory, not the file itself
        if pos + 2 < components.len() {
            return components[pos + 1].to_string();
        }
    }

    if let Ok(relative) = path.strip_prefix(root) {
        let mut parts = relative.components();
        if let (Some(Component::Normal(first)), Some(_)) = (parts.next(), parts.next()) {
            if let Some(first) = first.to_str() {
                return first.to_string();
            }
        }
    }

    let dir = if path.is_dir() { Some(path) } else { path.parent() };
    dir.and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Counters collected while reading
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub files_discovered: usize,
    pub files_read: usize,
    pub files_failed: usize,
    /// Non-blank lines read
    pub lines_read: usize,
    /// Lines that were not valid JSON transcript records
    pub lines_skipped: usize,
    /// Valid lines without a session id or timestamp
    pub lines_ignored: usize,
    pub events_emitted: usize,
    pub duplicates_dropped: usize,
    /// Events at or after the `before` cut-off
    pub events_filtered: usize,
}

/// Reader configuration, consumed by `events()`
#[derive(Debug)]
pub struct EventReader {
    sources: SourceSet,
    before: Option<DateTime<Utc>>,
    cancel: Option<CancellationToken>,
}

impl EventReader {
    pub fn new(sources: SourceSet) -> Self {
        Self {
            sources,
            before: None,
            cancel: None,
        }
    }

    /// Discover sources and build a reader in one step
    pub fn open(roots: &[PathBuf]) -> Result<Self, BackfillError> {
        Ok(Self::new(SourceSet::discover(roots)?))
    }

    /// Drop events at or after `before`
    pub fn with_before(mut self, before: Option<DateTime<Utc>>) -> Self {
        self.before = before;
        self
    }

    /// Stop before opening the next file once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn events(self) -> SessionEvents {
        let stats = ReadStats {
            files_discovered: self.sources.files.len(),
            ..ReadStats::default()
        };
        SessionEvents {
            files: self.sources.files.into_iter(),
            current: None,
            pending: VecDeque::new(),
            seen: HashSet::new(),
            before: self.before,
            cancel: self.cancel,
            cancelled: false,
            stats,
            warnings: self.sources.warnings,
        }
    }
}

/// Open transcript file being consumed line by line
struct FileCursor {
    path: PathBuf,
    project: String,
    reader: BufReader<File>,
    buf: Vec<u8>,
    line_number: usize,
    deriver: LineDeriver,
}

impl FileCursor {
    fn new(source: SourceFile, file: File) -> Self {
        Self {
            path: source.path,
            project: source.project,
            reader: BufReader::new(file),
            buf: Vec::new(),
            line_number: 0,
            deriver: LineDeriver::new(),
        }
    }

    /// Events of the next line that yields any, `None` at end of file
    fn next_events(&mut self, stats: &mut ReadStats) -> io::Result<Option<Vec<SessionEvent>>> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;

            let text = match std::str::from_utf8(&self.buf) {
                Ok(text) => text.trim(),
                Err(e) => {
                    stats.lines_read += 1;
                    stats.lines_skipped += 1;
                    trace!(
                        path = %self.path.display(),
                        line = self.line_number,
                        error = %e,
                        "Skipping non UTF-8 JSONL line"
                    );
                    continue;
                }
            };
            if text.is_empty() {
                continue;
            }
            stats.lines_read += 1;

            let line: TranscriptLine = match serde_json::from_str(text) {
                Ok(line) => line,
                Err(e) => {
                    stats.lines_skipped += 1;
                    trace!(
                        path = %self.path.display(),
                        line = self.line_number,
                        error = %e,
                        "Skipping malformed JSONL line"
                    );
                    continue;
                }
            };

            match self.deriver.derive(&line, &self.project) {
                Some(events) => return Ok(Some(events)),
                None => stats.lines_ignored += 1,
            }
        }
    }
}

/// Lazy, de-duplicated event stream over all discovered files
pub struct SessionEvents {
    files: std::vec::IntoIter<SourceFile>,
    current: Option<FileCursor>,
    pending: VecDeque<SessionEvent>,
    seen: HashSet<EventKey>,
    before: Option<DateTime<Utc>>,
    cancel: Option<CancellationToken>,
    cancelled: bool,
    stats: ReadStats,
    warnings: Vec<RunWarning>,
}

impl SessionEvents {
    pub fn stats(&self) -> &ReadStats {
        &self.stats
    }

    pub fn warnings(&self) -> &[RunWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<RunWarning> {
        std::mem::take(&mut self.warnings)
    }

    /// True when the stream ended because of cancellation
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn open_next_file(&mut self) -> bool {
        if self.cancelled {
            return false;
        }

        for source in self.files.by_ref() {
            if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                debug!(next = %source.path.display(), "Read cancelled between files");
                self.cancelled = true;
                return false;
            }

            match File::open(&source.path) {
                Ok(file) => {
                    trace!(
                        path = %source.path.display(),
                        project = %source.project,
                        "Reading session file"
                    );
                    self.current = Some(FileCursor::new(source, file));
                    return true;
                }
                Err(e) => {
                    warn!(path = %source.path.display(), error = %e, "Failed to open session file");
                    self.stats.files_failed += 1;
                    self.warnings.push(RunWarning::unreadable(&source.path, &e));
                }
            }
        }
        false
    }

    fn admit(&mut self, events: Vec<SessionEvent>) {
        for event in events {
            if self.before.is_some_and(|before| event.timestamp >= before) {
                self.stats.events_filtered += 1;
                continue;
            }
            if !self.seen.insert(event.key()) {
                self.stats.duplicates_dropped += 1;
                continue;
            }
            self.stats.events_emitted += 1;
            self.pending.push_back(event);
        }
    }
}

impl Iterator for SessionEvents {
    type Item = SessionEvent;

    fn next(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            if self.current.is_none() && !self.open_next_file() {
                return None;
            }
            let Some(cursor) = self.current.as_mut() else {
                continue;
            };

            match cursor.next_events(&mut self.stats) {
                Ok(Some(events)) => self.admit(events),
                Ok(None) => {
                    self.stats.files_read += 1;
                    self.current = None;
                }
                Err(e) => {
                    if let Some(cursor) = self.current.take() {
                        warn!(
                            path = %cursor.path.display(),
                            line = cursor.line_number,
                            error = %e,
                            "Failed to read session file, keeping lines read so far"
                        );
                        self.warnings.push(RunWarning::unreadable(&cursor.path, &e));
                    }
                    self.stats.files_failed += 1;
                }
            }
        }
    }
}
