//! Logs view: tails of the most recent log files, classified by substring.

use crate::config::LogConfig;
use crate::error::{AutoforgeError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;
use walkdir::WalkDir;

/// Number of log files inspected.
pub const RECENT_FILES: usize = 2;

/// Bytes read from the end of a log per requested line.
const TAIL_BYTES_PER_LINE: u64 = 1024;

const ERROR_MARKERS: &[&str] = &["error", "exception", "fatal", "unhandled", "failed"];
const WARNING_MARKERS: &[&str] = &["warn", "deprecated"];

/// Lines that make log drift an error rather than a warning.
pub const CRITICAL_MARKERS: &[&str] = &[
    "error TS",
    "Cannot find module",
    "Cannot find name",
    "UnhandledPromiseRejection",
    "Unhandled rejection",
    "ReferenceError",
    "TypeError",
    "SyntaxError",
    "Exception",
    "Failed to compile",
];

/// Classified log tail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsView {
    /// Inspected files, newest first.
    pub files: Vec<PathBuf>,
    /// Oldest first, so the last entry is the most recent.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub critical: Vec<String>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl LogsView {
    /// Last `n` error and warning lines, for audit excerpts.
    #[must_use]
    pub fn excerpts(&self, n: usize) -> Vec<String> {
        let mut lines: Vec<String> = self
            .errors
            .iter()
            .chain(self.warnings.iter())
            .cloned()
            .collect();
        let start = lines.len().saturating_sub(n);
        lines.drain(..start);
        lines
    }
}

/// Reads and classifies log files.
#[derive(Debug)]
pub struct LogInspector {
    dir: PathBuf,
    patterns: GlobSet,
    tail_lines: usize,
    timestamp: Option<Regex>,
}

impl LogInspector {
    pub fn new(dir: impl Into<PathBuf>, config: &LogConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| AutoforgeError::invalid_config("logs.patterns", e.to_string()))?;
            builder.add(glob);
        }
        let patterns = builder
            .build()
            .map_err(|e| AutoforgeError::invalid_config("logs.patterns", e.to_string()))?;
        Ok(Self {
            dir: dir.into(),
            patterns,
            tail_lines: config.tail_lines,
            timestamp: Regex::new(
                r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
            )
            .ok(),
        })
    }

    /// The most recent log files, newest first.
    fn recent_files(&self) -> Vec<(PathBuf, SystemTime)> {
        if !self.dir.is_dir() {
            return Vec::new();
        }
        let mut files: Vec<(PathBuf, SystemTime)> = WalkDir::new(&self.dir)
            .max_depth(2)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| self.patterns.is_match(e.file_name()))
            .filter_map(|e| {
                let modified = e.metadata().ok()?.modified().ok()?;
                Some((e.into_path(), modified))
            })
            .collect();
        files.sort_by(|a, b| b.1.cmp(&a.1));
        files.truncate(RECENT_FILES);
        files
    }

    fn parse_timestamp(&self, line: &str) -> Option<DateTime<Utc>> {
        let raw = self.timestamp.as_ref()?.find(line)?.as_str();
        if let Ok(dt) = DateTime::parse_from_rfc3339(&raw.replacen(' ', "T", 1)) {
            return Some(dt.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(|naive| naive.and_utc())
    }

    /// Build the logs view. A missing directory is an empty view.
    #[must_use]
    pub fn inspect(&self) -> LogsView {
        self.view_of(&self.recent_files())
    }

    /// Classify the tails of `recent` (newest first). Unreadable files are skipped.
    fn view_of(&self, recent: &[(PathBuf, SystemTime)]) -> LogsView {
        let mut view = LogsView::default();

        // Oldest first so later lines are more recent.
        for (path, _) in recent.iter().rev() {
            let lines = match tail(path, self.tail_lines) {
                Ok(lines) => lines,
                Err(e) => {
                    warn!("Skipping unreadable log {}: {}", path.display(), e);
                    continue;
                }
            };
            view.files.insert(0, path.clone());
            for line in lines {
                self.classify(&line, &mut view);
            }
        }

        if view.last_activity.is_none() {
            view.last_activity = recent
                .iter()
                .find(|(path, _)| view.files.contains(path))
                .map(|(_, modified)| DateTime::<Utc>::from(*modified));
        }
        view
    }

    fn classify(&self, line: &str, view: &mut LogsView) {
        if let Some(ts) = self.parse_timestamp(line) {
            view.last_activity = Some(ts);
        }
        let lower = line.to_ascii_lowercase();
        if CRITICAL_MARKERS.iter().any(|m| line.contains(m)) {
            view.critical.push(line.to_string());
        }
        if ERROR_MARKERS.iter().any(|m| lower.contains(m)) {
            view.errors.push(line.to_string());
        } else if WARNING_MARKERS.iter().any(|m| lower.contains(m)) {
            view.warnings.push(line.to_string());
        }
    }
}

/// Last `lines` non-empty lines, reading only the end of the file.
fn tail(path: &Path, lines: usize) -> std::io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let window = TAIL_BYTES_PER_LINE.saturating_mul(lines as u64);
    let start = len.saturating_sub(window);
    file.seek(SeekFrom::Start(start))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let text = String::from_utf8_lossy(&bytes);
    let mut all: Vec<&str> = text.lines().collect();
    if start > 0 && !all.is_empty() {
        // First line was cut by the seek.
        all.remove(0);
    }
    all.retain(|l| !l.trim().is_empty());
    let from = all.len().saturating_sub(lines);
    Ok(all[from..].iter().map(|l| (*l).to_string()).collect())
}
