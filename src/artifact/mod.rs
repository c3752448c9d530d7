//! Generated artifacts: parsing, persistence and validation.
//!
//! Both the oracle and the [`fallback::FallbackGenerator`] emit text made of
//! fenced code blocks, each tagged with a relative file path:
//!
//! ````text
//! ```js path=src/server.js
//! const express = require('express');
//! ```
//! ````
//!
//! [`parse_fenced_blocks`] turns that text into [`Artifact`]s and
//! [`persist`] writes them under an output root, reporting a [`FileChange`]
//! per file so the audit log can record what each cycle touched.

pub mod fallback;

use crate::error::{AutoforgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Files every generated service must contain.
pub const REQUIRED_FILES: &[&str] = &["package.json", "src/server.js"];

/// A single generated file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path relative to the output root.
    pub path: PathBuf,
    pub content: String,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// What persisting an artifact did to the file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Modified,
    Unchanged,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Modified => write!(f, "modified"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// One file touched by a generation or recovery cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: ChangeAction,
    pub reason: String,
}

impl FileChange {
    pub fn new(path: impl Into<String>, action: ChangeAction, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action,
            reason: reason.into(),
        }
    }

    /// Whether the file content actually changed.
    #[must_use]
    pub fn is_effective(&self) -> bool {
        self.action != ChangeAction::Unchanged
    }
}

/// Validate that a path is relative and stays inside the output root.
pub fn sanitize_relative(raw: &str) -> Result<PathBuf> {
    let trimmed = raw.trim().trim_start_matches("./");
    if trimmed.is_empty() {
        return Err(AutoforgeError::UnsafePath {
            path: raw.to_string(),
        });
    }
    let path = Path::new(trimmed);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(AutoforgeError::UnsafePath {
                    path: raw.to_string(),
                })
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(AutoforgeError::UnsafePath {
            path: raw.to_string(),
        });
    }
    Ok(clean)
}

/// Extract the file path from a fence info string such as
/// `js path=src/a.js`, `js:src/a.js` or `src/a.js`.
fn path_from_info(info: &str) -> Option<String> {
    let info = info.trim();
    if info.is_empty() {
        return None;
    }
    for token in info.split_whitespace() {
        for key in ["path=", "file=", "filename="] {
            if let Some(value) = token.strip_prefix(key) {
                return Some(value.trim_matches(|c| c == '"' || c == '\'').to_string());
            }
        }
    }
    let first = info.split_whitespace().next()?;
    if let Some((_, path)) = first.split_once(':') {
        if !path.is_empty() {
            return Some(path.to_string());
        }
    }
    if first.contains('/') || (first.contains('.') && !first.starts_with('.')) {
        return Some(first.to_string());
    }
    None
}

/// Extract a path from a leading `// file: x` or `# file: x` comment.
fn path_from_first_line(line: &str) -> Option<String> {
    let line = line.trim();
    let rest = line
        .strip_prefix("//")
        .or_else(|| line.strip_prefix('#'))
        .or_else(|| line.strip_prefix("<!--"))?;
    let rest = rest.trim().trim_end_matches("-->").trim();
    let rest = rest
        .strip_prefix("file:")
        .or_else(|| rest.strip_prefix("File:"))
        .or_else(|| rest.strip_prefix("path:"))?;
    let path = rest.trim();
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

/// Parse oracle or fallback output into artifacts.
///
/// Untagged blocks are ignored. Output with no tagged block, an unterminated
/// fence, or an unsafe path is a [`AutoforgeError::MalformedArtifact`] /
/// [`AutoforgeError::UnsafePath`].
pub fn parse_fenced_blocks(text: &str) -> Result<Vec<Artifact>> {
    let mut artifacts: Vec<Artifact> = Vec::new();
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        let opening = line.trim_start();
        let fence = backtick_run(opening);
        if fence < 3 {
            continue;
        }
        let info = &opening[fence..];

        let mut path = path_from_info(info);
        let mut body: Vec<&str> = Vec::new();
        let mut closed = false;
        let mut first = true;

        for inner in lines.by_ref() {
            let candidate = inner.trim();
            if candidate.len() >= fence && backtick_run(candidate) == candidate.len() {
                closed = true;
                break;
            }
            if first {
                first = false;
                if path.is_none() {
                    if let Some(p) = path_from_first_line(inner) {
                        path = Some(p);
                        continue;
                    }
                }
            }
            body.push(inner);
        }

        if !closed {
            return Err(AutoforgeError::malformed("unterminated code fence"));
        }

        if let Some(raw) = path {
            let clean = sanitize_relative(&raw)?;
            let mut content = body.join("\n");
            content.push('\n');
            // Last block for a path wins.
            artifacts.retain(|a| a.path != clean);
            artifacts.push(Artifact::new(clean, content));
        }
    }

    if artifacts.is_empty() {
        return Err(AutoforgeError::malformed(
            "no file blocks found in generated output",
        ));
    }
    Ok(artifacts)
}

/// Render artifacts in the fenced-block convention.
#[must_use]
pub fn render_fenced_blocks(artifacts: &[Artifact]) -> String {
    let mut out = String::new();
    for artifact in artifacts {
        let lang = artifact
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("text");
        // Fence must outrun any backtick run inside the content.
        let longest = artifact
            .content
            .split(|c| c != '`')
            .map(str::len)
            .max()
            .unwrap_or(0);
        let fence = "`".repeat(longest.max(2) + 1);
        out.push_str(&format!("{fence}{lang} path={}\n", artifact.path.display()));
        out.push_str(artifact.content.trim_end_matches('\n'));
        out.push_str(&format!("\n{fence}\n\n"));
    }
    out
}

/// Number of leading backticks.
fn backtick_run(line: &str) -> usize {
    line.bytes().take_while(|b| *b == b'`').count()
}

/// Write one file under `root`, reporting what changed.
pub fn write_file(root: &Path, relative: &Path, content: &str, reason: &str) -> Result<FileChange> {
    let clean = sanitize_relative(&relative.to_string_lossy())?;
    let target = root.join(&clean);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let action = match fs::read_to_string(&target) {
        Ok(existing) if existing == content => ChangeAction::Unchanged,
        Ok(_) => ChangeAction::Modified,
        Err(_) => ChangeAction::Created,
    };
    if action != ChangeAction::Unchanged {
        fs::write(&target, content)?;
    }
    Ok(FileChange::new(
        clean.to_string_lossy().to_string(),
        action,
        reason,
    ))
}

/// Persist every artifact under `root`.
pub fn persist(root: &Path, artifacts: &[Artifact], reason: &str) -> Result<Vec<FileChange>> {
    fs::create_dir_all(root)?;
    artifacts
        .iter()
        .map(|a| write_file(root, &a.path, &a.content, reason))
        .collect()
}

/// Required files missing from a set of artifacts.
#[must_use]
pub fn missing_required(artifacts: &[Artifact]) -> Vec<&'static str> {
    REQUIRED_FILES
        .iter()
        .copied()
        .filter(|req| !artifacts.iter().any(|a| a.path == Path::new(req)))
        .collect()
}

/// Check the persisted tree is a startable service.
pub fn validate_tree(root: &Path, health_path: &str) -> Result<()> {
    for required in REQUIRED_FILES {
        if !root.join(required).is_file() {
            return Err(AutoforgeError::malformed(format!(
                "missing required artifact: {required}"
            )));
        }
    }

    let manifest = fs::read_to_string(root.join("package.json"))?;
    serde_json::from_str::<serde_json::Value>(&manifest).map_err(|e| {
        AutoforgeError::malformed(format!("package.json is not valid JSON: {e}"))
    })?;

    let server = fs::read_to_string(root.join("src/server.js"))?;
    let quoted = [
        format!("'{health_path}'"),
        format!("\"{health_path}\""),
        format!("`{health_path}`"),
    ];
    if !quoted.iter().any(|q| server.contains(q.as_str())) {
        return Err(AutoforgeError::malformed(format!(
            "src/server.js does not register the health route {health_path}"
        )));
    }
    Ok(())
}
