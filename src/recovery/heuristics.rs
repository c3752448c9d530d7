//! Level-1 heuristics and failure classification.
//!
//! A fixed table of (error pattern, applicable tasks, remediation) rules.
//! Matching is pure text work with no external calls.

use super::remediation::RemediationAction;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Coarse failure taxonomy used to pick recovery levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Missing folder, busy port, stale build config.
    TransientInfra,
    /// Generated output is unusable or incomplete.
    MalformedArtifact,
    /// Nothing recognised.
    NovelFailure,
}

impl FailureClass {
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::TransientInfra => "Transient infrastructure failure",
            Self::MalformedArtifact => "Malformed artifact",
            Self::NovelFailure => "Novel failure",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

const MALFORMED_MARKERS: &[&str] = &[
    "Malformed artifact",
    "missing required artifact",
    "no file blocks found",
    "unterminated code fence",
    "is not valid JSON",
    "does not register the health route",
];

/// What a rule needs to build its remediation.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicContext<'a> {
    pub port: u16,
    pub output_root: &'a Path,
}

type Builder = fn(&Captures<'_>, &HeuristicContext<'_>) -> Option<RemediationAction>;
type RuleSpec = (&'static str, &'static str, &'static [&'static str], Builder);

/// One row of the table.
pub struct HeuristicRule {
    pub name: &'static str,
    pattern: Regex,
    /// Task ids the rule applies to; empty means any task.
    tasks: &'static [&'static str],
    build: Builder,
}

impl std::fmt::Debug for HeuristicRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeuristicRule")
            .field("name", &self.name)
            .field("pattern", &self.pattern.as_str())
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl HeuristicRule {
    fn applies_to(&self, task_id: &str) -> bool {
        self.tasks.is_empty() || self.tasks.contains(&task_id)
    }
}

/// A matched rule and the action it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicMatch {
    pub rule: &'static str,
    pub action: RemediationAction,
}

/// The Level-1 rule table.
#[derive(Debug)]
pub struct HeuristicTable {
    rules: Vec<HeuristicRule>,
}

impl Default for HeuristicTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicTable {
    #[must_use]
    pub fn new() -> Self {
        let rows: Vec<RuleSpec> = vec![
            (
                "missing-module",
                r"Cannot find module '([^']+)'",
                &["start-service", "verify-health", "run-tests"],
                missing_module,
            ),
            (
                "port-in-use",
                r"EADDRINUSE|address already in use",
                &["start-service", "verify-health", "run-tests"],
                port_in_use,
            ),
            (
                "strict-compiler",
                r"error TS\d+|strict mode",
                &["validate-artifacts", "start-service", "run-tests"],
                strict_compiler,
            ),
            ("missing-directory", r"ENOENT[^']*'([^']+)'", &[], missing_directory),
        ];

        Self {
            rules: compile(rows),
        }
    }

    /// First rule that matches and yields an action.
    #[must_use]
    pub fn find(
        &self,
        task_id: &str,
        error: &str,
        ctx: &HeuristicContext<'_>,
    ) -> Option<HeuristicMatch> {
        self.rules
            .iter()
            .filter(|rule| rule.applies_to(task_id))
            .find_map(|rule| {
                let caps = rule.pattern.captures(error)?;
                (rule.build)(&caps, ctx).map(|action| HeuristicMatch {
                    rule: rule.name,
                    action,
                })
            })
    }

    /// Whether any rule's pattern matches, regardless of task.
    #[must_use]
    pub fn recognizes(&self, error: &str) -> bool {
        self.rules.iter().any(|rule| rule.pattern.is_match(error))
    }

    /// Classify an error into the failure taxonomy.
    #[must_use]
    pub fn classify(&self, error: &str) -> FailureClass {
        if MALFORMED_MARKERS.iter().any(|m| error.contains(m)) {
            FailureClass::MalformedArtifact
        } else if self.recognizes(error) {
            FailureClass::TransientInfra
        } else {
            FailureClass::NovelFailure
        }
    }
}

/// Compile rule rows, skipping any whose pattern does not compile.
fn compile(rows: Vec<RuleSpec>) -> Vec<HeuristicRule> {
    rows
        .into_iter()
        .filter_map(|(name, pattern, tasks, build)| match Regex::new(pattern) {
            Ok(pattern) => Some(HeuristicRule {
                name,
                pattern,
                tasks,
                build,
            }),
            Err(e) => {
                warn!("Skipping heuristic rule '{}': invalid pattern: {}", name, e);
                None
            }
        })
        .collect()
}

fn missing_module(caps: &Captures<'_>, _ctx: &HeuristicContext<'_>) -> Option<RemediationAction> {
    let module = caps.get(1)?.as_str();
    if module.starts_with('.') || module.starts_with('/') || module.starts_with("node:") {
        return None;
    }
    Some(RemediationAction::AddDependency {
        name: package_of(module),
        version: "latest".to_string(),
    })
}

/// Package name of a module specifier (`lodash/fp` -> `lodash`, `@a/b/c` -> `@a/b`).
fn package_of(module: &str) -> String {
    let mut parts = module.split('/');
    match (parts.next(), parts.next()) {
        (Some(scope), Some(name)) if scope.starts_with('@') => format!("{scope}/{name}"),
        (Some(first), _) => first.to_string(),
        _ => module.to_string(),
    }
}

fn port_in_use(_caps: &Captures<'_>, ctx: &HeuristicContext<'_>) -> Option<RemediationAction> {
    Some(RemediationAction::FreePort { port: ctx.port })
}

fn strict_compiler(_caps: &Captures<'_>, _ctx: &HeuristicContext<'_>) -> Option<RemediationAction> {
    Some(RemediationAction::RelaxCompilerConfig)
}

fn missing_directory(caps: &Captures<'_>, ctx: &HeuristicContext<'_>) -> Option<RemediationAction> {
    let raw = Path::new(caps.get(1)?.as_str());
    let relative = if raw.is_absolute() {
        raw.strip_prefix(ctx.output_root).ok()?.to_path_buf()
    } else {
        raw.to_path_buf()
    };
    // A path with an extension names a file; its parent is what is missing.
    let dir = if relative.extension().is_some() {
        relative.parent()?.to_path_buf()
    } else {
        relative
    };
    let dir = dir.to_string_lossy().to_string();
    if dir.is_empty() || dir.split('/').any(|part| part == "..") {
        return None;
    }
    Some(RemediationAction::CreateDirectory { path: dir })
}
