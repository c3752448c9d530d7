//! Four-level recovery cascade.
//!
//! # Architecture
//!
//! ```text
//! (task, error) ──> 1. Heuristic table ──> 2. Registry replay
//!                         │                        │
//!                         ▼                        ▼
//!                   3. Fallback regen  ──> 4. Oracle descriptor ──> exhausted
//! ```
//!
//! Levels are tried in order and the first one that applies a remediation
//! wins. The cascade never returns an error: every failure inside it is
//! logged and the next level is tried.

pub mod heuristics;
pub mod oracle_fix;
pub mod registry;
pub mod remediation;

use crate::artifact::fallback::{
    FallbackGenerator, FALLBACK_FILES, MANIFEST_PATH, README_PATH, SERVER_PATH, TESTS_PATH,
};
use crate::artifact::FileChange;
use crate::config::{OracleConfig, ProjectConfig};
use crate::llm::CodeOracle;
use crate::spec::Specification;
use heuristics::{FailureClass, HeuristicContext, HeuristicTable};
use registry::FixRegistry;
use remediation::{RemediationAction, RemediationContext};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which level produced a fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryLevel {
    Heuristic,
    Registry,
    Fallback,
    Oracle,
}

impl fmt::Display for RecoveryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Heuristic => "heuristic",
            Self::Registry => "registry",
            Self::Fallback => "fallback",
            Self::Oracle => "oracle",
        };
        write!(f, "{name}")
    }
}

/// Result of one cascade attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub fixed: bool,
    pub strategy: Option<RecoveryLevel>,
    pub action: String,
    pub changes: Vec<FileChange>,
}

impl RecoveryOutcome {
    fn fixed(level: RecoveryLevel, action: &RemediationAction, changes: Vec<FileChange>) -> Self {
        Self {
            fixed: true,
            strategy: Some(level),
            action: action.to_string(),
            changes,
        }
    }

    fn exhausted(reason: impl Into<String>) -> Self {
        Self {
            fixed: false,
            strategy: None,
            action: reason.into(),
            changes: Vec::new(),
        }
    }
}

/// Fallback artifacts tied to each task.
#[must_use]
pub fn fallback_paths_for(task_id: &str) -> &'static [&'static str] {
    match task_id {
        "generate" | "persist" | "validate-artifacts" => &[MANIFEST_PATH, SERVER_PATH],
        "generate-tests" | "run-tests" => &[TESTS_PATH],
        "docs" => &[README_PATH],
        _ => &[],
    }
}

/// Ordered recovery strategies for one run.
pub struct RecoveryCascade {
    spec: Specification,
    output_root: PathBuf,
    port: u16,
    fallback: FallbackGenerator,
    oracle: Option<Arc<dyn CodeOracle>>,
    oracle_config: OracleConfig,
    confidence_threshold: f64,
    heuristics: HeuristicTable,
    registry: FixRegistry,
}

impl fmt::Debug for RecoveryCascade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryCascade")
            .field("output_root", &self.output_root)
            .field("port", &self.port)
            .field("has_oracle", &self.oracle.is_some())
            .field("registry", &self.registry.len())
            .finish()
    }
}

impl RecoveryCascade {
    #[must_use]
    pub fn new(
        spec: Specification,
        output_root: impl Into<PathBuf>,
        config: &ProjectConfig,
    ) -> Self {
        Self {
            spec,
            output_root: output_root.into(),
            port: config.service.port,
            fallback: FallbackGenerator::new(
                config.service.port,
                config.service.health_path.clone(),
            ),
            oracle: None,
            oracle_config: config.oracle.clone(),
            confidence_threshold: config.loop_config.confidence_threshold,
            heuristics: HeuristicTable::new(),
            registry: FixRegistry::new(),
        }
    }

    /// Enable Level 4.
    #[must_use]
    pub fn with_oracle(mut self, oracle: Arc<dyn CodeOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &FixRegistry {
        &self.registry
    }

    /// Try every level in order. Never fails; `fixed == false` means exhausted.
    pub async fn attempt_recovery(
        &mut self,
        task_id: &str,
        error: &str,
        context: &str,
    ) -> RecoveryOutcome {
        let class = self.heuristics.classify(error);
        debug!("Recovering {} ({}): {}", task_id, class, first_line(error));

        if let Some(outcome) = self.try_heuristic(task_id, error).await {
            return outcome;
        }
        if let Some(outcome) = self.try_registry(task_id, error).await {
            return outcome;
        }
        if class == FailureClass::MalformedArtifact {
            if let Some(outcome) = self.try_fallback(task_id, error).await {
                return outcome;
            }
        }
        if let Some(outcome) = self.try_oracle(task_id, error, context).await {
            return outcome;
        }

        warn!("Recovery exhausted for {}", task_id);
        RecoveryOutcome::exhausted(format!("no strategy resolved: {}", first_line(error)))
    }

    fn remediation_context(&self) -> RemediationContext<'_> {
        RemediationContext {
            output_root: &self.output_root,
            spec: &self.spec,
            fallback: &self.fallback,
        }
    }

    async fn apply(&self, action: &RemediationAction) -> anyhow::Result<Vec<FileChange>> {
        action.apply(&self.remediation_context()).await
    }

    async fn try_heuristic(&self, task_id: &str, error: &str) -> Option<RecoveryOutcome> {
        let ctx = HeuristicContext {
            port: self.port,
            output_root: &self.output_root,
        };
        let matched = self.heuristics.find(task_id, error, &ctx)?;
        match self.apply(&matched.action).await {
            Ok(changes) => {
                info!("Heuristic {} fixed {}: {}", matched.rule, task_id, matched.action);
                Some(RecoveryOutcome::fixed(RecoveryLevel::Heuristic, &matched.action, changes))
            }
            Err(e) => {
                debug!("Heuristic {} did not apply: {}", matched.rule, e);
                None
            }
        }
    }

    async fn try_registry(&mut self, task_id: &str, error: &str) -> Option<RecoveryOutcome> {
        let action = self.registry.lookup(task_id, error)?.action.clone();
        match self.apply(&action).await {
            Ok(changes) => {
                self.registry.record_success(task_id, error);
                info!("Replayed stored fix for {}: {}", task_id, action);
                Some(RecoveryOutcome::fixed(RecoveryLevel::Registry, &action, changes))
            }
            Err(e) => {
                warn!("Stored fix for {} failed, poisoning it: {}", task_id, e);
                self.registry.poison(task_id, error);
                None
            }
        }
    }

    async fn try_fallback(&self, task_id: &str, error: &str) -> Option<RecoveryOutcome> {
        let owned = fallback_paths_for(task_id);
        if owned.is_empty() {
            return None;
        }
        let named: Vec<String> = FALLBACK_FILES
            .iter()
            .filter(|f| error.contains(**f))
            .map(|f| (*f).to_string())
            .collect();
        let paths = if named.is_empty() {
            owned.iter().map(|p| (*p).to_string()).collect()
        } else {
            named
        };

        let action = RemediationAction::RegenerateArtifacts { paths };
        match self.apply(&action).await {
            Ok(changes) => {
                info!("Fallback regenerated artifacts for {}", task_id);
                Some(RecoveryOutcome::fixed(RecoveryLevel::Fallback, &action, changes))
            }
            Err(e) => {
                debug!("Fallback regeneration failed: {}", e);
                None
            }
        }
    }

    async fn try_oracle(
        &mut self,
        task_id: &str,
        error: &str,
        context: &str,
    ) -> Option<RecoveryOutcome> {
        let oracle = self.oracle.clone()?;
        let descriptor = match oracle_fix::request_fix(
            oracle.as_ref(),
            task_id,
            error,
            context,
            &self.oracle_config,
        )
        .await
        {
            Ok(d) => d,
            Err(e) => {
                warn!("Oracle fix request failed for {}: {}", task_id, e);
                return None;
            }
        };

        if descriptor.confidence <= self.confidence_threshold {
            info!(
                "Oracle fix for {} below confidence threshold ({:.2} <= {:.2})",
                task_id, descriptor.confidence, self.confidence_threshold
            );
            return None;
        }

        match self.apply(&descriptor.action).await {
            Ok(changes) => {
                if descriptor.reusable {
                    self.registry.record(task_id, error, descriptor.action.clone());
                }
                info!("Oracle fixed {}: {}", task_id, descriptor.action);
                Some(RecoveryOutcome::fixed(RecoveryLevel::Oracle, &descriptor.action, changes))
            }
            Err(e) => {
                warn!("Oracle fix for {} failed to apply: {}", task_id, e);
                None
            }
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockOracle;
    use crate::testing::fixtures::order_specification;
    use tempfile::TempDir;

    fn cascade(root: &std::path::Path) -> RecoveryCascade {
        RecoveryCascade::new(order_specification(), root, &ProjectConfig::default())
    }

    fn replace_descriptor(confidence: f64, reusable: bool) -> String {
        serde_json::json!({
            "action": {"kind": "replace_in_file", "path": "src/app.js", "find": "BUG", "replace": "OK"},
            "confidence": confidence,
            "reusable": reusable,
            "explanation": "patch"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_heuristic_fix_never_calls_oracle() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("package.json"), "{\"name\":\"x\"}").unwrap();
        let oracle = Arc::new(MockOracle::new().with_response(&replace_descriptor(0.9, true)));
        let mut cascade = cascade(temp.path()).with_oracle(oracle.clone());

        let outcome = cascade
            .attempt_recovery("start-service", "Error: Cannot find module 'cors'", "")
            .await;
        assert!(outcome.fixed);
        assert_eq!(outcome.strategy, Some(RecoveryLevel::Heuristic));
        assert_eq!(oracle.call_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_artifact_uses_fallback() {
        let temp = TempDir::new().unwrap();
        let mut cascade = cascade(temp.path());
        let outcome = cascade
            .attempt_recovery(
                "validate-artifacts",
                "Malformed artifact: missing required artifact: src/server.js",
                "",
            )
            .await;
        assert!(outcome.fixed);
        assert_eq!(outcome.strategy, Some(RecoveryLevel::Fallback));
        assert!(temp.path().join("src/server.js").is_file());
        assert!(!temp.path().join("package.json").exists());
    }

    #[tokio::test]
    async fn test_low_confidence_oracle_fix_is_ignored() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src/app.js"), "BUG").unwrap();
        let oracle = Arc::new(MockOracle::new().with_response(&replace_descriptor(0.5, true)));
        let mut cascade = cascade(temp.path()).with_oracle(oracle.clone());

        let outcome = cascade.attempt_recovery("run-tests", "assertion failed", "").await;
        assert!(!outcome.fixed);
        assert_eq!(outcome.strategy, None);
        assert_eq!(oracle.call_count(), 1);
        assert!(cascade.registry().is_empty());
    }

    #[tokio::test]
    async fn test_registry_replay_then_poison() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("src/app.js");
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        std::fs::write(&file, "BUG").unwrap();
        let oracle = Arc::new(MockOracle::new().with_response(&replace_descriptor(0.9, true)));
        let mut cascade = cascade(temp.path()).with_oracle(oracle.clone());
        let error = "assertion failed: expected 2 orders";

        let first = cascade.attempt_recovery("run-tests", error, "").await;
        assert_eq!(first.strategy, Some(RecoveryLevel::Oracle));
        assert_eq!(oracle.call_count(), 1);

        std::fs::write(&file, "BUG").unwrap();
        let second = cascade.attempt_recovery("run-tests", error, "").await;
        assert_eq!(second.strategy, Some(RecoveryLevel::Registry));
        assert_eq!(oracle.call_count(), 1);

        // The file is already patched, so the replay fails and is poisoned.
        let third = cascade.attempt_recovery("run-tests", error, "").await;
        assert!(!third.fixed);
        assert!(cascade.registry().get("run-tests", error).unwrap().is_poisoned());
        assert_eq!(oracle.call_count(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_without_oracle() {
        let temp = TempDir::new().unwrap();
        let mut cascade = cascade(temp.path());
        let outcome = cascade.attempt_recovery("run-tests", "weird failure", "").await;
        assert!(!outcome.fixed);
        assert!(outcome.action.contains("weird failure"));
    }

    #[test]
    fn test_fallback_paths_for() {
        assert_eq!(fallback_paths_for("docs"), &[README_PATH]);
        assert!(fallback_paths_for("start-service").is_empty());
    }
}
