//! The bounded orchestration loop.
//!
//! Builds the fixed plan, then runs up to `maxIterations` passes over it.
//! Every failing task is funneled through the [`RecoveryCascade`]; a fixed
//! task is retried immediately within the same pass, an unfixed one stays
//! failed while the rest of the pass carries on. A snapshot is written after
//! every transition and the evolution log receives one cycle per generation,
//! per fixing recovery and per run.
//!
//! # Example
//!
//! ```rust,ignore
//! use autoforge::r#loop::{OrchestrationLoop, RunMode};
//!
//! let mut run = OrchestrationLoop::standard(&project_dir, spec, config, RunMode::Offline, None)?;
//! let report = run.run().await?;
//! println!("{} after {} iterations", report.outcome, report.iterations);
//! ```

use crate::artifact::FileChange;
use crate::audit::{CycleTrigger, EvolutionLog};
use crate::config::ProjectConfig;
use crate::error::{AutoforgeError, Result};
use crate::llm::CodeOracle;
use crate::r#loop::executor::{ServiceStepExecutor, StepExecutor};
use crate::r#loop::plan::{PlanStep, STANDARD_PLAN};
use crate::r#loop::state::{LoopPhase, RunMode};
use crate::r#loop::task_queue::{TaskQueue, TaskStatus, RECOVERY_MARKER};
use crate::reconcile::MultiLevelState;
use crate::recovery::RecoveryCascade;
use crate::snapshot::{ServiceInfo, Snapshot, SnapshotStore, TaskSnapshot};
use crate::spec::Specification;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    /// `Success` or `PartialFailure`.
    pub outcome: LoopPhase,
    /// Passes actually performed.
    pub iterations: u32,
    /// Plan task ids still pending or failed.
    pub remaining: Vec<String>,
    pub reconciliation: Option<MultiLevelState>,
}

impl RunReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == LoopPhase::Success
    }
}

/// Owns one run: queue, cascade, executor and persistence.
pub struct OrchestrationLoop {
    spec: Specification,
    config: ProjectConfig,
    mode: RunMode,
    run_id: String,
    queue: TaskQueue,
    phase: LoopPhase,
    iteration: u32,
    executor: Box<dyn StepExecutor>,
    cascade: RecoveryCascade,
    snapshots: SnapshotStore,
    audit: EvolutionLog,
}

impl OrchestrationLoop {
    #[must_use]
    pub fn new(
        spec: Specification,
        config: ProjectConfig,
        mode: RunMode,
        executor: Box<dyn StepExecutor>,
        cascade: RecoveryCascade,
        snapshots: SnapshotStore,
        audit: EvolutionLog,
    ) -> Self {
        Self {
            spec,
            config,
            mode,
            run_id: uuid::Uuid::new_v4().to_string(),
            queue: TaskQueue::new(),
            phase: LoopPhase::Planning,
            iteration: 0,
            executor,
            cascade,
            snapshots,
            audit,
        }
    }

    /// Wire the real executor, cascade and stores for a project directory.
    pub fn standard(
        project_dir: &Path,
        spec: Specification,
        config: ProjectConfig,
        mode: RunMode,
        oracle: Option<Arc<dyn CodeOracle>>,
    ) -> Result<Self> {
        let output_root = config.output_root(project_dir);
        let state_root = config.state_root(project_dir);

        let mut executor =
            ServiceStepExecutor::new(project_dir, spec.clone(), config.clone(), mode)?;
        let mut cascade = RecoveryCascade::new(spec.clone(), output_root, &config);
        if let Some(oracle) = oracle {
            executor = executor.with_oracle(oracle.clone());
            cascade = cascade.with_oracle(oracle);
        }

        Ok(Self::new(
            spec,
            config,
            mode,
            Box::new(executor),
            cascade,
            SnapshotStore::new(&state_root),
            EvolutionLog::new(&state_root),
        ))
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    #[must_use]
    pub fn cascade(&self) -> &RecoveryCascade {
        &self.cascade
    }

    #[must_use]
    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    /// Run to a terminal phase.
    ///
    /// # Errors
    ///
    /// Only programmer errors (unknown or duplicate task ids, illegal
    /// transitions) escape. Every step failure is handled inside the loop.
    pub async fn run(&mut self) -> Result<RunReport> {
        info!(
            "Run {} for '{}' ({} mode, up to {} iterations)",
            self.run_id, self.spec.name, self.mode, self.config.loop_config.max_iterations
        );
        for step in STANDARD_PLAN {
            self.queue.add(step.name(), step.id())?;
        }
        self.snapshot();
        self.set_phase(LoopPhase::Executing)?;

        for iteration in 1..=self.config.loop_config.max_iterations {
            if self.queue.unfinished().is_empty() {
                break;
            }
            self.iteration = iteration;
            info!("Iteration {}/{}", iteration, self.config.loop_config.max_iterations);

            if iteration > 1 {
                let failed: Vec<String> = self
                    .queue
                    .unfinished()
                    .iter()
                    .filter(|t| t.status == TaskStatus::Failed)
                    .map(|t| t.id.clone())
                    .collect();
                for id in failed {
                    self.queue.retry(&id)?;
                }
                self.snapshot();
            }

            for step in STANDARD_PLAN {
                let runnable = self
                    .queue
                    .task(step.id())
                    .is_some_and(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Failed));
                if runnable {
                    self.run_task(step).await?;
                }
            }
        }

        let remaining: Vec<String> = self.queue.unfinished().iter().map(|t| t.id.clone()).collect();
        let outcome = if remaining.is_empty() {
            LoopPhase::Success
        } else {
            LoopPhase::PartialFailure
        };
        self.set_phase(outcome)?;
        if !remaining.is_empty() {
            warn!("Budget exhausted with {} unfinished: {}", remaining.len(), remaining.join(", "));
        }

        if let Err(e) = self.audit.record(
            &self.run_id,
            CycleTrigger::RunCompleted,
            &outcome.to_string(),
            Vec::new(),
            self.executor.log_excerpts(),
        ) {
            warn!("Failed to append run cycle: {}", e);
        }
        if let Err(e) = self.executor.shutdown().await {
            warn!("Executor shutdown failed: {}", e);
        }

        Ok(RunReport {
            run_id: self.run_id.clone(),
            outcome,
            iterations: self.iteration,
            remaining,
            reconciliation: self.executor.reconciliation().cloned(),
        })
    }

    /// Execute one plan task, retrying it in place for as long as recovery fixes it.
    async fn run_task(&mut self, step: PlanStep) -> Result<()> {
        let id = step.id();
        loop {
            self.queue.start(id)?;
            self.snapshot();

            match self.executor.execute(step).await {
                Ok(report) => {
                    self.queue.done(id)?;
                    self.snapshot();
                    info!("✓ {} {}", id, report.note);
                    if step == PlanStep::Persist {
                        self.record_cycle(CycleTrigger::Generation, &report.note, report.changes);
                    }
                    return Ok(());
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    self.queue.fail(id, &error)?;
                    self.snapshot();
                    warn!("✗ {} failed: {}", id, error.lines().next().unwrap_or_default());

                    if !self.recover(step, &error).await? {
                        return Ok(());
                    }
                    self.queue.retry(id)?;
                    self.snapshot();
                }
            }
        }
    }

    /// Register a recovery entry and consult the cascade. Returns whether it fixed the task.
    async fn recover(&mut self, step: PlanStep, error: &str) -> Result<bool> {
        let id = step.id();
        let attempts = self.queue.recovery_count(id);
        if attempts >= self.config.loop_config.max_recovery_attempts as usize {
            info!("Recovery ceiling reached for {} ({} attempts)", id, attempts);
            return Ok(false);
        }

        let recovery_id = format!("{id}{RECOVERY_MARKER}{}", attempts + 1);
        self.queue.add(format!("Recover: {}", step.name()), recovery_id.as_str())?;
        self.queue.start(&recovery_id)?;
        self.set_phase(LoopPhase::Recovering)?;

        let context = self.executor.context_excerpt(step, error);
        let outcome = self.cascade.attempt_recovery(id, error, &context).await;

        if outcome.fixed {
            self.queue.done(&recovery_id)?;
            let level = outcome
                .strategy
                .map(|s| s.to_string())
                .unwrap_or_default();
            info!("Recovered {} via {}: {}", id, level, outcome.action);
            self.record_cycle(CycleTrigger::Recovery, &format!("{level}:{id}"), outcome.changes);
        } else {
            self.queue.fail(&recovery_id, outcome.action)?;
        }
        self.set_phase(LoopPhase::Executing)?;
        Ok(outcome.fixed)
    }

    fn set_phase(&mut self, next: LoopPhase) -> Result<()> {
        if self.phase == next {
            return Ok(());
        }
        if !self.phase.can_transition_to(next) {
            return Err(AutoforgeError::InvalidTransition {
                id: "loop".to_string(),
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Phase {} -> {}", self.phase, next);
        if next.is_terminal() {
            info!("Run {} finished: {}", self.run_id, next);
        }
        self.phase = next;
        self.snapshot();
        Ok(())
    }

    /// Append an audit cycle when any file actually changed.
    fn record_cycle(&self, trigger: CycleTrigger, detail: &str, changes: Vec<FileChange>) {
        let changes: Vec<FileChange> = changes
            .into_iter()
            .filter(FileChange::is_effective)
            .collect();
        if changes.is_empty() {
            return;
        }
        if let Err(e) = self
            .audit
            .record(&self.run_id, trigger, detail, changes, Vec::new())
        {
            warn!("Failed to append {} cycle: {}", trigger, e);
        }
    }

    fn snapshot(&self) {
        let snapshot = Snapshot {
            timestamp: Utc::now(),
            mode: self.mode,
            run_id: self.run_id.clone(),
            iteration: self.iteration,
            phase: self.phase,
            tasks: self.queue.tasks().iter().map(TaskSnapshot::from).collect(),
            specification: self.spec.clone(),
            service: ServiceInfo {
                port: self.config.service.port,
                output_dir: self.config.output_dir.display().to_string(),
            },
            reconciliation: self.executor.reconciliation().map(MultiLevelState::summary),
        };
        self.snapshots.write_best_effort(&snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ChangeAction;
    use crate::testing::fixtures::{order_specification, test_config};
    use crate::testing::mocks::ScriptedExecutor;
    use tempfile::TempDir;

    fn orchestration(
        temp: &TempDir,
        executor: ScriptedExecutor,
        max_iterations: u32,
    ) -> OrchestrationLoop {
        let mut config = test_config();
        config.loop_config.max_iterations = max_iterations;
        let output_root = config.output_root(temp.path());
        let state_root = config.state_root(temp.path());
        OrchestrationLoop::new(
            order_specification(),
            config.clone(),
            RunMode::Offline,
            Box::new(executor),
            RecoveryCascade::new(order_specification(), output_root, &config),
            SnapshotStore::new(&state_root),
            EvolutionLog::new(&state_root),
        )
        .with_run_id("run-test")
    }

    #[tokio::test]
    async fn test_clean_run_succeeds_in_one_pass() {
        let temp = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new();
        let mut run = orchestration(&temp, executor.clone(), 3);

        let report = run.run().await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.iterations, 1);
        assert_eq!(executor.executions(), STANDARD_PLAN.to_vec());
        assert_eq!(executor.shutdowns(), 1);

        let snapshot = SnapshotStore::new(temp.path().join(".autoforge")).load().unwrap().unwrap();
        assert_eq!(snapshot.phase, LoopPhase::Success);
        assert_eq!(snapshot.run_id, "run-test");
        assert!(snapshot.remaining().is_empty());
    }

    #[tokio::test]
    async fn test_heuristic_fix_retries_within_pass() {
        let temp = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new().fail_times(
            PlanStep::Docs,
            1,
            "ENOENT: no such file or directory, open 'docs/API.md'",
        );
        let mut run = orchestration(&temp, executor.clone(), 1);

        let report = run.run().await.unwrap();
        assert!(report.is_success());
        assert_eq!(executor.count(PlanStep::Docs), 2);
        assert!(temp.path().join("generated/docs").is_dir());

        let recovery = run.queue().task("docs:recovery-1").unwrap();
        assert_eq!(recovery.status, TaskStatus::Done);

        let cycles = EvolutionLog::new(temp.path().join(".autoforge")).read_cycles().unwrap();
        assert!(cycles
            .iter()
            .any(|c| c.trigger == CycleTrigger::Recovery && c.detail == "heuristic:docs"));
    }

    #[tokio::test]
    async fn test_unrecoverable_task_is_partial_failure() {
        let temp = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new().always_fail(PlanStep::RunTests, "1 failing");
        let mut run = orchestration(&temp, executor.clone(), 2);

        let report = run.run().await.unwrap();
        assert_eq!(report.outcome, LoopPhase::PartialFailure);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.remaining, vec!["run-tests".to_string()]);
        assert_eq!(executor.count(PlanStep::RunTests), 2);
        assert_eq!(executor.count(PlanStep::Docs), 1);
        assert_eq!(run.queue().recovery_count("run-tests"), 2);
        assert_eq!(
            run.queue().task("run-tests:recovery-2").unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_recovery_ceiling_bounds_cascade_calls() {
        let temp = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new().always_fail(PlanStep::Setup, "no runtime");
        let mut run = orchestration(&temp, executor.clone(), 5);

        let report = run.run().await.unwrap();
        assert_eq!(report.iterations, 5);
        assert_eq!(run.queue().recovery_count("setup"), 3);
        assert_eq!(executor.count(PlanStep::Setup), 5);
    }

    #[tokio::test]
    async fn test_persist_records_only_effective_changes() {
        let temp = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new().with_changes(
            PlanStep::Persist,
            vec![
                FileChange::new("src/server.js", ChangeAction::Created, "generated"),
                FileChange::new("README.md", ChangeAction::Unchanged, "generated"),
            ],
        );
        let mut run = orchestration(&temp, executor, 1);
        run.run().await.unwrap();

        let cycles = EvolutionLog::new(temp.path().join(".autoforge")).read_cycles().unwrap();
        let generation: Vec<_> = cycles
            .iter()
            .filter(|c| c.trigger == CycleTrigger::Generation)
            .collect();
        assert_eq!(generation.len(), 1);
        assert_eq!(generation[0].changes.len(), 1);
        assert_eq!(generation[0].changes[0].path, "src/server.js");
        assert_eq!(generation[0].detail, "persist ok");
    }

    #[tokio::test]
    async fn test_run_always_writes_audit_cycle() {
        let temp = TempDir::new().unwrap();
        let executor = ScriptedExecutor::new().always_fail(PlanStep::Generate, "oracle down");
        let mut run = orchestration(&temp, executor, 1);
        run.run().await.unwrap();

        let log = EvolutionLog::new(temp.path().join(".autoforge"));
        let cycles = log.read_cycles().unwrap();
        let last = cycles.last().unwrap();
        assert_eq!(last.trigger, CycleTrigger::RunCompleted);
        assert_eq!(last.detail, "partial-failure");
        assert_eq!(last.log_excerpts, vec!["[info] scripted run".to_string()]);
        assert!(log.verify().unwrap().is_valid);
    }
}
