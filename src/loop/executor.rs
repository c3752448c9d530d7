//! Dispatch of plan steps to their collaborators.
//!
//! [`StepExecutor`] is the seam between the orchestration loop and the
//! outside world. [`ServiceStepExecutor`] is the real implementation: it
//! owns the generated service process (a per-run singleton), the pending
//! generated artifacts and the last reconciliation result.

use crate::artifact::fallback::{FallbackGenerator, MANIFEST_PATH, README_PATH, TESTS_PATH};
use crate::artifact::{self, Artifact, FileChange};
use crate::config::ProjectConfig;
use crate::error::AutoforgeError;
use crate::llm::{prompts, CodeOracle};
use crate::r#loop::plan::PlanStep;
use crate::r#loop::state::RunMode;
use crate::reconcile::service_probe::{HttpServiceProbe, ServiceProbe};
use crate::reconcile::source_probe::{RegexSourceProbe, SourceCodeProbe};
use crate::reconcile::{MultiLevelState, StateReconciler};
use crate::service::{tail_lines, ProcessSupervisor, ServiceHandle, ShellSupervisor};
use crate::spec::{MustHave, Specification};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// File the service's stdout and stderr are appended to.
pub const SERVICE_LOG: &str = "service.log";

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const OUTPUT_TAIL_LINES: usize = 40;

/// What a successful step did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub changes: Vec<FileChange>,
    pub note: String,
}

impl StepReport {
    #[must_use]
    pub fn note(note: impl Into<String>) -> Self {
        Self {
            changes: Vec::new(),
            note: note.into(),
        }
    }

    #[must_use]
    pub fn with_changes(changes: Vec<FileChange>, note: impl Into<String>) -> Self {
        Self {
            changes,
            note: note.into(),
        }
    }
}

/// Executes plan steps. Errors are handed to the recovery cascade by the loop.
#[async_trait]
pub trait StepExecutor: Send {
    /// Run one step. Must be safe to call again after a failure.
    async fn execute(&mut self, step: PlanStep) -> Result<StepReport>;

    /// Extra context for an oracle fix request.
    fn context_excerpt(&self, _step: PlanStep, _error: &str) -> String {
        String::new()
    }

    /// Recent log lines for the audit log.
    fn log_excerpts(&self) -> Vec<String> {
        Vec::new()
    }

    /// Latest reconciliation result, if the reconcile step has run.
    fn reconciliation(&self) -> Option<&MultiLevelState> {
        None
    }

    /// Release resources at the end of a run.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Real step executor.
pub struct ServiceStepExecutor {
    spec: Specification,
    config: ProjectConfig,
    mode: RunMode,
    output_root: PathBuf,
    state_root: PathBuf,
    log_root: PathBuf,
    oracle: Option<Arc<dyn CodeOracle>>,
    supervisor: Arc<dyn ProcessSupervisor>,
    probe: Arc<dyn ServiceProbe>,
    reconciler: StateReconciler,
    fallback: FallbackGenerator,
    pending: Vec<Artifact>,
    generated_by: String,
    handle: Option<ServiceHandle>,
    last_output: String,
    reconciliation: Option<MultiLevelState>,
}

impl std::fmt::Debug for ServiceStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceStepExecutor")
            .field("spec", &self.spec.name)
            .field("mode", &self.mode)
            .field("output_root", &self.output_root)
            .field("handle", &self.handle)
            .finish()
    }
}

impl ServiceStepExecutor {
    /// Executor with the shell supervisor and the HTTP probe.
    pub fn new(
        project_dir: &Path,
        spec: Specification,
        config: ProjectConfig,
        mode: RunMode,
    ) -> crate::error::Result<Self> {
        let output_root = config.output_root(project_dir);
        let probe: Arc<dyn ServiceProbe> = Arc::new(HttpServiceProbe::new(
            config.service.base_url(),
            config.service.health_path.clone(),
            config.probe.timeout(),
        ));
        let reconciler = StateReconciler::new(spec.clone(), &output_root, &config)?
            .with_service_probe(probe.clone());
        Ok(Self {
            state_root: config.state_root(project_dir),
            log_root: config.log_root(project_dir),
            fallback: FallbackGenerator::new(
                config.service.port,
                config.service.health_path.clone(),
            ),
            output_root,
            spec,
            mode,
            oracle: None,
            supervisor: Arc::new(ShellSupervisor::new()),
            probe,
            reconciler,
            pending: Vec::new(),
            generated_by: String::new(),
            handle: None,
            last_output: String::new(),
            reconciliation: None,
            config,
        })
    }

    #[must_use]
    pub fn with_oracle(mut self, oracle: Arc<dyn CodeOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Probe used for startup polling, health checks and reconciliation.
    #[must_use]
    pub fn with_service_probe(mut self, probe: Arc<dyn ServiceProbe>) -> Self {
        self.reconciler = self.reconciler.with_service_probe(probe.clone());
        self.probe = probe;
        self
    }

    fn env(&self) -> Vec<(String, String)> {
        vec![
            ("PORT".to_string(), self.config.service.port.to_string()),
            ("BASE_URL".to_string(), self.config.service.base_url()),
        ]
    }

    fn service_log_tail(&self) -> String {
        std::fs::read_to_string(self.log_root.join(SERVICE_LOG))
            .map(|text| tail_lines(&text, OUTPUT_TAIL_LINES))
            .unwrap_or_default()
    }

    async fn stop_service(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.supervisor.stop(&handle).await {
                warn!("Failed to stop service #{}: {}", handle.id, e);
            }
        }
    }

    fn setup(&self) -> Result<StepReport> {
        for dir in [&self.output_root, &self.state_root, &self.log_root] {
            std::fs::create_dir_all(dir)?;
        }
        for tool in &self.config.service.required_tools {
            if which::which(tool).is_err() {
                return Err(AutoforgeError::MissingTool { tool: tool.clone() }.into());
            }
        }
        Ok(StepReport::note("environment ready"))
    }

    fn materialize_spec(&self) -> Result<StepReport> {
        let json = serde_json::to_string_pretty(&self.spec)? + "\n";
        let change = artifact::write_file(
            &self.state_root,
            Path::new("specification.json"),
            &json,
            "materialized specification",
        )?;
        Ok(StepReport::note(format!("specification {}", change.action)))
    }

    fn validate_plan(&self) -> Result<StepReport> {
        self.spec.validate()?;
        let planned = self.spec.planned_endpoints(&self.config.service.health_path);
        Ok(StepReport::note(format!("{} endpoints planned", planned.len())))
    }

    async fn generate(&mut self) -> Result<StepReport> {
        if self.mode == RunMode::Oracle {
            match self.oracle.clone() {
                Some(oracle) => {
                    let request = prompts::generation_request(
                        &self.spec,
                        self.config.service.port,
                        &self.config.service.health_path,
                        &self.config.oracle,
                    );
                    let parsed = oracle
                        .generate(&request)
                        .await
                        .map_err(|e| AutoforgeError::oracle(e.to_string()))
                        .and_then(|text| artifact::parse_fenced_blocks(&text));
                    match parsed {
                        Ok(artifacts) => {
                            let missing = artifact::missing_required(&artifacts);
                            if !missing.is_empty() {
                                warn!("Oracle output lacks {}", missing.join(", "));
                            }
                            let note = format!(
                                "{} artifacts from {}",
                                artifacts.len(),
                                oracle.model_name()
                            );
                            self.pending = artifacts;
                            self.generated_by = oracle.model_name().to_string();
                            return Ok(StepReport::note(note));
                        }
                        Err(e) => warn!("Oracle generation failed, using fallback: {}", e),
                    }
                }
                None => warn!("No oracle available, using fallback"),
            }
        }

        self.pending = self.fallback.generate_artifacts(&self.spec)?;
        self.generated_by = "fallback".to_string();
        Ok(StepReport::note(format!("{} artifacts from fallback", self.pending.len())))
    }

    fn persist(&self) -> Result<StepReport> {
        if self.pending.is_empty() {
            bail!("no generated artifacts to persist");
        }
        let reason = format!("generated by {}", self.generated_by);
        let changes = artifact::persist(&self.output_root, &self.pending, &reason)?;
        let effective = changes.iter().filter(|c| c.is_effective()).count();
        Ok(StepReport::with_changes(
            changes,
            format!("{effective} files written by {}", self.generated_by),
        ))
    }

    async fn start_service(&mut self) -> Result<StepReport> {
        self.stop_service().await;
        let env = self.env();
        let cwd = self.output_root.clone();
        let install = self.config.service.install_command.trim().to_string();

        if !install.is_empty() && cwd.join(MANIFEST_PATH).is_file() {
            let out = self
                .supervisor
                .run(&install, &cwd, &env, self.config.service.command_timeout())
                .await?;
            self.last_output = out.tail(OUTPUT_TAIL_LINES);
            if !out.success() {
                bail!("`{}` failed (exit {}):\n{}", install, out.exit_code, self.last_output);
            }
        }

        let start = self.config.service.start_command.clone();
        let handle = self
            .supervisor
            .start(&start, &cwd, &env, &self.log_root.join(SERVICE_LOG))
            .await?;
        self.handle = Some(handle.clone());

        let timeout = self.config.service.startup_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if !self.supervisor.is_running(&handle).await {
                self.stop_service().await;
                bail!("service exited during startup:\n{}", self.service_log_tail());
            }
            let health = self.probe.liveness().await;
            if health.healthy {
                info!("Service healthy on port {}", self.config.service.port);
                return Ok(StepReport::note(format!("service #{} started", handle.id)));
            }
            if Instant::now() >= deadline {
                self.stop_service().await;
                bail!(
                    "service did not become healthy within {}s:\n{}",
                    timeout.as_secs(),
                    self.service_log_tail()
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn verify_health(&self) -> Result<StepReport> {
        let health = self.probe.liveness().await;
        if !health.healthy {
            let detail = if health.running {
                health.detail
            } else {
                format!("not running ({})", health.detail)
            };
            bail!(
                "health check on {} failed: {}",
                self.config.service.health_path,
                detail
            );
        }
        Ok(StepReport::note("healthy"))
    }

    fn write_fallback_if_absent(&self, path: &str, reason: &str) -> Result<StepReport> {
        if self.output_root.join(path).is_file() {
            return Ok(StepReport::note(format!("{path} already present")));
        }
        let artifacts = self.fallback.artifacts_named(&self.spec, &[path.to_string()]);
        let changes = artifact::persist(&self.output_root, &artifacts, reason)?;
        Ok(StepReport::with_changes(changes, format!("{path} written")))
    }

    async fn run_tests(&mut self) -> Result<StepReport> {
        let command = self.config.service.test_command.trim().to_string();
        if command.is_empty() {
            return Ok(StepReport::note("no test command configured"));
        }
        let env = self.env();
        let out = self
            .supervisor
            .run(&command, &self.output_root, &env, self.config.service.command_timeout())
            .await?;
        self.last_output = out.tail(OUTPUT_TAIL_LINES);
        if !out.success() {
            bail!("tests failed (exit {}):\n{}", out.exit_code, self.last_output);
        }
        Ok(StepReport::note("tests passed"))
    }

    fn must_haves(&self) -> Result<StepReport> {
        let targets = self.spec.must_have_targets();
        if targets.is_empty() {
            return Ok(StepReport::note("no must-have targets"));
        }
        let source = RegexSourceProbe::new().scan(&self.output_root)?;
        let missing: Vec<String> = targets
            .iter()
            .filter(|target| match target {
                MustHave::Endpoint(endpoint) => !source.has_endpoint(endpoint),
                MustHave::File(path) => !self.output_root.join(path).exists(),
            })
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            bail!("missing must-have targets: {}", missing.join(", "));
        }
        Ok(StepReport::note(format!("{} must-have targets present", targets.len())))
    }

    async fn reconcile(&mut self) -> Result<StepReport> {
        let state = self.reconciler.analyze().await?;
        let json = serde_json::to_string_pretty(&state)?;
        std::fs::create_dir_all(&self.state_root)?;
        std::fs::write(self.state_root.join("reconciliation.json"), json)?;
        let summary = state.summary();
        self.reconciliation = Some(state);
        Ok(StepReport::note(format!(
            "reconciled={} ({} errors, {} warnings)",
            summary.reconciled, summary.errors, summary.warnings
        )))
    }
}

#[async_trait]
impl StepExecutor for ServiceStepExecutor {
    async fn execute(&mut self, step: PlanStep) -> Result<StepReport> {
        debug!("Executing {}", step);
        match step {
            PlanStep::Setup => self.setup(),
            PlanStep::MaterializeSpec => self.materialize_spec(),
            PlanStep::ValidatePlan => self.validate_plan(),
            PlanStep::Generate => self.generate().await,
            PlanStep::Persist => self.persist(),
            PlanStep::ValidateArtifacts => {
                artifact::validate_tree(&self.output_root, &self.config.service.health_path)?;
                Ok(StepReport::note("artifacts valid"))
            }
            PlanStep::StartService => self.start_service().await,
            PlanStep::VerifyHealth => self.verify_health().await,
            PlanStep::GenerateTests => self.write_fallback_if_absent(TESTS_PATH, "generated tests"),
            PlanStep::RunTests => self.run_tests().await,
            PlanStep::Docs => self.write_fallback_if_absent(README_PATH, "generated documentation"),
            PlanStep::MustHaves => self.must_haves(),
            PlanStep::Reconcile => self.reconcile().await,
        }
    }

    fn context_excerpt(&self, step: PlanStep, _error: &str) -> String {
        let mut sections = Vec::new();
        if !self.last_output.is_empty() {
            sections.push(format!("Last command output:\n{}", self.last_output));
        }
        if matches!(
            step,
            PlanStep::StartService | PlanStep::VerifyHealth | PlanStep::RunTests
        ) {
            let log = self.service_log_tail();
            if !log.is_empty() {
                sections.push(format!("Service log:\n{log}"));
            }
        }
        if !self.pending.is_empty() {
            let files: Vec<String> = self
                .pending
                .iter()
                .map(|a| a.path.display().to_string())
                .collect();
            sections.push(format!("Generated files: {}", files.join(", ")));
        }
        sections.join("\n\n")
    }

    fn log_excerpts(&self) -> Vec<String> {
        match &self.reconciliation {
            Some(state) => state.logs.excerpts(10),
            None => {
                let tail = self.service_log_tail();
                let lines: Vec<String> = tail.lines().map(str::to_string).collect();
                lines[lines.len().saturating_sub(10)..].to_vec()
            }
        }
    }

    fn reconciliation(&self) -> Option<&MultiLevelState> {
        self.reconciliation.as_ref()
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.config.service.keep_running {
            if let Some(handle) = &self.handle {
                info!("Leaving service #{} running", handle.id);
            }
            return Ok(());
        }
        self.stop_service().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockOracle;
    use crate::r#loop::plan::STANDARD_PLAN;
    use crate::testing::fixtures::{order_specification, test_config};
    use crate::testing::mocks::{MockServiceProbe, MockSupervisor};
    use tempfile::TempDir;

    fn executor(
        project: &Path,
        supervisor: Arc<MockSupervisor>,
        probe: Arc<MockServiceProbe>,
    ) -> ServiceStepExecutor {
        ServiceStepExecutor::new(project, order_specification(), test_config(), RunMode::Offline)
            .unwrap()
            .with_supervisor(supervisor)
            .with_service_probe(probe)
    }

    #[tokio::test]
    async fn test_full_plan_offline() {
        let temp = TempDir::new().unwrap();
        let supervisor = Arc::new(MockSupervisor::new());
        let mut exec = executor(
            temp.path(),
            supervisor.clone(),
            Arc::new(MockServiceProbe::healthy()),
        );

        for step in STANDARD_PLAN {
            exec.execute(step).await.unwrap();
        }

        let out = temp.path().join("generated");
        assert!(out.join("package.json").is_file());
        assert!(out.join("src/server.js").is_file());
        assert!(out.join("tests/api.test.js").is_file());
        assert!(out.join("README.md").is_file());
        assert!(temp.path().join(".autoforge/specification.json").is_file());
        assert!(temp.path().join(".autoforge/reconciliation.json").is_file());
        assert!(exec.reconciliation().unwrap().reconciled);

        let commands = supervisor.commands();
        assert!(commands.iter().any(|c| c == "npm install"));
        assert!(commands.iter().any(|c| c == "npm test"));

        exec.shutdown().await.unwrap();
        assert_eq!(supervisor.stopped(), 1);
    }

    #[tokio::test]
    async fn test_persist_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut exec = executor(
            temp.path(),
            Arc::new(MockSupervisor::new()),
            Arc::new(MockServiceProbe::healthy()),
        );
        assert!(exec.execute(PlanStep::Persist).await.is_err());

        exec.execute(PlanStep::Generate).await.unwrap();
        let first = exec.execute(PlanStep::Persist).await.unwrap();
        assert!(first.changes.iter().all(|c| c.is_effective()));
        let second = exec.execute(PlanStep::Persist).await.unwrap();
        assert!(second.changes.iter().all(|c| !c.is_effective()));
    }

    #[tokio::test]
    async fn test_service_that_exits_reports_log_tail() {
        let temp = TempDir::new().unwrap();
        let supervisor = Arc::new(MockSupervisor::new().exiting_on_start());
        let mut exec = executor(temp.path(), supervisor, Arc::new(MockServiceProbe::down()));
        exec.execute(PlanStep::Setup).await.unwrap();
        std::fs::write(
            temp.path().join("generated/logs/service.log"),
            "Error: listen EADDRINUSE: address already in use :::3000\n",
        )
        .unwrap();

        let err = exec.execute(PlanStep::StartService).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exited during startup"));
        assert!(message.contains("EADDRINUSE"));
    }

    #[tokio::test]
    async fn test_start_service_stops_previous_instance() {
        let temp = TempDir::new().unwrap();
        let supervisor = Arc::new(MockSupervisor::new());
        let mut exec = executor(
            temp.path(),
            supervisor.clone(),
            Arc::new(MockServiceProbe::healthy()),
        );
        exec.execute(PlanStep::StartService).await.unwrap();
        exec.execute(PlanStep::StartService).await.unwrap();
        assert_eq!(supervisor.started(), 2);
        assert_eq!(supervisor.stopped(), 1);
    }

    #[tokio::test]
    async fn test_failing_tests_carry_output() {
        let temp = TempDir::new().unwrap();
        let supervisor = Arc::new(MockSupervisor::new().failing(
            "npm test",
            1,
            "not ok 1 - GET /api/v1/orders",
        ));
        let mut exec = executor(temp.path(), supervisor, Arc::new(MockServiceProbe::healthy()));
        let err = exec.execute(PlanStep::RunTests).await.unwrap_err();
        assert!(err.to_string().contains("not ok 1"));
        assert!(exec
            .context_excerpt(PlanStep::RunTests, "")
            .contains("not ok 1"));
    }

    #[tokio::test]
    async fn test_missing_tool_fails_setup() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config();
        config.service.required_tools = vec!["autoforge-no-such-tool".to_string()];
        let mut exec =
            ServiceStepExecutor::new(temp.path(), order_specification(), config, RunMode::Offline)
                .unwrap();
        let err = exec.execute(PlanStep::Setup).await.unwrap_err();
        assert!(err.to_string().contains("autoforge-no-such-tool"));
    }

    #[tokio::test]
    async fn test_oracle_output_used_when_parsable() {
        let temp = TempDir::new().unwrap();
        let oracle = Arc::new(
            MockOracle::new()
                .then_respond("```js path=src/server.js\napp.get('/health', h);\n```\n")
                .then_respond("sorry, I cannot help"),
        );
        let mut exec = ServiceStepExecutor::new(
            temp.path(),
            order_specification(),
            test_config(),
            RunMode::Oracle,
        )
        .unwrap()
        .with_oracle(oracle.clone());

        let report = exec.execute(PlanStep::Generate).await.unwrap();
        assert!(report.note.contains("mock-oracle"));
        assert_eq!(exec.pending.len(), 1);

        let report = exec.execute(PlanStep::Generate).await.unwrap();
        assert!(report.note.contains("fallback"));
        assert_eq!(oracle.call_count(), 2);
    }

    #[tokio::test]
    async fn test_must_haves() {
        let temp = TempDir::new().unwrap();
        let mut spec = order_specification();
        spec.must_have = vec!["GET /api/v1/orders".to_string(), "docs/API.md".to_string()];
        let mut exec = ServiceStepExecutor::new(temp.path(), spec, test_config(), RunMode::Offline)
            .unwrap()
            .with_supervisor(Arc::new(MockSupervisor::new()));
        exec.execute(PlanStep::Generate).await.unwrap();
        exec.execute(PlanStep::Persist).await.unwrap();

        let err = exec.execute(PlanStep::MustHaves).await.unwrap_err();
        assert!(err.to_string().contains("docs/API.md"));
        assert!(!err.to_string().contains("GET /api/v1/orders"));
    }
}
