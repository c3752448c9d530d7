//! Controllable test doubles for the external seams.

use crate::artifact::FileChange;
use crate::r#loop::executor::{StepExecutor, StepReport};
use crate::r#loop::plan::PlanStep;
use crate::reconcile::service_probe::{EndpointProbe, HealthStatus, ServiceProbe};
use crate::service::{CommandOutput, ProcessSupervisor, ServiceHandle};
use crate::spec::Endpoint;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Service probe
// ============================================================================

/// Mock probe with a fixed health answer.
///
/// # Example
///
/// ```rust,ignore
/// let probe = MockServiceProbe::healthy().failing("/api/v1/orders");
/// assert!(probe.liveness().await.healthy);
/// ```
#[derive(Debug, Default)]
pub struct MockServiceProbe {
    health: HealthStatus,
    failing: HashSet<String>,
    probed: Mutex<Vec<Endpoint>>,
}

impl MockServiceProbe {
    #[must_use]
    pub fn healthy() -> Self {
        Self::with_health(true, true, Some(200), "ok")
    }

    /// Nothing listening.
    #[must_use]
    pub fn down() -> Self {
        Self::with_health(false, false, None, "connection refused")
    }

    /// Listening but answering 503.
    #[must_use]
    pub fn unhealthy() -> Self {
        Self::with_health(true, false, Some(503), "status 503")
    }

    fn with_health(running: bool, healthy: bool, status_code: Option<u16>, detail: &str) -> Self {
        Self {
            health: HealthStatus {
                running,
                healthy,
                status_code,
                detail: detail.to_string(),
            },
            ..Self::default()
        }
    }

    /// Make probes of `path` answer 500.
    #[must_use]
    pub fn failing(mut self, path: &str) -> Self {
        self.failing.insert(path.to_string());
        self
    }

    /// Endpoints probed so far.
    pub fn probed(&self) -> Vec<Endpoint> {
        self.probed.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ServiceProbe for MockServiceProbe {
    async fn liveness(&self) -> HealthStatus {
        self.health.clone()
    }

    async fn probe(&self, endpoint: &Endpoint) -> EndpointProbe {
        if let Ok(mut probed) = self.probed.lock() {
            probed.push(endpoint.clone());
        }
        let ok = !self.failing.contains(&endpoint.path);
        EndpointProbe {
            endpoint: endpoint.clone(),
            ok,
            status_code: Some(if ok { 200 } else { 500 }),
            error: (!ok).then(|| "status 500".to_string()),
        }
    }
}

// ============================================================================
// Process supervisor
// ============================================================================

/// Mock supervisor that records commands instead of spawning them.
#[derive(Debug, Default)]
pub struct MockSupervisor {
    failures: Vec<(String, i32, String)>,
    exits_on_start: bool,
    commands: Mutex<Vec<String>>,
    started: AtomicU32,
    stopped: AtomicU32,
}

impl MockSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` exit with `exit_code` and print `stderr`.
    #[must_use]
    pub fn failing(mut self, pattern: &str, exit_code: i32, stderr: &str) -> Self {
        self.failures
            .push((pattern.to_string(), exit_code, stderr.to_string()));
        self
    }

    /// Started services report as not running.
    #[must_use]
    pub fn exiting_on_start(mut self) -> Self {
        self.exits_on_start = true;
        self
    }

    /// Every command run or started, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> u32 {
        self.stopped.load(Ordering::SeqCst)
    }

    fn record(&self, command: &str) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command.to_string());
        }
    }
}

#[async_trait]
impl ProcessSupervisor for MockSupervisor {
    async fn run(
        &self,
        command: &str,
        _cwd: &Path,
        _env: &[(String, String)],
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        self.record(command);
        let failure = self
            .failures
            .iter()
            .find(|(pattern, _, _)| command.contains(pattern.as_str()));
        Ok(match failure {
            Some((_, exit_code, stderr)) => CommandOutput {
                exit_code: *exit_code,
                stdout: String::new(),
                stderr: stderr.clone(),
            },
            None => CommandOutput {
                exit_code: 0,
                stdout: "ok".to_string(),
                stderr: String::new(),
            },
        })
    }

    async fn start(
        &self,
        command: &str,
        _cwd: &Path,
        _env: &[(String, String)],
        _log_path: &Path,
    ) -> Result<ServiceHandle> {
        self.record(command);
        let id = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ServiceHandle {
            id,
            command: command.to_string(),
            started_at: Utc::now(),
        })
    }

    async fn is_running(&self, _handle: &ServiceHandle) -> bool {
        !self.exits_on_start
    }

    async fn stop(&self, _handle: &ServiceHandle) -> Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Step executor
// ============================================================================

#[derive(Debug, Default)]
struct Script {
    failures: HashMap<PlanStep, VecDeque<String>>,
    permanent: HashMap<PlanStep, String>,
    changes: HashMap<PlanStep, Vec<FileChange>>,
    executions: Vec<PlanStep>,
    shutdowns: u32,
}

/// Executor whose step outcomes are scripted.
///
/// Clones share state, so a test can keep one clone for inspection after
/// handing the other to the loop.
///
/// # Example
///
/// ```rust,ignore
/// let executor = ScriptedExecutor::new()
///     .fail_times(PlanStep::RunTests, 2, "tests failed")
///     .always_fail(PlanStep::Docs, "disk full");
/// let observer = executor.clone();
/// ```
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<Script>>,
}

impl ScriptedExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` executions of `step` with `error`.
    #[must_use]
    pub fn fail_times(self, step: PlanStep, times: usize, error: &str) -> Self {
        if let Ok(mut script) = self.script.lock() {
            let queue = script.failures.entry(step).or_default();
            queue.extend(std::iter::repeat(error.to_string()).take(times));
        }
        self
    }

    /// Fail every execution of `step`.
    #[must_use]
    pub fn always_fail(self, step: PlanStep, error: &str) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.permanent.insert(step, error.to_string());
        }
        self
    }

    /// Report `changes` whenever `step` succeeds.
    #[must_use]
    pub fn with_changes(self, step: PlanStep, changes: Vec<FileChange>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.changes.insert(step, changes);
        }
        self
    }

    /// Every execution so far, in order.
    pub fn executions(&self) -> Vec<PlanStep> {
        self.script
            .lock()
            .map(|s| s.executions.clone())
            .unwrap_or_default()
    }

    /// Executions of one step.
    pub fn count(&self, step: PlanStep) -> usize {
        self.executions().iter().filter(|s| **s == step).count()
    }

    pub fn shutdowns(&self) -> u32 {
        self.script.lock().map(|s| s.shutdowns).unwrap_or_default()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&mut self, step: PlanStep) -> Result<StepReport> {
        let Ok(mut script) = self.script.lock() else {
            bail!("script lock poisoned");
        };
        script.executions.push(step);
        if let Some(error) = script.permanent.get(&step) {
            bail!("{}", error);
        }
        if let Some(error) = script.failures.get_mut(&step).and_then(VecDeque::pop_front) {
            bail!("{}", error);
        }
        let changes = script.changes.get(&step).cloned().unwrap_or_default();
        Ok(StepReport::with_changes(changes, format!("{step} ok")))
    }

    fn log_excerpts(&self) -> Vec<String> {
        vec!["[info] scripted run".to_string()]
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Ok(mut script) = self.script.lock() {
            script.shutdowns += 1;
        }
        Ok(())
    }
}
