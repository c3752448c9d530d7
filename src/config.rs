//! Configuration management for Autoforge.
//!
//! Project settings live in `.autoforge/settings.json`. Every field has a
//! default so a missing file, or a partial one, is always usable.

use crate::error::{AutoforgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project configuration loaded from `.autoforge/settings.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Directory (relative to the project) that receives generated artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Directory (relative to the project) for snapshots and the audit log.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub oracle: OracleConfig,

    #[serde(default, rename = "loop")]
    pub loop_config: LoopConfig,

    #[serde(default)]
    pub logs: LogConfig,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("generated")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".autoforge")
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            state_dir: default_state_dir(),
            service: ServiceConfig::default(),
            probe: ProbeConfig::default(),
            oracle: OracleConfig::default(),
            loop_config: LoopConfig::default(),
            logs: LogConfig::default(),
        }
    }
}

/// How the generated service is installed, started and tested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Empty disables the install step.
    #[serde(default = "default_install_command")]
    pub install_command: String,

    #[serde(default = "default_start_command")]
    pub start_command: String,

    /// Empty disables test execution.
    #[serde(default = "default_test_command")]
    pub test_command: String,

    /// Executables that must be on `PATH` before anything runs.
    #[serde(default = "default_required_tools")]
    pub required_tools: Vec<String>,

    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Leave the service running after the loop exits.
    #[serde(default)]
    pub keep_running: bool,
}

fn default_port() -> u16 {
    3000
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_install_command() -> String {
    "npm install".to_string()
}

fn default_start_command() -> String {
    "node src/server.js".to_string()
}

fn default_test_command() -> String {
    "npm test".to_string()
}

fn default_required_tools() -> Vec<String> {
    vec!["node".to_string(), "npm".to_string()]
}

fn default_startup_timeout() -> u64 {
    20
}

fn default_command_timeout() -> u64 {
    300
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            health_path: default_health_path(),
            install_command: default_install_command(),
            start_command: default_start_command(),
            test_command: default_test_command(),
            required_tools: default_required_tools(),
            startup_timeout_secs: default_startup_timeout(),
            command_timeout_secs: default_command_timeout(),
            keep_running: false,
        }
    }
}

impl ServiceConfig {
    /// Base URL of the generated service.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Endpoint probing limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_endpoints")]
    pub max_endpoints: usize,
}

fn default_probe_timeout() -> u64 {
    1500
}

fn default_max_endpoints() -> usize {
    20
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout(),
            max_endpoints: default_max_endpoints(),
        }
    }
}

impl ProbeConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Code-synthesis oracle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleConfig {
    /// CLI executable used to reach the oracle.
    #[serde(default = "default_oracle_command")]
    pub command: String,

    #[serde(default = "default_oracle_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_oracle_timeout")]
    pub timeout_secs: u64,

    /// Maximum characters of failure context sent with a fix request.
    #[serde(default = "default_context_chars")]
    pub context_chars: usize,
}

fn default_oracle_command() -> String {
    "claude".to_string()
}

fn default_oracle_model() -> String {
    "sonnet".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    8000
}

fn default_oracle_timeout() -> u64 {
    300
}

fn default_context_chars() -> usize {
    4000
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: default_oracle_command(),
            model: default_oracle_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_oracle_timeout(),
            context_chars: default_context_chars(),
        }
    }
}

impl OracleConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Iteration budget and recovery limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Cascade invocations allowed per task per run.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,

    /// Oracle fixes at or below this confidence are discarded.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_max_iterations() -> u32 {
    3
}

fn default_max_recovery_attempts() -> u32 {
    3
}

fn default_confidence_threshold() -> f64 {
    0.5
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_recovery_attempts: default_max_recovery_attempts(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

/// Where service logs are written and how much of them is inspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// Relative to the output directory.
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,

    /// Glob patterns selecting log files.
    #[serde(default = "default_log_patterns")]
    pub patterns: Vec<String>,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_tail_lines() -> usize {
    250
}

fn default_log_patterns() -> Vec<String> {
    vec!["*.log".to_string()]
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            tail_lines: default_tail_lines(),
            patterns: default_log_patterns(),
        }
    }
}

impl ProjectConfig {
    /// Load configuration from a project directory
    pub fn load(project_dir: &Path) -> Result<Self> {
        let settings_path = Self::settings_path(project_dir);

        if settings_path.exists() {
            let content = std::fs::read_to_string(&settings_path)?;
            let config: ProjectConfig = serde_json::from_str(&content).map_err(|e| {
                AutoforgeError::config_with_path(e.to_string(), settings_path.clone())
            })?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the settings.json path for a project
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        project_dir.join(".autoforge/settings.json")
    }

    /// Absolute output directory for a project.
    pub fn output_root(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.output_dir)
    }

    /// Absolute state directory for a project.
    pub fn state_root(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.state_dir)
    }

    /// Absolute log directory for a project.
    pub fn log_root(&self, project_dir: &Path) -> PathBuf {
        self.output_root(project_dir).join(&self.logs.dir)
    }

    /// Reject values that would make the loop unable to run.
    pub fn validate(&self) -> Result<()> {
        if self.service.port == 0 {
            return Err(AutoforgeError::invalid_config(
                "service.port",
                "must be non-zero",
            ));
        }
        if !self.service.health_path.starts_with('/') {
            return Err(AutoforgeError::invalid_config(
                "service.healthPath",
                "must start with '/'",
            ));
        }
        if self.service.start_command.trim().is_empty() {
            return Err(AutoforgeError::invalid_config(
                "service.startCommand",
                "must not be empty",
            ));
        }
        if self.probe.max_endpoints == 0 {
            return Err(AutoforgeError::invalid_config(
                "probe.maxEndpoints",
                "must be at least 1",
            ));
        }
        if self.loop_config.max_iterations == 0 {
            return Err(AutoforgeError::invalid_config(
                "loop.maxIterations",
                "must be at least 1",
            ));
        }
        let threshold = self.loop_config.confidence_threshold;
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(AutoforgeError::invalid_config(
                "loop.confidenceThreshold",
                "must be between 0 and 1 (exclusive)",
            ));
        }
        Ok(())
    }
}
