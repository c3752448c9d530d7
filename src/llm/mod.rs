//! Code-synthesis oracle abstraction.
//!
//! The [`CodeOracle`] trait is the single seam between the orchestration
//! engine and whatever produces code. It is designed to be:
//!
//! - **Object-safe**: used as `Arc<dyn CodeOracle>`
//! - **Thread-safe**: `Send + Sync`
//! - **Bounded**: every real call carries its own timeout; expiry is an error
//!
//! # Example
//!
//! ```rust,ignore
//! use autoforge::llm::{ClaudeCliOracle, CodeOracle, OracleRequest};
//!
//! let oracle = ClaudeCliOracle::new(".", &config.oracle);
//! let text = oracle
//!     .generate(&OracleRequest::new("system", "user", 0.2, 8000))
//!     .await?;
//! ```

pub mod prompts;

use crate::config::OracleConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// A single generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl OracleRequest {
    pub fn new(
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            temperature,
            max_tokens,
        }
    }
}

/// Abstraction for the external code-synthesis service.
#[async_trait]
pub trait CodeOracle: Send + Sync {
    /// Produce text for the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the oracle is unreachable, exits unsuccessfully,
    /// or does not answer within its timeout.
    async fn generate(&self, request: &OracleRequest) -> Result<String>;

    /// Human-readable model identifier.
    fn model_name(&self) -> &str;
}

/// Output-token cap honoured by the `claude` CLI.
const MAX_OUTPUT_TOKENS_ENV: &str = "CLAUDE_CODE_MAX_OUTPUT_TOKENS";
/// Sampling settings exported for wrapper scripts used as the oracle command.
const TEMPERATURE_ENV: &str = "AUTOFORGE_TEMPERATURE";
const MAX_TOKENS_ENV: &str = "AUTOFORGE_MAX_TOKENS";

/// Oracle backed by the `claude` CLI in print mode.
///
/// The CLI has no temperature flag, so sampling settings travel as
/// environment variables of the child process.
#[derive(Debug, Clone)]
pub struct ClaudeCliOracle {
    /// Working directory for the CLI.
    project_dir: PathBuf,
    command: String,
    model: String,
    timeout: Duration,
}

impl ClaudeCliOracle {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(project_dir: P, config: &OracleConfig) -> Self {
        Self {
            project_dir: project_dir.into(),
            command: config.command.clone(),
            model: config.model.clone(),
            timeout: config.timeout(),
        }
    }

    /// Whether the configured CLI is on `PATH`.
    #[must_use]
    pub fn is_available(&self) -> bool {
        which::which(&self.command).is_ok()
    }

    async fn invoke(&self, request: &OracleRequest) -> Result<String> {
        let args = vec![
            "-p",
            "--model",
            &self.model,
            "--output-format",
            "text",
            "--append-system-prompt",
            &request.system_prompt,
        ];

        debug!(
            "Running {} with model {} ({} chars prompt, temperature {}, max_tokens {})",
            self.command,
            self.model,
            request.user_prompt.len(),
            request.temperature,
            request.max_tokens
        );

        let mut child = AsyncCommand::new(&self.command)
            .args(&args)
            .env(MAX_OUTPUT_TOKENS_ENV, request.max_tokens.to_string())
            .env(TEMPERATURE_ENV, request.temperature.to_string())
            .env(MAX_TOKENS_ENV, request.max_tokens.to_string())
            .current_dir(&self.project_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.user_prompt.as_bytes()).await?;
            stdin.flush().await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} exited with code {}: {}",
                self.command,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )
        }
    }
}

#[async_trait]
impl CodeOracle for ClaudeCliOracle {
    async fn generate(&self, request: &OracleRequest) -> Result<String> {
        match tokio::time::timeout(self.timeout, self.invoke(request)).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "oracle timed out after {}s",
                self.timeout.as_secs()
            ),
        }
    }

    fn model_name(&self) -> &str {
        match self.model.as_str() {
            "opus" => "claude-opus",
            "sonnet" => "claude-sonnet",
            "haiku" => "claude-haiku",
            other => other,
        }
    }
}

/// Recording oracle for tests.
///
/// Scripted responses are returned in order; once exhausted the default
/// response (or error) applies. Every request is captured.
///
/// # Example
///
/// ```rust,ignore
/// use autoforge::llm::MockOracle;
///
/// let oracle = MockOracle::new().with_response("```js path=a.js\nx\n```");
/// assert_eq!(oracle.call_count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct MockOracle {
    /// Response used when the script is empty.
    response: String,
    /// Permanent error (if set) used when the script is empty.
    error: Option<String>,
    /// One-shot outcomes consumed in order.
    script: Mutex<VecDeque<std::result::Result<String, String>>>,
    requests: Mutex<Vec<OracleRequest>>,
    call_count: AtomicU32,
}

impl MockOracle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default response.
    #[must_use]
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Fail every unscripted call.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Queue a one-shot response.
    #[must_use]
    pub fn then_respond(self, response: &str) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(response.to_string()));
        }
        self
    }

    /// Queue a one-shot failure.
    #[must_use]
    pub fn then_fail(self, error: &str) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error.to_string()));
        }
        self
    }

    /// Number of `generate` calls so far.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CodeOracle for MockOracle {
    async fn generate(&self, request: &OracleRequest) -> Result<String> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(Ok(response)) => return Ok(response),
            Some(Err(error)) => anyhow::bail!("{}", error),
            None => {}
        }

        if let Some(ref error) = self.error {
            anyhow::bail!("{}", error)
        }
        Ok(self.response.clone())
    }

    fn model_name(&self) -> &str {
        "mock-oracle"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OracleRequest {
        OracleRequest::new("sys", "user", 0.2, 100)
    }

    #[tokio::test]
    async fn test_mock_oracle_default_response() {
        let oracle = MockOracle::new().with_response("hello");
        assert_eq!(oracle.generate(&request()).await.unwrap(), "hello");
        assert_eq!(oracle.call_count(), 1);
        assert_eq!(oracle.requests()[0].user_prompt, "user");
    }

    #[tokio::test]
    async fn test_mock_oracle_script_then_default() {
        let oracle = MockOracle::new()
            .with_error("offline")
            .then_respond("first")
            .then_fail("second failed");

        assert_eq!(oracle.generate(&request()).await.unwrap(), "first");
        let err = oracle.generate(&request()).await.unwrap_err();
        assert!(err.to_string().contains("second failed"));
        let err = oracle.generate(&request()).await.unwrap_err();
        assert!(err.to_string().contains("offline"));
        assert_eq!(oracle.call_count(), 3);
    }

    #[tokio::test]
    async fn test_cli_oracle_missing_binary_errors() {
        let config = OracleConfig {
            command: "autoforge-definitely-missing-oracle".to_string(),
            timeout_secs: 5,
            ..OracleConfig::default()
        };
        let oracle = ClaudeCliOracle::new(std::env::temp_dir(), &config);
        assert!(!oracle.is_available());
        assert!(oracle.generate(&request()).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_oracle_passes_sampling_settings() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::TempDir::new().unwrap();
        let script = temp.path().join("oracle.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\necho \"$AUTOFORGE_TEMPERATURE $AUTOFORGE_MAX_TOKENS $CLAUDE_CODE_MAX_OUTPUT_TOKENS\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = OracleConfig {
            command: script.display().to_string(),
            timeout_secs: 10,
            ..OracleConfig::default()
        };
        let oracle = ClaudeCliOracle::new(temp.path(), &config);
        let text = oracle
            .generate(&OracleRequest::new("sys", "user", 0.5, 1234))
            .await
            .unwrap();
        assert_eq!(text.trim(), "0.5 1234 1234");
    }

    #[test]
    fn test_model_name_mapping() {
        let oracle = ClaudeCliOracle::new(".", &OracleConfig::default());
        assert_eq!(oracle.model_name(), "claude-sonnet");
    }

    #[test]
    fn test_oracle_is_object_safe() {
        let oracle: Box<dyn CodeOracle> = Box::new(MockOracle::new());
        assert_eq!(oracle.model_name(), "mock-oracle");
    }
}
