//! Process supervision for install, test and service commands.
//!
//! [`ProcessSupervisor`] abstracts process lifecycle so the orchestration
//! loop can be tested without spawning anything. [`ShellSupervisor`] is the
//! real implementation: commands run through `sh -c` under `tokio::process`,
//! and long-running service output is appended to a log file that the
//! reconciler later tails. Every command gets its own process group, so
//! stopping or timing out reaches the grandchildren a package runner spawns.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command as AsyncCommand};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `lines` lines of stdout and stderr combined.
    #[must_use]
    pub fn tail(&self, lines: usize) -> String {
        let combined = format!("{}\n{}", self.stdout, self.stderr);
        tail_lines(&combined, lines)
    }
}

/// Handle to a started service process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub id: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
}

/// Abstraction over process lifecycle.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Run a command to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be spawned or exceeds `timeout`.
    async fn run(
        &self,
        command: &str,
        cwd: &Path,
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Start a long-running command whose output is appended to `log_path`.
    async fn start(
        &self,
        command: &str,
        cwd: &Path,
        env: &[(String, String)],
        log_path: &Path,
    ) -> Result<ServiceHandle>;

    /// Whether the process behind `handle` is still alive.
    async fn is_running(&self, handle: &ServiceHandle) -> bool;

    /// Stop the process and wait for it to exit.
    async fn stop(&self, handle: &ServiceHandle) -> Result<()>;
}

/// Grace period between SIGTERM and SIGKILL when stopping a service.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct ServiceProcess {
    child: Child,
    /// Process group id; equals the shell's pid.
    pgid: Option<u32>,
}

/// Real supervisor using `sh -c`.
#[derive(Debug, Default)]
pub struct ShellSupervisor {
    children: Mutex<HashMap<u32, ServiceProcess>>,
    next_id: std::sync::atomic::AtomicU32,
}

impl ShellSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn shell(command: &str, cwd: &Path, env: &[(String, String)]) -> AsyncCommand {
        let mut cmd = AsyncCommand::new("sh");
        cmd.arg("-c").arg(command).current_dir(cwd);
        #[cfg(unix)]
        cmd.process_group(0);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd
    }
}

#[async_trait]
impl ProcessSupervisor for ShellSupervisor {
    async fn run(
        &self,
        command: &str,
        cwd: &Path,
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        debug!("Running `{}` in {}", command, cwd.display());
        let child = Self::shell(command, cwd, env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn `{command}`"))?;
        let pgid = child.id();

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.with_context(|| format!("Failed to wait for `{command}`"))?,
            Err(_) => {
                signal_group(pgid, true);
                anyhow::bail!("`{}` timed out after {}s", command, timeout.as_secs())
            }
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn start(
        &self,
        command: &str,
        cwd: &Path,
        env: &[(String, String)],
        log_path: &Path,
    ) -> Result<ServiceHandle> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .context("Failed to open service log")?;
        let log_err = log.try_clone().context("Failed to clone service log handle")?;

        let child = Self::shell(command, cwd, env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start `{command}`"))?;

        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let pgid = child.id();
        info!("Started service #{} (`{}`, pid {:?})", id, command, pgid);
        self.children.lock().await.insert(id, ServiceProcess { child, pgid });

        Ok(ServiceHandle {
            id,
            command: command.to_string(),
            started_at: Utc::now(),
        })
    }

    async fn is_running(&self, handle: &ServiceHandle) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(&handle.id) {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<()> {
        let process = self.children.lock().await.remove(&handle.id);
        let Some(ServiceProcess { mut child, pgid }) = process else {
            return Ok(());
        };

        // The shell may be gone while the rest of its group still holds the port.
        if let Ok(Some(status)) = child.try_wait() {
            debug!("Service #{} shell already exited with {}", handle.id, status);
            signal_group(pgid, true);
            return Ok(());
        }

        signal_group(pgid, false);
        let exited = tokio::time::timeout(STOP_GRACE, child.wait()).await.is_ok();
        signal_group(pgid, true);
        if !exited {
            warn!("Service #{} ignored SIGTERM, killing", handle.id);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill service #{}: {}", handle.id, e);
                return Err(e).context("Failed to stop service");
            }
        }
        info!("Stopped service #{}", handle.id);
        Ok(())
    }
}

/// Signal a whole process group: SIGKILL when `force`, else SIGTERM.
#[cfg(unix)]
fn signal_group(pgid: Option<u32>, force: bool) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pgid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send {:?} to process group {}: {}", signal, raw, e),
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<u32>, _force: bool) {}

/// Last `lines` lines of `text`.
#[must_use]
pub fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
