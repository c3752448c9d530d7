//! Ordered task list with a strict lifecycle.
//!
//! # State machine
//!
//! ```text
//!            start            done
//! Pending ─────────> Running ─────> Done
//!    ^                  │
//!    │ retry            │ fail
//!    │                  v
//!    └──────────────  Failed ──start──> Running
//! ```
//!
//! Any other change is an [`AutoforgeError::InvalidTransition`]. Unknown and
//! duplicate ids are programmer errors.

use crate::error::{AutoforgeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Suffix marker of recovery entries (`<task>:recovery-<n>`).
pub const RECOVERY_MARKER: &str = ":recovery-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: TaskStatus::Pending,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether this is a paired recovery entry rather than a plan task.
    #[must_use]
    pub fn is_recovery(&self) -> bool {
        self.id.contains(RECOVERY_MARKER)
    }

    /// Seconds between start and completion (or now, while running).
    #[must_use]
    pub fn duration_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

/// Ordered queue of tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pending task. Duplicate ids are rejected.
    pub fn add(&mut self, name: impl Into<String>, id: impl Into<String>) -> Result<&Task> {
        let task = Task::new(name, id);
        if self.index.contains_key(&task.id) {
            return Err(AutoforgeError::DuplicateTask { id: task.id });
        }
        let position = self.tasks.len();
        self.index.insert(task.id.clone(), position);
        self.tasks.push(task);
        Ok(&self.tasks[position])
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Task> {
        let position = *self
            .index
            .get(id)
            .ok_or_else(|| AutoforgeError::unknown_task(id))?;
        Ok(&mut self.tasks[position])
    }

    fn transition(
        &mut self,
        id: &str,
        allowed: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<&mut Task> {
        let task = self.get_mut(id)?;
        if !allowed.contains(&task.status) {
            return Err(AutoforgeError::InvalidTransition {
                id: id.to_string(),
                from: task.status.to_string(),
                to: to.to_string(),
            });
        }
        task.status = to;
        Ok(task)
    }

    /// `pending | failed -> running`.
    pub fn start(&mut self, id: &str) -> Result<()> {
        let task = self.transition(
            id,
            &[TaskStatus::Pending, TaskStatus::Failed],
            TaskStatus::Running,
        )?;
        task.started_at = Some(Utc::now());
        task.completed_at = None;
        task.error = None;
        Ok(())
    }

    /// `running -> done`.
    pub fn done(&mut self, id: &str) -> Result<()> {
        let task = self.transition(id, &[TaskStatus::Running], TaskStatus::Done)?;
        task.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> failed`.
    pub fn fail(&mut self, id: &str, error: impl Into<String>) -> Result<()> {
        let task = self.transition(id, &[TaskStatus::Running], TaskStatus::Failed)?;
        task.completed_at = Some(Utc::now());
        task.error = Some(error.into());
        Ok(())
    }

    /// Explicit retry reset, `failed -> pending`. The last error is kept until the next start.
    pub fn retry(&mut self, id: &str) -> Result<()> {
        self.transition(id, &[TaskStatus::Failed], TaskStatus::Pending)?;
        Ok(())
    }

    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    #[must_use]
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Plan tasks (not recovery entries) that are not done.
    #[must_use]
    pub fn unfinished(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| !t.is_recovery() && t.status != TaskStatus::Done)
            .collect()
    }

    /// Number of recovery entries paired with `id`.
    #[must_use]
    pub fn recovery_count(&self, id: &str) -> usize {
        let prefix = format!("{id}{RECOVERY_MARKER}");
        self.tasks.iter().filter(|t| t.id.starts_with(&prefix)).count()
    }
}
