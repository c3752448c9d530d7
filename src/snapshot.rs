//! Point-in-time view of orchestration progress.
//!
//! The snapshot file is replaced whole on every task transition (temp file,
//! then rename under an exclusive lock), never appended to.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::r#loop::state::{LoopPhase, RunMode};
use crate::r#loop::task_queue::{Task, TaskStatus};
use crate::reconcile::ReconciliationSummary;
use crate::spec::Specification;

const SNAPSHOT_FILE: &str = "snapshot.json";
const TMP_SUFFIX: &str = ".tmp";
const LOCK_SUFFIX: &str = ".lock";

/// One task as recorded in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub duration_sec: Option<f64>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            status: task.status,
            error: task.error.clone(),
            duration_sec: task.duration_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub port: u16,
    pub output_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub mode: RunMode,
    pub run_id: String,
    pub iteration: u32,
    pub phase: LoopPhase,
    pub tasks: Vec<TaskSnapshot>,
    pub specification: Specification,
    pub service: ServiceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<ReconciliationSummary>,
}

impl Snapshot {
    /// Tasks that are pending or failed.
    #[must_use]
    pub fn remaining(&self) -> Vec<&TaskSnapshot> {
        self.tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Failed))
            .collect()
    }
}

/// Atomic snapshot file storage.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn tmp_path(&self) -> PathBuf {
        self.dir.join(format!("{SNAPSHOT_FILE}{TMP_SUFFIX}"))
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{SNAPSHOT_FILE}{LOCK_SUFFIX}"))
    }

    /// Replace the snapshot file.
    pub fn write(&self, snapshot: &Snapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let lock_file = File::create(self.lock_path())?;
        FileExt::lock_exclusive(&lock_file)?;

        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp_path = self.tmp_path();
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, self.snapshot_path())?;
        Ok(())
    }

    /// Write, logging instead of failing. Returns whether the write succeeded.
    pub fn write_best_effort(&self, snapshot: &Snapshot) -> bool {
        match self.write(snapshot) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write snapshot to {}: {}", self.snapshot_path().display(), e);
                false
            }
        }
    }

    /// The last snapshot, if any.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        let path = self.snapshot_path();
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r#loop::task_queue::TaskQueue;
    use crate::testing::fixtures::order_specification;
    use tempfile::TempDir;

    fn snapshot(queue: &TaskQueue, iteration: u32) -> Snapshot {
        Snapshot {
            timestamp: Utc::now(),
            mode: RunMode::Offline,
            run_id: "run-1".to_string(),
            iteration,
            phase: LoopPhase::Executing,
            tasks: queue.tasks().iter().map(TaskSnapshot::from).collect(),
            specification: order_specification(),
            service: ServiceInfo {
                port: 3000,
                output_dir: "generated".to_string(),
            },
            reconciliation: None,
        }
    }

    #[test]
    fn test_load_missing_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(SnapshotStore::new(temp.path()).load().unwrap().is_none());
    }

    #[test]
    fn test_write_replaces_whole_file() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path().join("state"));
        let mut queue = TaskQueue::new();
        queue.add("Setup", "setup").unwrap();
        queue.add("Docs", "docs").unwrap();

        store.write(&snapshot(&queue, 1)).unwrap();
        queue.start("setup").unwrap();
        queue.fail("setup", "no node").unwrap();
        store.write(&snapshot(&queue, 2)).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.iteration, 2);
        assert_eq!(loaded.tasks.len(), 2);
        assert_eq!(loaded.tasks[0].status, TaskStatus::Failed);
        assert_eq!(loaded.tasks[0].error.as_deref(), Some("no node"));
        assert_eq!(loaded.remaining().len(), 2);
        assert!(!store.tmp_path().exists());

        let raw = std::fs::read_to_string(store.snapshot_path()).unwrap();
        assert!(raw.contains("\"durationSec\""));
        assert!(raw.contains("\"outputDir\": \"generated\""));
        assert_eq!(raw.matches("\"runId\"").count(), 1);
    }

    #[test]
    fn test_best_effort_does_not_fail() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        // A directory cannot be created below a regular file.
        let store = SnapshotStore::new(blocker.join("state"));
        assert!(!store.write_best_effort(&snapshot(&TaskQueue::new(), 0)));
    }
}
