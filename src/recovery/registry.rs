//! Per-run registry of fixes that worked (Level 2).

use super::remediation::RemediationAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A remembered fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRecord {
    pub task_id: String,
    pub error_hash: String,
    pub action: RemediationAction,
    /// Zero means poisoned.
    pub success_count: u32,
    pub created_at: DateTime<Utc>,
}

impl FixRecord {
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.success_count == 0
    }
}

/// First 16 hex chars of the SHA-256 of the trimmed error.
#[must_use]
pub fn error_hash(error: &str) -> String {
    let digest = Sha256::digest(error.trim().as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Fix registry owned by one orchestration run.
#[derive(Debug, Default, Clone)]
pub struct FixRegistry {
    records: HashMap<(String, String), FixRecord>,
}

impl FixRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(task_id: &str, error: &str) -> (String, String) {
        (task_id.to_string(), error_hash(error))
    }

    /// A replayable record, skipping poisoned ones.
    #[must_use]
    pub fn lookup(&self, task_id: &str, error: &str) -> Option<&FixRecord> {
        self.records
            .get(&Self::key(task_id, error))
            .filter(|r| !r.is_poisoned())
    }

    /// Any record for the key, poisoned or not.
    #[must_use]
    pub fn get(&self, task_id: &str, error: &str) -> Option<&FixRecord> {
        self.records.get(&Self::key(task_id, error))
    }

    /// Store a fix that just succeeded. Replaces any previous record.
    pub fn record(&mut self, task_id: &str, error: &str, action: RemediationAction) {
        let (task, hash) = Self::key(task_id, error);
        self.records.insert(
            (task.clone(), hash.clone()),
            FixRecord {
                task_id: task,
                error_hash: hash,
                action,
                success_count: 1,
                created_at: Utc::now(),
            },
        );
    }

    pub fn record_success(&mut self, task_id: &str, error: &str) {
        if let Some(record) = self.records.get_mut(&Self::key(task_id, error)) {
            record.success_count += 1;
        }
    }

    /// Mark the record as failed on replay.
    pub fn poison(&mut self, task_id: &str, error: &str) {
        if let Some(record) = self.records.get_mut(&Self::key(task_id, error)) {
            record.success_count = 0;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action() -> RemediationAction {
        RemediationAction::CreateDirectory {
            path: "data".to_string(),
        }
    }

    #[test]
    fn test_error_hash_ignores_surrounding_whitespace() {
        assert_eq!(error_hash("boom"), error_hash("  boom\n"));
        assert_ne!(error_hash("boom"), error_hash("bang"));
        assert_eq!(error_hash("boom").len(), 16);
    }

    #[test]
    fn test_lookup_is_keyed_by_task_and_error() {
        let mut registry = FixRegistry::new();
        registry.record("run-tests", "boom", action());

        assert!(registry.lookup("run-tests", "boom").is_some());
        assert!(registry.lookup("start-service", "boom").is_none());
        assert!(registry.lookup("run-tests", "other").is_none());
    }

    #[test]
    fn test_poisoned_record_is_not_replayable() {
        let mut registry = FixRegistry::new();
        registry.record("run-tests", "boom", action());
        registry.record_success("run-tests", "boom");
        assert_eq!(registry.get("run-tests", "boom").unwrap().success_count, 2);

        registry.poison("run-tests", "boom");
        assert!(registry.lookup("run-tests", "boom").is_none());
        assert!(registry.get("run-tests", "boom").unwrap().is_poisoned());
        assert_eq!(registry.len(), 1);
    }
}
