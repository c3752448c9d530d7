//! Append-only evolution log.
//!
//! One [`EvolutionCycle`] is appended per generation, per recovery that
//! changed files, and at the end of every run. Cycles are hash-chained so
//! the history can be verified.
//!
//! # Example
//!
//! ```rust,ignore
//! use autoforge::audit::{CycleTrigger, EvolutionLog};
//!
//! let log = EvolutionLog::new(state_dir);
//! log.record("run-1", CycleTrigger::Generation, "fallback", changes, vec![])?;
//! assert!(log.verify()?.is_valid);
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::artifact::FileChange;

const AUDIT_FILE: &str = "evolution.jsonl";

/// The genesis string hashed as the first cycle's previous hash.
const GENESIS: &str = "autoforge-evolution-genesis-v1";

/// What produced a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    /// Artifacts persisted after a generation attempt.
    Generation,
    /// A recovery level changed files.
    Recovery,
    /// End of a run.
    RunCompleted,
}

impl std::fmt::Display for CycleTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleTrigger::Generation => write!(f, "generation"),
            CycleTrigger::Recovery => write!(f, "recovery"),
            CycleTrigger::RunCompleted => write!(f, "run_completed"),
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionCycle {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub trigger: CycleTrigger,
    /// Free-form detail, e.g. the generator or `<level>:<task>`.
    pub detail: String,
    pub changes: Vec<FileChange>,
    pub log_excerpts: Vec<String>,
    pub previous_hash: String,
    pub hash: String,
}

impl EvolutionCycle {
    /// Hash over every field except `hash`.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sequence.to_le_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(self.run_id.as_bytes());
        hasher.update(self.trigger.to_string().as_bytes());
        hasher.update(self.detail.as_bytes());
        for change in &self.changes {
            hasher.update(change.path.as_bytes());
            hasher.update(change.action.to_string().as_bytes());
            hasher.update(change.reason.as_bytes());
        }
        for line in &self.log_excerpts {
            hasher.update(line.as_bytes());
        }
        hasher.update(self.previous_hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    #[must_use]
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

/// Outcome of verifying the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub is_valid: bool,
    pub cycles_verified: u64,
    pub first_invalid: Option<u64>,
    pub error_description: Option<String>,
}

impl VerificationResult {
    #[must_use]
    pub fn valid(cycles_verified: u64) -> Self {
        Self {
            is_valid: true,
            cycles_verified,
            first_invalid: None,
            error_description: None,
        }
    }

    #[must_use]
    pub fn invalid(cycles_verified: u64, invalid: u64, error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            cycles_verified,
            first_invalid: Some(invalid),
            error_description: Some(error.into()),
        }
    }
}

/// JSONL evolution log under the state directory.
#[derive(Debug, Clone)]
pub struct EvolutionLog {
    dir: PathBuf,
}

impl EvolutionLog {
    #[must_use]
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(AUDIT_FILE)
    }

    /// Append a cycle.
    pub fn record(
        &self,
        run_id: &str,
        trigger: CycleTrigger,
        detail: &str,
        changes: Vec<FileChange>,
        log_excerpts: Vec<String>,
    ) -> Result<EvolutionCycle> {
        fs::create_dir_all(&self.dir).context("Failed to create state directory")?;
        let cycles = self.read_cycles()?;
        let sequence = cycles.last().map_or(0, |c| c.sequence + 1);
        let previous_hash = cycles
            .last()
            .map(|c| c.hash.clone())
            .unwrap_or_else(genesis_hash);

        let mut cycle = EvolutionCycle {
            sequence,
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            trigger,
            detail: detail.to_string(),
            changes,
            log_excerpts,
            previous_hash,
            hash: String::new(),
        };
        cycle.hash = cycle.compute_hash();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())
            .context("Failed to open evolution log")?;
        let json = serde_json::to_string(&cycle).context("Failed to serialize cycle")?;
        writeln!(file, "{}", json).context("Failed to write cycle")?;
        Ok(cycle)
    }

    /// Every cycle in order. A missing log is empty.
    pub fn read_cycles(&self) -> Result<Vec<EvolutionCycle>> {
        let path = self.path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path).context("Failed to open evolution log")?);
        let mut cycles = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line.context("Failed to read evolution log")?;
            if line.trim().is_empty() {
                continue;
            }
            let cycle: EvolutionCycle = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse cycle at line {}", line_num + 1))?;
            cycles.push(cycle);
        }
        Ok(cycles)
    }

    /// Check sequence numbers, per-cycle hashes and the chain.
    pub fn verify(&self) -> Result<VerificationResult> {
        let cycles = self.read_cycles()?;
        let genesis = genesis_hash();

        for (i, cycle) in cycles.iter().enumerate() {
            if cycle.sequence != i as u64 {
                return Ok(VerificationResult::invalid(
                    i as u64,
                    cycle.sequence,
                    format!("Sequence mismatch: expected {}, got {}", i, cycle.sequence),
                ));
            }
            if !cycle.verify_hash() {
                return Ok(VerificationResult::invalid(
                    i as u64,
                    cycle.sequence,
                    "Cycle hash verification failed",
                ));
            }
            let expected_previous = if i == 0 { &genesis } else { &cycles[i - 1].hash };
            if cycle.previous_hash != *expected_previous {
                return Ok(VerificationResult::invalid(
                    i as u64,
                    cycle.sequence,
                    "Chain hash mismatch",
                ));
            }
        }
        Ok(VerificationResult::valid(cycles.len() as u64))
    }
}

fn genesis_hash() -> String {
    hex::encode(Sha256::digest(GENESIS.as_bytes()))
}
