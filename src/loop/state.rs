//! Run mode and loop phase.
//!
//! The orchestration loop moves through
//! `Planning → Executing → {Recovering → Executing}* → Success | PartialFailure`.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How primary artifacts are generated.
///
/// # Example
///
/// ```
/// use autoforge::r#loop::state::RunMode;
///
/// assert_eq!(RunMode::Offline.to_string(), "offline");
/// ```
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Ask the oracle, falling back to templates when it fails.
    Oracle,
    /// Templates only, no oracle calls at all.
    Offline,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Oracle => write!(f, "oracle"),
            RunMode::Offline => write!(f, "offline"),
        }
    }
}

/// Phase of one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopPhase {
    Planning,
    Executing,
    Recovering,
    Success,
    PartialFailure,
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoopPhase::Planning => "planning",
            LoopPhase::Executing => "executing",
            LoopPhase::Recovering => "recovering",
            LoopPhase::Success => "success",
            LoopPhase::PartialFailure => "partial-failure",
        };
        write!(f, "{name}")
    }
}

impl LoopPhase {
    /// Whether the run is over.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopPhase::Success | LoopPhase::PartialFailure)
    }

    /// Allowed phase changes.
    ///
    /// # Example
    ///
    /// ```
    /// use autoforge::r#loop::state::LoopPhase;
    ///
    /// assert!(LoopPhase::Executing.can_transition_to(LoopPhase::Recovering));
    /// assert!(!LoopPhase::Success.can_transition_to(LoopPhase::Executing));
    /// ```
    #[must_use]
    pub fn can_transition_to(&self, next: LoopPhase) -> bool {
        use LoopPhase::*;
        matches!(
            (self, next),
            (Planning, Executing)
                | (Planning, Success)
                | (Planning, PartialFailure)
                | (Executing, Recovering)
                | (Executing, Success)
                | (Executing, PartialFailure)
                | (Recovering, Executing)
        )
    }
}
