//! The fixed task plan.
//!
//! The order is applied identically on every pass, so setup always precedes
//! use (install needs a persisted manifest, probes need a started service).

use serde::{Deserialize, Serialize};

/// One step of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanStep {
    Setup,
    MaterializeSpec,
    ValidatePlan,
    Generate,
    Persist,
    ValidateArtifacts,
    StartService,
    VerifyHealth,
    GenerateTests,
    RunTests,
    Docs,
    MustHaves,
    Reconcile,
}

/// Every step, in execution order.
pub const STANDARD_PLAN: [PlanStep; 13] = [
    PlanStep::Setup,
    PlanStep::MaterializeSpec,
    PlanStep::ValidatePlan,
    PlanStep::Generate,
    PlanStep::Persist,
    PlanStep::ValidateArtifacts,
    PlanStep::StartService,
    PlanStep::VerifyHealth,
    PlanStep::GenerateTests,
    PlanStep::RunTests,
    PlanStep::Docs,
    PlanStep::MustHaves,
    PlanStep::Reconcile,
];

impl PlanStep {
    /// Stable task id.
    #[must_use]
    pub fn id(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::MaterializeSpec => "materialize-spec",
            Self::ValidatePlan => "validate-plan",
            Self::Generate => "generate",
            Self::Persist => "persist",
            Self::ValidateArtifacts => "validate-artifacts",
            Self::StartService => "start-service",
            Self::VerifyHealth => "verify-health",
            Self::GenerateTests => "generate-tests",
            Self::RunTests => "run-tests",
            Self::Docs => "docs",
            Self::MustHaves => "must-haves",
            Self::Reconcile => "reconcile",
        }
    }

    /// Human-readable task name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Setup => "Prepare environment",
            Self::MaterializeSpec => "Materialize specification",
            Self::ValidatePlan => "Validate plan against specification",
            Self::Generate => "Generate artifacts",
            Self::Persist => "Persist artifacts",
            Self::ValidateArtifacts => "Validate artifacts",
            Self::StartService => "Install dependencies and start service",
            Self::VerifyHealth => "Verify service health",
            Self::GenerateTests => "Generate tests",
            Self::RunTests => "Run tests",
            Self::Docs => "Write documentation",
            Self::MustHaves => "Check must-have targets",
            Self::Reconcile => "Reconcile state",
        }
    }

    #[must_use]
    pub fn from_id(id: &str) -> Option<Self> {
        STANDARD_PLAN.iter().copied().find(|s| s.id() == id)
    }
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}
