//! Orchestration loop.
//!
//! - [`plan`] - the fixed, ordered task plan
//! - [`task_queue`] - task lifecycle state machine
//! - [`state`] - run mode and loop phase
//! - [`executor`] - dispatch of plan steps to real collaborators
//! - [`manager`] - the bounded loop tying queue, executor and recovery together
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │OrchestrationLoop │────>│  TaskQueue   │     │ RecoveryCascade  │
//! │                  │────────────────────────> │                  │
//! └──────────────────┘     └──────────────┘     └──────────────────┘
//!          │
//!          v
//! ┌──────────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │  StepExecutor    │────>│ Supervisor   │     │ StateReconciler  │
//! └──────────────────┘     └──────────────┘     └──────────────────┘
//! ```

pub mod executor;
pub mod manager;
pub mod plan;
pub mod state;
pub mod task_queue;

pub use executor::{ServiceStepExecutor, StepExecutor, StepReport};
pub use manager::{OrchestrationLoop, RunReport};
pub use plan::{PlanStep, STANDARD_PLAN};
pub use state::{LoopPhase, RunMode};
pub use task_queue::{Task, TaskQueue, TaskStatus};
