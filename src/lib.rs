//! Autoforge - specification-driven service generation
//!
//! Turns a declarative specification into a running, tested service through
//! a bounded loop of tasks. Failures go through a four-level recovery
//! cascade, and the result is cross-checked against specification, source
//! code, live service and logs.
//!
//! # Architecture
//!
//! - [`r#loop`] - task queue, fixed plan, step executor and the orchestration loop
//! - [`recovery`] - heuristic, registry, fallback and oracle recovery levels
//! - [`reconcile`] - multi-source state reconciliation
//! - [`artifact`] - fenced-block parsing, persistence and the fallback generator
//! - [`llm`] - code-synthesis oracle adapter
//! - [`service`] - process supervision for the generated service
//! - [`snapshot`] / [`audit`] - snapshot file and hash-chained evolution log
//! - [`config`] / [`spec`] / [`error`] - settings, specification model, errors
//! - [`testing`] - mocks and fixtures
//!
//! # Example
//!
//! ```rust,ignore
//! use autoforge::config::ProjectConfig;
//! use autoforge::r#loop::{OrchestrationLoop, RunMode};
//! use autoforge::spec::Specification;
//!
//! let config = ProjectConfig::load(".")?;
//! let spec = Specification::load("order-service.json".as_ref())?;
//! let mut run = OrchestrationLoop::standard(".".as_ref(), spec, config, RunMode::Offline, None)?;
//! let report = run.run().await?;
//! assert!(report.is_success());
//! ```

pub mod artifact;
pub mod audit;
pub mod config;
pub mod error;
pub mod llm;
pub mod r#loop;
pub mod reconcile;
pub mod recovery;
pub mod service;
pub mod snapshot;
pub mod spec;
pub mod testing;

// Re-export commonly used types
pub use error::{AutoforgeError, Result};

pub use config::ProjectConfig;
pub use r#loop::{OrchestrationLoop, RunMode, RunReport};
pub use reconcile::{Discrepancy, MultiLevelState, StateReconciler};
pub use recovery::{RecoveryCascade, RecoveryOutcome};
pub use snapshot::{Snapshot, SnapshotStore};
pub use spec::Specification;
