//! Testing infrastructure for Autoforge.
//!
//! Test doubles for the process supervisor, the service probe and the step
//! executor, plus fixtures shared by unit and integration tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use autoforge::testing::{MockServiceProbe, ScriptedExecutor};
//! use autoforge::r#loop::plan::PlanStep;
//!
//! let probe = MockServiceProbe::healthy().failing("/api/v1/orders");
//! let executor = ScriptedExecutor::new()
//!     .fail_times(PlanStep::StartService, 1, "Cannot find module 'express'");
//! ```

pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;
