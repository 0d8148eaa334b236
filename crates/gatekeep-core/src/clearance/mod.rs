//! Clearance gate: human approval before secret-bearing execution.
//!
//! - **Approval environments** name the reviewers allowed to clear a run.
//! - **Decisions** are immutable records of one reviewer's outcome.
//! - **The gate** is a per-run state machine:
//!   `not-required` (terminal pass) or
//!   `awaiting-approval` → `approved` | `rejected`.
//!
//! The gate is resolved by an explicit callback ([`ClearanceGate::record`]);
//! nothing polls it.

pub mod decision;
pub mod environment;
pub mod error;
pub mod gate;

pub use decision::{ClearanceDecision, ClearanceOutcome};
pub use environment::ApprovalEnvironment;
pub use error::{ClearanceError, ClearanceResult};
pub use gate::{ClearanceGate, ClearanceState};
