//! Error types for the clearance module.

use uuid::Uuid;

/// Errors produced when recording a clearance decision.
#[derive(Debug, thiserror::Error)]
pub enum ClearanceError {
    #[error("decision targets run {decision_run} but gate belongs to run {gate_run}")]
    RunMismatch { gate_run: Uuid, decision_run: Uuid },

    #[error("clearance is not required for run {0}")]
    NotRequired(Uuid),

    #[error("clearance for run {run_id} was already decided by {approver}")]
    AlreadyDecided { run_id: Uuid, approver: String },

    #[error("{approver} is not an authorized reviewer for environment '{environment}'")]
    Unauthorized {
        approver: String,
        environment: String,
    },

    #[error("{approver} triggered run {run_id} and cannot clear it")]
    SelfReview { approver: String, run_id: Uuid },
}

/// Result type for clearance operations.
pub type ClearanceResult<T> = std::result::Result<T, ClearanceError>;
