//! Append-only run event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::TrustLabel;
use crate::clearance::ClearanceOutcome;
use crate::run::{FailureCause, RunStatus, SkipReason};
use crate::trigger::EventKind;

/// Classification of an event in a run's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    RunCreated {
        label: TrustLabel,
        event_kind: EventKind,
        revision: String,
    },
    ClearanceNotRequired,
    ClearanceRequested {
        environment: String,
    },
    ClearanceDecided {
        approver: String,
        outcome: ClearanceOutcome,
    },
    RunSuspended,
    JobReady {
        job: String,
    },
    JobStarted {
        job: String,
        secret_bound: bool,
    },
    JobSucceeded {
        job: String,
    },
    JobFailed {
        job: String,
        cause: FailureCause,
    },
    JobSkipped {
        job: String,
        reason: SkipReason,
    },
    StepSkipped {
        job: String,
        step: String,
        reason: String,
    },
    Published {
        job: String,
        destination: String,
    },
    RunFinished {
        status: RunStatus,
    },
}

impl RunEventKind {
    /// Short machine name, e.g. `job_started`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunCreated { .. } => "run_created",
            Self::ClearanceNotRequired => "clearance_not_required",
            Self::ClearanceRequested { .. } => "clearance_requested",
            Self::ClearanceDecided { .. } => "clearance_decided",
            Self::RunSuspended => "run_suspended",
            Self::JobReady { .. } => "job_ready",
            Self::JobStarted { .. } => "job_started",
            Self::JobSucceeded { .. } => "job_succeeded",
            Self::JobFailed { .. } => "job_failed",
            Self::JobSkipped { .. } => "job_skipped",
            Self::StepSkipped { .. } => "step_skipped",
            Self::Published { .. } => "published",
            Self::RunFinished { .. } => "run_finished",
        }
    }
}

/// A single entry of a run's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    /// 1-based sequence number within the run.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub kind: RunEventKind,
}
