//! Clearance decisions recorded by reviewers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of a clearance review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearanceOutcome {
    Approved,
    Rejected,
}

impl ClearanceOutcome {
    pub fn is_approval(self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// A reviewer's decision on a run's clearance gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearanceDecision {
    /// Run this decision applies to.
    pub run_id: Uuid,
    /// Identity of the reviewer.
    pub approver: String,
    pub outcome: ClearanceOutcome,
    pub decided_at: DateTime<Utc>,
    /// Optional comment from the reviewer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ClearanceDecision {
    pub fn new(
        run_id: Uuid,
        approver: impl Into<String>,
        outcome: ClearanceOutcome,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            approver: approver.into(),
            outcome,
            decided_at: now,
            comment,
        }
    }

    pub fn approve(run_id: Uuid, approver: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(run_id, approver, ClearanceOutcome::Approved, None, now)
    }

    pub fn reject(run_id: Uuid, approver: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(run_id, approver, ClearanceOutcome::Rejected, None, now)
    }
}
