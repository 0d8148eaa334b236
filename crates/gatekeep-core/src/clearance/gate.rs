//! Per-run clearance gate state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::decision::{ClearanceDecision, ClearanceOutcome};
use super::environment::ApprovalEnvironment;
use super::error::{ClearanceError, ClearanceResult};
use crate::classify::Classification;

/// State of a clearance gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClearanceState {
    /// Trusted push; no human review needed.
    NotRequired,
    /// Suspended until a reviewer records a decision.
    AwaitingApproval,
    Approved,
    Rejected,
}

impl ClearanceState {
    /// Whether secret-bound jobs may proceed.
    pub fn passes(&self) -> bool {
        matches!(self, Self::NotRequired | Self::Approved)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::AwaitingApproval)
    }
}

impl fmt::Display for ClearanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotRequired => "not-required",
            Self::AwaitingApproval => "awaiting-approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// The clearance gate of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearanceGate {
    pub run_id: Uuid,
    pub environment: ApprovalEnvironment,
    /// Actor that caused the trigger; checked against self-review.
    pub trigger_actor: String,
    state: ClearanceState,
    requested_at: Option<DateTime<Utc>>,
    decision: Option<ClearanceDecision>,
}

impl ClearanceGate {
    /// Open the gate for a classified trigger.
    ///
    /// PR-sourced classifications enter `awaiting-approval` immediately;
    /// trusted pushes are `not-required`.
    pub fn open(
        run_id: Uuid,
        environment: ApprovalEnvironment,
        trigger_actor: impl Into<String>,
        classification: &Classification,
        now: DateTime<Utc>,
    ) -> Self {
        let (state, requested_at) = if classification.requires_clearance() {
            (ClearanceState::AwaitingApproval, Some(now))
        } else {
            (ClearanceState::NotRequired, None)
        };
        Self {
            run_id,
            environment,
            trigger_actor: trigger_actor.into(),
            state,
            requested_at,
            decision: None,
        }
    }

    pub fn state(&self) -> ClearanceState {
        self.state
    }

    pub fn decision(&self) -> Option<&ClearanceDecision> {
        self.decision.as_ref()
    }

    pub fn requested_at(&self) -> Option<DateTime<Utc>> {
        self.requested_at
    }

    /// Record a reviewer decision.
    ///
    /// # Errors
    ///
    /// - [`ClearanceError::RunMismatch`] if the decision names another run.
    /// - [`ClearanceError::NotRequired`] for a trusted push.
    /// - [`ClearanceError::AlreadyDecided`] once a decision exists; the
    ///   recorded decision is never replaced.
    /// - [`ClearanceError::Unauthorized`] / [`ClearanceError::SelfReview`]
    ///   when the approver is not allowed by the environment.
    pub fn record(&mut self, decision: ClearanceDecision) -> ClearanceResult<ClearanceState> {
        if decision.run_id != self.run_id {
            return Err(ClearanceError::RunMismatch {
                gate_run: self.run_id,
                decision_run: decision.run_id,
            });
        }

        match self.state {
            ClearanceState::NotRequired => return Err(ClearanceError::NotRequired(self.run_id)),
            ClearanceState::Approved | ClearanceState::Rejected => {
                let approver = self
                    .decision
                    .as_ref()
                    .map(|d| d.approver.clone())
                    .unwrap_or_default();
                return Err(ClearanceError::AlreadyDecided {
                    run_id: self.run_id,
                    approver,
                });
            }
            ClearanceState::AwaitingApproval => {}
        }

        if !self.environment.admits(&decision.approver) {
            return Err(ClearanceError::Unauthorized {
                approver: decision.approver,
                environment: self.environment.name.clone(),
            });
        }

        if self.environment.prevent_self_review
            && decision.approver.eq_ignore_ascii_case(&self.trigger_actor)
        {
            return Err(ClearanceError::SelfReview {
                approver: decision.approver,
                run_id: self.run_id,
            });
        }

        self.state = match decision.outcome {
            ClearanceOutcome::Approved => ClearanceState::Approved,
            ClearanceOutcome::Rejected => ClearanceState::Rejected,
        };
        self.decision = Some(decision);
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{SecretAccess, TrustLabel};

    fn pr() -> Classification {
        Classification {
            label: TrustLabel::PullRequestUntrustedSource,
            secret_access: SecretAccess::AfterClearance,
        }
    }

    fn push() -> Classification {
        Classification {
            label: TrustLabel::TrustedPush,
            secret_access: SecretAccess::Immediate,
        }
    }

    fn gate(env: ApprovalEnvironment) -> ClearanceGate {
        ClearanceGate::open(Uuid::new_v4(), env, "contributor", &pr(), Utc::now())
    }

    #[test]
    fn test_push_gate_not_required() {
        let g = ClearanceGate::open(
            Uuid::new_v4(),
            ApprovalEnvironment::new("external-approval"),
            "octo",
            &push(),
            Utc::now(),
        );
        assert_eq!(g.state(), ClearanceState::NotRequired);
        assert!(g.state().passes());
        assert!(g.requested_at().is_none());
    }

    #[test]
    fn test_pr_gate_awaits_approval() {
        let g = gate(ApprovalEnvironment::new("external-approval"));
        assert_eq!(g.state(), ClearanceState::AwaitingApproval);
        assert!(!g.state().passes());
        assert!(!g.state().is_terminal());
        assert!(g.requested_at().is_some());
    }

    #[test]
    fn test_approve_passes() {
        let mut g = gate(ApprovalEnvironment::new("external-approval"));
        let state = g
            .record(ClearanceDecision::approve(g.run_id, "maintainer", Utc::now()))
            .unwrap();
        assert_eq!(state, ClearanceState::Approved);
        assert!(state.passes());
        assert_eq!(g.decision().unwrap().approver, "maintainer");
    }

    #[test]
    fn test_reject_is_terminal_and_immutable() {
        let mut g = gate(ApprovalEnvironment::new("external-approval"));
        g.record(ClearanceDecision::reject(g.run_id, "maintainer", Utc::now()))
            .unwrap();
        assert_eq!(g.state(), ClearanceState::Rejected);

        let err = g
            .record(ClearanceDecision::approve(g.run_id, "other", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, ClearanceError::AlreadyDecided { ref approver, .. } if approver == "maintainer"));
        assert_eq!(g.state(), ClearanceState::Rejected);
    }

    #[test]
    fn test_decision_for_other_run_rejected() {
        let mut g = gate(ApprovalEnvironment::new("external-approval"));
        let err = g
            .record(ClearanceDecision::approve(Uuid::new_v4(), "m", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, ClearanceError::RunMismatch { .. }));
    }

    #[test]
    fn test_decision_on_trusted_push_rejected() {
        let mut g = ClearanceGate::open(
            Uuid::new_v4(),
            ApprovalEnvironment::new("external-approval"),
            "octo",
            &push(),
            Utc::now(),
        );
        let err = g
            .record(ClearanceDecision::approve(g.run_id, "m", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, ClearanceError::NotRequired(_)));
    }

    #[test]
    fn test_unlisted_reviewer_unauthorized() {
        let mut g = gate(ApprovalEnvironment::new("external-approval").with_reviewer("alice"));
        let err = g
            .record(ClearanceDecision::approve(g.run_id, "mallory", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, ClearanceError::Unauthorized { .. }));
        assert_eq!(g.state(), ClearanceState::AwaitingApproval);
    }

    #[test]
    fn test_self_review_prevented() {
        let mut g = gate(ApprovalEnvironment::new("external-approval").with_self_review_prevented());
        let err = g
            .record(ClearanceDecision::approve(g.run_id, "contributor", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, ClearanceError::SelfReview { .. }));
    }

    #[test]
    fn test_serde_roundtrip_preserves_state() {
        let mut g = gate(ApprovalEnvironment::new("external-approval"));
        g.record(ClearanceDecision::approve(g.run_id, "m", Utc::now()))
            .unwrap();
        let json = serde_json::to_string(&g).unwrap();
        let back: ClearanceGate = serde_json::from_str(&json).unwrap();
        assert_eq!(g, back);
        assert_eq!(back.state(), ClearanceState::Approved);
    }
}
