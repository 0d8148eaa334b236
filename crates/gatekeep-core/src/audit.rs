//! After-the-fact audit of a run's event log.
//!
//! The state machine refuses illegal transitions as they happen; the audit
//! replays the recorded events and checks the same rules independently, so
//! a stored run can be verified without trusting the code that produced it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::classify::CanonicalRepository;
use crate::clearance::ClearanceOutcome;
use crate::deploy;
use crate::event::{RunEvent, RunEventKind};
use crate::graph::JobGraph;
use crate::run::{PipelineRun, RunStatus};
use crate::trigger::Trigger;

/// Audit verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditVerdict {
    /// Whether the log is consistent with the run's rules.
    pub passed: bool,

    /// Violations found (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Event-log audit rules.
pub struct RunAudit;

impl RunAudit {
    /// Audit a run using its own graph, trigger and events.
    pub fn evaluate(run: &PipelineRun) -> AuditVerdict {
        Self::evaluate_events(run.graph(), run.trigger(), run.canonical(), run.events())
    }

    /// Audit rules:
    /// - when clearance was requested, no secret-bound job starts before an
    ///   approved decision, and nothing starts after a rejection
    /// - a job starts only after each declared dependency succeeded
    /// - publishing happens only for pushes from the canonical repository
    /// - a finished run has no job that started without finishing
    /// - a succeeded run has no failed job
    pub fn evaluate_events(
        graph: &JobGraph,
        trigger: &Trigger,
        canonical: &CanonicalRepository,
        events: &[RunEvent],
    ) -> AuditVerdict {
        let mut violations = Vec::new();

        let mut clearance_requested = false;
        let mut approved = false;
        let mut rejected = false;
        let mut started = HashSet::new();
        let mut succeeded = HashSet::new();
        let mut finished = HashSet::new();
        let mut any_failed = false;

        for event in events {
            match &event.kind {
                RunEventKind::ClearanceRequested { .. } => clearance_requested = true,
                RunEventKind::ClearanceDecided { outcome, .. } => match outcome {
                    ClearanceOutcome::Approved => approved = true,
                    ClearanceOutcome::Rejected => rejected = true,
                },
                RunEventKind::JobStarted { job, secret_bound } => {
                    if *secret_bound && clearance_requested && !approved {
                        violations.push(format!(
                            "Secret-bound job '{}' started without approved clearance (seq {})",
                            job, event.seq
                        ));
                    }
                    if rejected {
                        violations.push(format!(
                            "Job '{}' started after clearance was rejected (seq {})",
                            job, event.seq
                        ));
                    }
                    let declared = graph.job(job).map(|spec| spec.needs.as_slice());
                    for dep in declared.unwrap_or_default() {
                        if !succeeded.contains(dep.as_str()) {
                            violations.push(format!(
                                "Job '{}' started before dependency '{}' succeeded",
                                job, dep
                            ));
                        }
                    }
                    started.insert(job.as_str());
                }
                RunEventKind::JobSucceeded { job } => {
                    succeeded.insert(job.as_str());
                    finished.insert(job.as_str());
                }
                RunEventKind::JobFailed { job, .. } => {
                    any_failed = true;
                    finished.insert(job.as_str());
                }
                RunEventKind::Published { job, destination } => {
                    if !deploy::evaluate(trigger, canonical).is_publish() {
                        violations.push(format!(
                            "Job '{}' published to {} for a {} from {}",
                            job, destination, trigger.event_kind, trigger.origin_repository
                        ));
                    }
                }
                RunEventKind::RunFinished { status } => {
                    for job in started.difference(&finished) {
                        violations.push(format!(
                            "Job '{}' was started but never finished",
                            job
                        ));
                    }
                    if *status == RunStatus::Succeeded && any_failed {
                        violations.push("Run succeeded although a job failed".to_string());
                    }
                }
                _ => {}
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            "Run log is consistent".to_string()
        } else {
            format!("Audit failed with {} violation(s)", violations.len())
        };

        AuditVerdict {
            passed,
            violations,
            message,
        }
    }
}
