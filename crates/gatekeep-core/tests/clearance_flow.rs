//! End-to-end clearance scenarios over the pure run state machine.

use chrono::{Duration as ChronoDuration, Utc};
use gatekeep_core::{
    classify, ApprovalEnvironment, ClearanceDecision, ClearanceError, ClearanceState,
    GatekeepError, JobOutcome, JobStatus, PipelineConfig, PipelineRun, RunAudit, RunEventKind,
    RunStatus, SkipReason, StepRecord, StepStatus, Trigger, TriggerEvent, TrustLabel,
};

const SHA_A: &str = "0123456789abcdef0123456789abcdef01234567";
const SHA_B: &str = "89abcdef0123456789abcdef0123456789abcdef";

fn event(kind: &str, origin: &str, sha: &str, actor: &str) -> TriggerEvent {
    TriggerEvent {
        event_kind: kind.to_string(),
        head_revision: sha.to_string(),
        repository: "ZwickyTransientFacility/scope".to_string(),
        origin_repository: origin.to_string(),
        actor: actor.to_string(),
        git_ref: Some("refs/heads/main".to_string()),
    }
}

fn start(config: &PipelineConfig, env: ApprovalEnvironment, ev: TriggerEvent) -> PipelineRun {
    let now = Utc::now();
    PipelineRun::new(
        Trigger::from_event(ev, now).unwrap(),
        config.canonical(),
        env,
        config.build_graph().unwrap(),
        config.budget(),
        now,
    )
    .unwrap()
}

fn finish_all(run: &mut PipelineRun, published: bool) {
    let now = Utc::now();
    while !run.ready_jobs().is_empty() {
        for name in run.ready_jobs() {
            let lease = run.start_job(&name, now).unwrap();
            let mut steps = Vec::new();
            if let Some(decision) = &lease.deploy {
                steps.push(StepRecord {
                    name: "deploy".to_string(),
                    status: if decision.is_publish() {
                        StepStatus::Succeeded
                    } else {
                        StepStatus::Skipped
                    },
                    exit_code: None,
                    duration_ms: 0,
                    detail: decision.skip_reason().map(str::to_string),
                    published_to: (published && decision.is_publish())
                        .then(|| "ZwickyTransientFacility/scope@gh-pages".to_string()),
                });
            }
            run.complete_job(&name, JobOutcome::Succeeded { steps }, now)
                .unwrap();
        }
    }
}

#[test]
fn test_push_from_canonical_runs_all_jobs_and_publishes() {
    let config = PipelineConfig::reference();
    let mut run = start(
        &config,
        config.environment(),
        event("push", "ZwickyTransientFacility/scope", SHA_A, "maintainer"),
    );
    assert_eq!(run.classification().label, TrustLabel::TrustedPush);
    assert_eq!(run.gate().state(), ClearanceState::NotRequired);
    assert!(run.gate().decision().is_none());

    finish_all(&mut run, true);
    assert_eq!(run.status(), RunStatus::Succeeded);
    assert!(run
        .events()
        .iter()
        .any(|e| matches!(e.kind, RunEventKind::Published { .. })));
    assert!(RunAudit::evaluate(&run).passed);
}

#[test]
fn test_fork_pull_request_rejected_runs_no_privileged_job() {
    let config = PipelineConfig::reference();
    let mut run = start(
        &config,
        config.environment(),
        event("pull_request", "someone/scope", SHA_A, "someone"),
    );
    assert_eq!(
        run.classification().label,
        TrustLabel::PullRequestUntrustedSource
    );
    assert!(run.is_suspended());
    assert!(run.ready_jobs().is_empty());

    let now = Utc::now();
    run.record_clearance(ClearanceDecision::reject(run.run_id(), "maintainer", now), now)
        .unwrap();

    assert_eq!(run.status(), RunStatus::Cancelled);
    for job in run.jobs().filter(|j| !j.is_clearance) {
        assert_eq!(job.status, JobStatus::Skipped);
        assert_eq!(job.skip_reason, Some(SkipReason::ClearanceRejected));
        assert!(job.started_at.is_none());
    }
    assert!(!run
        .events()
        .iter()
        .any(|e| matches!(e.kind, RunEventKind::JobStarted { .. })));
}

#[test]
fn test_approved_pull_request_builds_docs_without_publishing() {
    let config = PipelineConfig::reference();
    let mut run = start(
        &config,
        config.environment(),
        event("pull_request", "someone/scope", SHA_A, "someone"),
    );
    let now = Utc::now();
    run.record_clearance(ClearanceDecision::approve(run.run_id(), "maintainer", now), now)
        .unwrap();
    finish_all(&mut run, true);

    assert_eq!(run.status(), RunStatus::Succeeded);
    let docs = run.job("docs").unwrap();
    assert_eq!(docs.steps[0].status, StepStatus::Skipped);
    assert!(!run
        .events()
        .iter()
        .any(|e| matches!(e.kind, RunEventKind::Published { .. })));
    assert!(run
        .events()
        .iter()
        .any(|e| matches!(e.kind, RunEventKind::StepSkipped { .. })));
}

#[test]
fn test_reviewer_restrictions_enforced() {
    let config = PipelineConfig::reference();
    let env = ApprovalEnvironment::new("external-approval")
        .with_reviewer("maintainer")
        .with_reviewer("someone")
        .with_self_review_prevented();
    let mut run = start(
        &config,
        env,
        event("pull_request", "someone/scope", SHA_A, "someone"),
    );
    let now = Utc::now();

    let err = run
        .record_clearance(ClearanceDecision::approve(run.run_id(), "mallory", now), now)
        .unwrap_err();
    assert!(matches!(
        err,
        GatekeepError::Clearance(ClearanceError::Unauthorized { .. })
    ));

    let err = run
        .record_clearance(ClearanceDecision::approve(run.run_id(), "someone", now), now)
        .unwrap_err();
    assert!(matches!(
        err,
        GatekeepError::Clearance(ClearanceError::SelfReview { .. })
    ));
    assert_eq!(run.gate().state(), ClearanceState::AwaitingApproval);

    run.record_clearance(ClearanceDecision::approve(run.run_id(), "maintainer", now), now)
        .unwrap();
    assert_eq!(run.gate().state(), ClearanceState::Approved);
}

#[test]
fn test_new_trigger_gets_new_revision_and_old_run_is_untouched() {
    let config = PipelineConfig::reference();
    let first = start(
        &config,
        config.environment(),
        event("pull_request", "someone/scope", SHA_A, "someone"),
    );
    let snapshot = serde_json::to_string(&first).unwrap();

    let mut second = start(
        &config,
        config.environment(),
        event("pull_request", "someone/scope", SHA_B, "someone"),
    );
    let now = Utc::now();
    second
        .record_clearance(ClearanceDecision::approve(second.run_id(), "m", now), now)
        .unwrap();
    let lease = second.start_job("test", now).unwrap();
    assert_eq!(lease.revision.as_str(), SHA_B);
    assert_eq!(lease.repository, "someone/scope");

    assert_ne!(first.run_id(), second.run_id());
    assert_eq!(serde_json::to_string(&first).unwrap(), snapshot);
    assert_eq!(first.gate().state(), ClearanceState::AwaitingApproval);
}

#[test]
fn test_push_to_feature_branch_is_gated() {
    let config = PipelineConfig::reference();
    let mut ev = event("push", "ZwickyTransientFacility/scope", SHA_A, "maintainer");
    ev.git_ref = Some("refs/heads/feature".to_string());
    let trigger = Trigger::from_event(ev, Utc::now()).unwrap();
    let classification = classify(&trigger, &config.canonical());
    assert!(classification.requires_clearance());
}

#[test]
fn test_waiting_for_review_does_not_consume_budget() {
    let config = PipelineConfig::reference();
    let mut run = start(
        &config,
        config.environment(),
        event("pull_request", "someone/scope", SHA_A, "someone"),
    );
    let later = Utc::now() + ChronoDuration::days(2);
    run.record_clearance(ClearanceDecision::approve(run.run_id(), "m", later), later)
        .unwrap();
    let lease = run.start_job("test", later).unwrap();
    assert_eq!(lease.timeout, config.budget());
}
