//! Exhaustive exploration of every schedule of the reference pipeline.
//!
//! From each reachable state the explorer tries every possible next action
//! (start any ready job, finish any running job with success or failure,
//! approve, reject) and checks at every state that no secret-bound job has
//! started without a passing gate. Terminal runs must also pass the audit.

use chrono::{DateTime, Utc};
use gatekeep_core::{
    ApprovalEnvironment, ClearanceDecision, ClearanceState, FailureCause, GatekeepError,
    JobOutcome, JobSpec, JobStatus, PipelineConfig, PipelineRun, RunAudit, RunStatus, StepSpec,
    Trigger, TriggerEvent,
};

const SHA: &str = "9c1b7e2d4f6a8c0e2b4d6f8a0c2e4b6d8f0a2c4e";

#[derive(Debug, Clone)]
enum Action {
    Start(String),
    Succeed(String),
    Fail(String),
    Approve,
    Reject,
}

#[derive(Default)]
struct Stats {
    states: usize,
    terminal: usize,
    cancelled: usize,
    succeeded: usize,
    failed: usize,
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::reference();
    // An unprivileged job that may run before clearance, feeding the docs job.
    config.jobs.insert(
        0,
        JobSpec::new("lint").step(StepSpec::run("lint", &["pre-commit", "run"])),
    );
    if let Some(docs) = config.jobs.iter_mut().find(|j| j.name == "docs") {
        docs.needs.push("lint".to_string());
    }
    config
}

fn new_run(kind: &str, origin: &str, now: DateTime<Utc>) -> PipelineRun {
    let config = config();
    let trigger = Trigger::from_event(
        TriggerEvent {
            event_kind: kind.to_string(),
            head_revision: SHA.to_string(),
            repository: config.repository.canonical.clone(),
            origin_repository: origin.to_string(),
            actor: "contributor".to_string(),
            git_ref: Some("refs/heads/main".to_string()),
        },
        now,
    )
    .unwrap();
    PipelineRun::new(
        trigger,
        config.canonical(),
        ApprovalEnvironment::new("external-approval"),
        config.build_graph().unwrap(),
        config.budget(),
        now,
    )
    .unwrap()
}

fn actions(run: &PipelineRun) -> Vec<Action> {
    if run.is_terminal() {
        return Vec::new();
    }
    let mut out: Vec<Action> = run.ready_jobs().into_iter().map(Action::Start).collect();
    for name in run.running_jobs() {
        out.push(Action::Succeed(name.clone()));
        out.push(Action::Fail(name));
    }
    if run.gate().state() == ClearanceState::AwaitingApproval {
        out.push(Action::Approve);
        out.push(Action::Reject);
    }
    out
}

fn apply(run: &mut PipelineRun, action: &Action, now: DateTime<Utc>) {
    match action {
        Action::Start(name) => {
            run.start_job(name, now).unwrap();
        }
        Action::Succeed(name) => run
            .complete_job(name, JobOutcome::Succeeded { steps: Vec::new() }, now)
            .unwrap(),
        Action::Fail(name) => run
            .complete_job(
                name,
                JobOutcome::Failed {
                    cause: FailureCause::CommandFailed {
                        step: name.clone(),
                        exit_code: 1,
                    },
                    steps: Vec::new(),
                },
                now,
            )
            .unwrap(),
        Action::Approve => {
            let id = run.run_id();
            run.record_clearance(ClearanceDecision::approve(id, "maintainer", now), now)
                .unwrap();
        }
        Action::Reject => {
            let id = run.run_id();
            run.record_clearance(ClearanceDecision::reject(id, "maintainer", now), now)
                .unwrap();
        }
    }
}

fn check_state(run: &PipelineRun, now: DateTime<Utc>) {
    let passes = run.gate().state().passes();
    for job in run.jobs().filter(|j| j.secret_bound) {
        if job.started_at.is_some() {
            assert!(
                passes,
                "secret-bound job '{}' started while gate is {}",
                job.name,
                run.gate().state()
            );
        }
        if !passes && job.status == JobStatus::Blocked {
            // Direct start attempts are refused regardless of scheduling.
            let mut attempt = run.clone();
            let err = attempt.start_job(&job.name, now).unwrap_err();
            assert!(matches!(
                err,
                GatekeepError::ClearanceRequired { .. }
                    | GatekeepError::ClearanceRejected { .. }
                    | GatekeepError::RunFinished(_)
            ));
        }
    }
}

fn explore(run: PipelineRun, now: DateTime<Utc>, stats: &mut Stats) {
    stats.states += 1;
    check_state(&run, now);

    let next = actions(&run);
    if next.is_empty() {
        assert!(run.is_terminal(), "run stuck in {:?}", run.status());
        let verdict = RunAudit::evaluate(&run);
        assert!(verdict.passed, "audit failed: {:?}", verdict.violations);
        stats.terminal += 1;
        match run.status() {
            RunStatus::Cancelled => {
                stats.cancelled += 1;
                assert!(run
                    .jobs()
                    .filter(|j| j.secret_bound)
                    .all(|j| j.started_at.is_none()));
            }
            RunStatus::Succeeded => stats.succeeded += 1,
            RunStatus::Failed => stats.failed += 1,
            other => panic!("unexpected terminal status {other}"),
        }
        return;
    }

    for action in next {
        let mut branch = run.clone();
        apply(&mut branch, &action, now);
        explore(branch, now, stats);
    }
}

#[test]
fn test_every_fork_pull_request_schedule_respects_clearance() {
    let now = Utc::now();
    let mut stats = Stats::default();
    explore(new_run("pull_request", "fork/scope", now), now, &mut stats);

    assert!(stats.states > 100);
    assert!(stats.cancelled > 0);
    assert!(stats.succeeded > 0);
    assert!(stats.failed > 0);
}

#[test]
fn test_every_pull_request_target_schedule_respects_clearance() {
    let now = Utc::now();
    let mut stats = Stats::default();
    explore(
        new_run("pull_request_target", "ZwickyTransientFacility/scope", now),
        now,
        &mut stats,
    );
    assert!(stats.cancelled > 0);
}

#[test]
fn test_trusted_push_schedules_never_park_or_cancel() {
    let now = Utc::now();
    let mut stats = Stats::default();
    explore(
        new_run("push", "ZwickyTransientFacility/scope", now),
        now,
        &mut stats,
    );
    assert_eq!(stats.cancelled, 0);
    assert!(stats.succeeded > 0);
}
