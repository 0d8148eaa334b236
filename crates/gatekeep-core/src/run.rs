//! Pipeline run state machine.
//!
//! A [`PipelineRun`] owns every piece of mutable state of one run: the job
//! instances, the clearance gate, the execution budget and the event log.
//! It performs no I/O. A driver asks it for ready jobs, calls
//! [`PipelineRun::start_job`] to obtain a [`JobLease`], executes the job
//! elsewhere and reports back through [`PipelineRun::complete_job`].
//! Reviewer decisions enter through [`PipelineRun::record_clearance`].
//!
//! `start_job` is the only way a job reaches `running`, and it refuses
//! secret-bound jobs while the gate does not pass, whatever the scheduler
//! said.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::{classify, CanonicalRepository, Classification, TrustLabel};
use crate::clearance::{
    ApprovalEnvironment, ClearanceDecision, ClearanceGate, ClearanceOutcome, ClearanceState,
};
use crate::deploy::{self, DeployDecision};
use crate::error::{GatekeepError, GatekeepResult};
use crate::event::{RunEvent, RunEventKind};
use crate::graph::{GraphNode, JobGraph, JobSpec};
use crate::metrics::METRICS;
use crate::obs;
use crate::scheduler::{self, Transition};
use crate::trigger::{EventKind, Revision, Trigger};

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Blocked,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    CommandFailed { step: String, exit_code: i32 },
    Timeout { step: String, limit_secs: u64 },
    SecretUnavailable { secret: String },
    CheckoutFailed { reason: String },
    PublishFailed { reason: String },
    ExecutionError { step: String, reason: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandFailed { step, exit_code } => {
                write!(f, "step '{step}' exited with code {exit_code}")
            }
            Self::Timeout { step, limit_secs } => {
                write!(f, "step '{step}' timed out after {limit_secs}s")
            }
            Self::SecretUnavailable { secret } => write!(f, "secret '{secret}' is unavailable"),
            Self::CheckoutFailed { reason } => write!(f, "checkout failed: {reason}"),
            Self::PublishFailed { reason } => write!(f, "publish failed: {reason}"),
            Self::ExecutionError { step, reason } => {
                write!(f, "step '{step}' could not run: {reason}")
            }
        }
    }
}

/// Why a job was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    DependencyFailed { dependency: String },
    ClearanceRejected,
    BudgetExhausted,
}

impl SkipReason {
    /// Whether the skip makes the run fail on its own.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::BudgetExhausted)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyFailed { dependency } => {
                write!(f, "dependency '{dependency}' did not succeed")
            }
            Self::ClearanceRejected => f.write_str("clearance rejected"),
            Self::BudgetExhausted => f.write_str("execution budget exhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Result of one step, as recorded on the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Skip reason or failure summary. Never contains secret values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Destination when a deploy step published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_to: Option<String>,
}

/// What a driver reports back after executing a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { steps: Vec<StepRecord> },
    Failed { cause: FailureCause, steps: Vec<StepRecord> },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// One job (or the clearance node) within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub name: String,
    pub status: JobStatus,
    /// The synthetic clearance node rather than a declared job.
    pub is_clearance: bool,
    pub secret_bound: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureCause>,
    pub skip_reason: Option<SkipReason>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

impl JobInstance {
    fn for_node(name: &str, node: &GraphNode) -> Self {
        let (is_clearance, secret_bound) = match node {
            GraphNode::Clearance => (true, false),
            GraphNode::Job(spec) => (false, spec.requires_clearance()),
        };
        Self {
            name: name.to_string(),
            status: JobStatus::Blocked,
            is_clearance,
            secret_bound,
            started_at: None,
            finished_at: None,
            failure: None,
            skip_reason: None,
            steps: Vec::new(),
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}

/// Wall-clock budget of a run, counted only while execution is active.
///
/// The clock is paused whenever the run parks on the clearance gate, so
/// time spent waiting for a reviewer is never charged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionBudget {
    limit_secs: u64,
    consumed_ms: u64,
    active_since: Option<DateTime<Utc>>,
}

impl ExecutionBudget {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit_secs: limit.as_secs(),
            consumed_ms: 0,
            active_since: None,
        }
    }

    pub fn limit(&self) -> Duration {
        Duration::from_secs(self.limit_secs)
    }

    pub fn is_active(&self) -> bool {
        self.active_since.is_some()
    }

    /// Start (or keep) counting.
    pub fn resume(&mut self, now: DateTime<Utc>) {
        if self.active_since.is_none() {
            self.active_since = Some(now);
        }
    }

    /// Stop counting, banking the elapsed active time.
    pub fn pause(&mut self, now: DateTime<Utc>) {
        if let Some(since) = self.active_since.take() {
            self.consumed_ms += (now - since).num_milliseconds().max(0) as u64;
        }
    }

    pub fn consumed(&self, now: DateTime<Utc>) -> Duration {
        let active = self
            .active_since
            .map_or(0, |since| (now - since).num_milliseconds().max(0) as u64);
        Duration::from_millis(self.consumed_ms + active)
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.limit().saturating_sub(self.consumed(now))
    }

    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now).is_zero()
    }
}

/// Everything a runner needs to execute one started job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLease {
    pub run_id: Uuid,
    pub job: JobSpec,
    pub revision: Revision,
    /// Repository the pinned revision is fetched from.
    pub repository: String,
    /// Smaller of the job's own timeout and the run's remaining budget.
    pub timeout: Duration,
    /// Present when the job ends in a deploy step.
    pub deploy: Option<DeployDecision>,
}

/// State of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    run_id: Uuid,
    trigger: Trigger,
    canonical: CanonicalRepository,
    classification: Classification,
    gate: ClearanceGate,
    graph: JobGraph,
    graph_digest: String,
    jobs: BTreeMap<String, JobInstance>,
    status: RunStatus,
    budget: ExecutionBudget,
    events: Vec<RunEvent>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Classify the trigger, open the clearance gate and schedule the roots.
    pub fn new(
        trigger: Trigger,
        canonical: CanonicalRepository,
        environment: ApprovalEnvironment,
        graph: JobGraph,
        budget: Duration,
        now: DateTime<Utc>,
    ) -> GatekeepResult<Self> {
        let run_id = Uuid::new_v4();
        let classification = classify(&trigger, &canonical);
        let gate = ClearanceGate::open(
            run_id,
            environment,
            trigger.actor.clone(),
            &classification,
            now,
        );
        let graph_digest = graph.digest()?;
        let jobs = graph
            .order()
            .iter()
            .filter_map(|name| {
                graph
                    .node(name)
                    .map(|node| (name.clone(), JobInstance::for_node(name, node)))
            })
            .collect();

        let mut run = Self {
            run_id,
            trigger,
            canonical,
            classification,
            gate,
            graph,
            graph_digest,
            jobs,
            status: RunStatus::Pending,
            budget: ExecutionBudget::new(budget),
            events: Vec::new(),
            created_at: now,
            finished_at: None,
        };

        let run_id = run.run_id.to_string();
        run.push_event(
            now,
            RunEventKind::RunCreated {
                label: run.classification.label,
                event_kind: run.trigger.event_kind,
                revision: run.trigger.source_revision.to_string(),
            },
        );
        obs::emit_run_created(
            &run_id,
            &run.classification.label.to_string(),
            run.trigger.event_kind.as_str(),
            run.trigger.source_revision.as_str(),
        );
        METRICS.inc_runs_created();

        if run.gate.state() == ClearanceState::AwaitingApproval {
            let environment = run.gate.environment.name.clone();
            obs::emit_clearance_requested(&run_id, &environment);
            METRICS.inc_clearances_requested();
            run.push_event(now, RunEventKind::ClearanceRequested { environment });
        } else {
            run.push_event(now, RunEventKind::ClearanceNotRequired);
        }

        run.settle_clearance_node(now);
        run.advance(now);
        Ok(run)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn canonical(&self) -> &CanonicalRepository {
        &self.canonical
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn gate(&self) -> &ClearanceGate {
        &self.gate
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    pub fn graph_digest(&self) -> &str {
        &self.graph_digest
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn budget(&self) -> &ExecutionBudget {
        &self.budget
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn job(&self, name: &str) -> Option<&JobInstance> {
        self.jobs.get(name)
    }

    /// Job instances in topological order, clearance node included.
    pub fn jobs(&self) -> impl Iterator<Item = &JobInstance> {
        self.graph.order().iter().filter_map(|n| self.jobs.get(n))
    }

    /// Names of `ready` jobs, in topological order.
    pub fn ready_jobs(&self) -> Vec<String> {
        self.names_with(JobStatus::Ready)
    }

    pub fn running_jobs(&self) -> Vec<String> {
        self.names_with(JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Parked on the clearance gate: nothing running, nothing runnable.
    pub fn is_suspended(&self) -> bool {
        !self.is_terminal()
            && self.gate.state() == ClearanceState::AwaitingApproval
            && self
                .jobs
                .values()
                .all(|j| !matches!(j.status, JobStatus::Ready | JobStatus::Running))
    }

    /// Move a ready job to `running`.
    ///
    /// # Errors
    ///
    /// - [`GatekeepError::ClearanceRequired`] for a secret-bound job while the
    ///   gate does not pass; checked before anything else about the job.
    /// - [`GatekeepError::ClearanceRejected`] once the gate was rejected.
    /// - [`GatekeepError::InvalidTransition`] if the job is not `ready`.
    pub fn start_job(&mut self, name: &str, now: DateTime<Utc>) -> GatekeepResult<JobLease> {
        if self.is_terminal() {
            return Err(GatekeepError::RunFinished(self.run_id));
        }
        let spec = self
            .graph
            .job(name)
            .cloned()
            .ok_or_else(|| GatekeepError::UnknownJob(name.to_string()))?;

        if spec.requires_clearance() && !self.gate.state().passes() {
            if let Some(decision) = self
                .gate
                .decision()
                .filter(|d| d.outcome == ClearanceOutcome::Rejected)
            {
                return Err(GatekeepError::ClearanceRejected {
                    approver: decision.approver.clone(),
                });
            }
            return Err(GatekeepError::ClearanceRequired {
                job: name.to_string(),
            });
        }

        let instance = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| GatekeepError::UnknownJob(name.to_string()))?;
        if instance.status != JobStatus::Ready {
            return Err(GatekeepError::InvalidTransition {
                job: name.to_string(),
                from: instance.status.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }
        instance.status = JobStatus::Running;
        instance.started_at = Some(now);

        self.budget.resume(now);
        let remaining = self.budget.remaining(now);
        let timeout = spec
            .timeout_minutes
            .map(|m| Duration::from_secs(m.saturating_mul(60)))
            .map_or(remaining, |t| t.min(remaining));

        if self.status == RunStatus::Pending {
            self.status = RunStatus::Running;
        }

        let secret_bound = spec.requires_clearance();
        self.push_event(
            now,
            RunEventKind::JobStarted {
                job: name.to_string(),
                secret_bound,
            },
        );
        obs::emit_job_started(&self.run_id.to_string(), name, secret_bound);
        METRICS.inc_jobs_executed();

        let deploy = spec
            .deploy_step()
            .map(|_| deploy::evaluate(&self.trigger, &self.canonical));

        Ok(JobLease {
            run_id: self.run_id,
            repository: self.trigger.origin_repository.clone(),
            revision: self.trigger.source_revision.clone(),
            job: spec,
            timeout,
            deploy,
        })
    }

    /// Record the outcome of a running job and reschedule.
    pub fn complete_job(
        &mut self,
        name: &str,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> GatekeepResult<()> {
        let instance = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| GatekeepError::UnknownJob(name.to_string()))?;
        if instance.status != JobStatus::Running {
            return Err(GatekeepError::InvalidTransition {
                job: name.to_string(),
                from: instance.status.to_string(),
                to: "finished".to_string(),
            });
        }

        let mut events = Vec::new();
        let steps = match outcome {
            JobOutcome::Succeeded { steps } => {
                instance.status = JobStatus::Succeeded;
                steps
            }
            JobOutcome::Failed { cause, steps } => {
                instance.status = JobStatus::Failed;
                instance.failure = Some(cause);
                steps
            }
        };
        for step in &steps {
            if step.status == StepStatus::Skipped {
                events.push(RunEventKind::StepSkipped {
                    job: name.to_string(),
                    step: step.name.clone(),
                    reason: step.detail.clone().unwrap_or_default(),
                });
            }
            if let Some(destination) = &step.published_to {
                events.push(RunEventKind::Published {
                    job: name.to_string(),
                    destination: destination.clone(),
                });
            }
        }
        instance.steps = steps;
        instance.finished_at = Some(now);

        let status = instance.status;
        let duration_ms = instance.duration_ms();
        match &instance.failure {
            Some(cause) if status == JobStatus::Failed => events.push(RunEventKind::JobFailed {
                job: name.to_string(),
                cause: cause.clone(),
            }),
            _ => events.push(RunEventKind::JobSucceeded {
                job: name.to_string(),
            }),
        }

        for kind in events {
            self.push_event(now, kind);
        }
        obs::emit_job_finished(&self.run_id.to_string(), name, status.as_str(), duration_ms);
        if status == JobStatus::Failed {
            METRICS.inc_jobs_failed();
        }

        self.advance(now);
        Ok(())
    }

    /// Record a reviewer decision on the clearance gate.
    ///
    /// Approval unblocks the secret-bound jobs; rejection skips every job
    /// that has not started in one transition and cancels the run.
    pub fn record_clearance(
        &mut self,
        decision: ClearanceDecision,
        now: DateTime<Utc>,
    ) -> GatekeepResult<ClearanceState> {
        if self.is_terminal() && self.gate.state() == ClearanceState::AwaitingApproval {
            return Err(GatekeepError::RunFinished(self.run_id));
        }

        let run_id = self.run_id.to_string();
        let approver = decision.approver.clone();
        let outcome = decision.outcome;
        let state = match self.gate.record(decision) {
            Ok(state) => state,
            Err(err) => {
                obs::emit_clearance_refused(&run_id, &err);
                return Err(err.into());
            }
        };

        obs::emit_clearance_decided(&run_id, &approver, outcome.is_approval());
        self.push_event(now, RunEventKind::ClearanceDecided { approver, outcome });

        match state {
            ClearanceState::Approved => self.settle_clearance_node(now),
            ClearanceState::Rejected => {
                METRICS.inc_clearances_rejected();
                self.cancel_unstarted(now);
            }
            ClearanceState::NotRequired | ClearanceState::AwaitingApproval => {}
        }

        self.advance(now);
        Ok(state)
    }

    /// Check that the stored graph still matches its recorded digest.
    pub fn verify_integrity(&self) -> GatekeepResult<()> {
        let actual = self.graph.digest()?;
        if actual != self.graph_digest {
            return Err(GatekeepError::config(format!(
                "job graph of run {} was modified: recorded digest {}, computed {}",
                self.run_id, self.graph_digest, actual
            )));
        }
        let declared = self.graph.order().len();
        if self.jobs.len() != declared
            || self.graph.order().iter().any(|n| !self.jobs.contains_key(n))
        {
            return Err(GatekeepError::config(format!(
                "job instances of run {} do not match its graph",
                self.run_id
            )));
        }
        Ok(())
    }

    /// Summary for status output.
    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.run_id,
            status: self.status,
            suspended: self.is_suspended(),
            label: self.classification.label,
            event_kind: self.trigger.event_kind,
            revision: self.trigger.source_revision.to_string(),
            clearance: self.gate.state(),
            approver: self.gate.decision().map(|d| d.approver.clone()),
            jobs: self
                .jobs()
                .filter(|j| !j.is_clearance)
                .map(|j| JobSummary {
                    name: j.name.clone(),
                    status: j.status,
                    detail: j
                        .failure
                        .as_ref()
                        .map(ToString::to_string)
                        .or_else(|| j.skip_reason.as_ref().map(ToString::to_string)),
                })
                .collect(),
        }
    }

    fn names_with(&self, status: JobStatus) -> Vec<String> {
        self.jobs()
            .filter(|j| j.status == status)
            .map(|j| j.name.clone())
            .collect()
    }

    fn push_event(&mut self, at: DateTime<Utc>, kind: RunEventKind) {
        let seq = self.events.len() as u64 + 1;
        self.events.push(RunEvent { seq, at, kind });
    }

    /// Mark the clearance node succeeded once the gate passes.
    fn settle_clearance_node(&mut self, now: DateTime<Utc>) {
        if !self.gate.state().passes() {
            return;
        }
        let node = self.graph.clearance_node().to_string();
        if let Some(instance) = self.jobs.get_mut(&node) {
            if instance.status == JobStatus::Blocked {
                instance.status = JobStatus::Succeeded;
                instance.started_at = self.gate.requested_at().or(Some(now));
                instance.finished_at = Some(now);
            }
        }
    }

    fn cancel_unstarted(&mut self, now: DateTime<Utc>) {
        let names: Vec<String> = self
            .jobs()
            .filter(|j| matches!(j.status, JobStatus::Blocked | JobStatus::Ready))
            .map(|j| j.name.clone())
            .collect();
        for name in names {
            self.skip(&name, Some(SkipReason::ClearanceRejected), now);
        }
    }

    fn skip(&mut self, name: &str, reason: Option<SkipReason>, now: DateTime<Utc>) {
        let Some(instance) = self.jobs.get_mut(name) else {
            return;
        };
        instance.status = JobStatus::Skipped;
        instance.skip_reason = reason.clone();
        instance.finished_at = Some(now);
        let is_clearance = instance.is_clearance;

        if let Some(reason) = reason {
            self.push_event(
                now,
                RunEventKind::JobSkipped {
                    job: name.to_string(),
                    reason,
                },
            );
        }
        if !is_clearance {
            obs::emit_job_finished(&self.run_id.to_string(), name, "skipped", 0);
        }
    }

    /// Apply scheduler transitions and recompute the run status.
    fn advance(&mut self, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }

        if self.budget.is_exhausted(now) {
            let pending: Vec<String> = self
                .jobs()
                .filter(|j| {
                    !j.is_clearance && matches!(j.status, JobStatus::Blocked | JobStatus::Ready)
                })
                .map(|j| j.name.clone())
                .collect();
            for name in pending {
                self.skip(&name, Some(SkipReason::BudgetExhausted), now);
            }
        }

        let statuses: BTreeMap<String, JobStatus> = self
            .jobs
            .iter()
            .map(|(n, j)| (n.clone(), j.status))
            .collect();
        for transition in scheduler::evaluate(&self.graph, &statuses, self.gate.state()) {
            match transition {
                Transition::Ready(name) => {
                    if let Some(instance) = self.jobs.get_mut(&name) {
                        instance.status = JobStatus::Ready;
                    }
                    self.push_event(now, RunEventKind::JobReady { job: name });
                }
                Transition::Skip { job, reason } => self.skip(&job, Some(reason), now),
            }
        }

        self.refresh_status(now);
    }

    fn refresh_status(&mut self, now: DateTime<Utc>) {
        let active = self
            .jobs
            .values()
            .any(|j| matches!(j.status, JobStatus::Ready | JobStatus::Running));
        if active {
            return;
        }

        if self.gate.state() == ClearanceState::Rejected {
            self.finish(RunStatus::Cancelled, now);
            return;
        }

        let declared_done = self
            .jobs
            .values()
            .filter(|j| !j.is_clearance)
            .all(|j| j.status.is_terminal());
        if declared_done {
            // Nothing left that needs the gate; close the node without a decision.
            let node = self.graph.clearance_node().to_string();
            if self.jobs.get(&node).map(|j| j.status) == Some(JobStatus::Blocked) {
                self.skip(&node, None, now);
            }

            let failed = self.jobs.values().any(|j| {
                j.status == JobStatus::Failed
                    || j.skip_reason.as_ref().is_some_and(SkipReason::is_failure)
            });
            let status = if failed {
                RunStatus::Failed
            } else {
                RunStatus::Succeeded
            };
            self.finish(status, now);
            return;
        }

        if self.gate.state() == ClearanceState::AwaitingApproval {
            self.budget.pause(now);
            let already = matches!(
                self.events.last().map(|e| &e.kind),
                Some(RunEventKind::RunSuspended)
            );
            if !already {
                self.push_event(now, RunEventKind::RunSuspended);
                obs::emit_run_suspended(&self.run_id.to_string(), &self.gate.environment.name);
            }
        }
    }

    fn finish(&mut self, status: RunStatus, now: DateTime<Utc>) {
        self.budget.pause(now);
        self.status = status;
        self.finished_at = Some(now);
        self.push_event(now, RunEventKind::RunFinished { status });
        obs::emit_run_finished(
            &self.run_id.to_string(),
            status.as_str(),
            self.budget.consumed(now).as_millis() as u64,
            self.events.len() as u64,
        );
    }
}

/// Per-job line of a [`RunReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub name: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Compact, serialisable view of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub suspended: bool,
    pub label: TrustLabel,
    pub event_kind: EventKind,
    pub revision: String,
    pub clearance: ClearanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    pub jobs: Vec<JobSummary>,
}

impl RunReport {
    /// Process exit code: 0 succeeded, 1 failed, 2 cancelled, 3 waiting.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 1,
            RunStatus::Cancelled => 2,
            RunStatus::Pending | RunStatus::Running => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DeploySpec, SecretBinding, StepSpec, DEFAULT_CLEARANCE_NODE};
    use crate::trigger::TriggerEvent;
    use chrono::Duration as ChronoDuration;
    use std::path::PathBuf;

    const SHA: &str = "3f2a9c1e5b7d4a6f8e0c2b4d6a8f0e1c3b5d7a9f";

    fn trigger(kind: &str, origin: &str) -> Trigger {
        Trigger::from_event(
            TriggerEvent {
                event_kind: kind.into(),
                head_revision: SHA.into(),
                repository: "acme/scope".into(),
                origin_repository: origin.into(),
                actor: "contributor".into(),
                git_ref: Some("refs/heads/main".into()),
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn graph() -> JobGraph {
        JobGraph::build(
            vec![
                JobSpec::new("lint").step(StepSpec::run("lint", &["cargo", "fmt", "--check"])),
                JobSpec::new("test")
                    .secret(SecretBinding::same_name("TOKEN"))
                    .timeout_minutes(5)
                    .step(StepSpec::run("test", &["cargo", "test"])),
                JobSpec::new("docs")
                    .needs("test")
                    .secret(SecretBinding::same_name("DEPLOY_KEY"))
                    .step(StepSpec::run("build", &["make", "html"]))
                    .step(StepSpec::deploy(
                        "deploy",
                        DeploySpec {
                            source_dir: PathBuf::from("site"),
                            repository: "acme/scope".into(),
                            branch: "gh-pages".into(),
                            deploy_key: "DEPLOY_KEY".into(),
                        },
                    )),
            ],
            DEFAULT_CLEARANCE_NODE,
        )
        .unwrap()
    }

    fn run(kind: &str, origin: &str, now: DateTime<Utc>) -> PipelineRun {
        PipelineRun::new(
            trigger(kind, origin),
            CanonicalRepository::new("acme/scope", "main"),
            ApprovalEnvironment::new("external-approval"),
            graph(),
            Duration::from_secs(20 * 60),
            now,
        )
        .unwrap()
    }

    fn ok() -> JobOutcome {
        JobOutcome::Succeeded { steps: Vec::new() }
    }

    fn drain(run: &mut PipelineRun, now: DateTime<Utc>) {
        while !run.ready_jobs().is_empty() {
            for name in run.ready_jobs() {
                run.start_job(&name, now).unwrap();
                run.complete_job(&name, ok(), now).unwrap();
            }
        }
    }

    #[test]
    fn test_trusted_push_runs_everything() {
        let now = Utc::now();
        let mut run = run("push", "acme/scope", now);
        assert_eq!(run.gate().state(), ClearanceState::NotRequired);
        assert_eq!(run.ready_jobs(), vec!["lint", "test"]);

        let lease = run.start_job("test", now).unwrap();
        assert_eq!(lease.revision.as_str(), SHA);
        assert_eq!(lease.timeout, Duration::from_secs(5 * 60));
        run.complete_job("test", ok(), now).unwrap();

        let docs = run.start_job("docs", now).unwrap();
        assert_eq!(docs.deploy, Some(DeployDecision::Publish));
        run.complete_job("docs", ok(), now).unwrap();
        drain(&mut run, now);

        assert_eq!(run.status(), RunStatus::Succeeded);
        assert_eq!(run.report().exit_code(), 0);
    }

    #[test]
    fn test_pull_request_parks_after_unprivileged_jobs() {
        let now = Utc::now();
        let mut run = run("pull_request", "fork/scope", now);
        assert_eq!(run.gate().state(), ClearanceState::AwaitingApproval);
        assert_eq!(run.ready_jobs(), vec!["lint"]);

        drain(&mut run, now);
        assert!(run.is_suspended());
        assert_eq!(run.status(), RunStatus::Running);
        assert_eq!(run.report().exit_code(), 3);
        assert!(matches!(
            run.events().last().map(|e| &e.kind),
            Some(RunEventKind::RunSuspended)
        ));
    }

    #[test]
    fn test_start_job_refuses_secret_job_before_clearance() {
        let now = Utc::now();
        let mut run = run("pull_request", "fork/scope", now);
        let err = run.start_job("test", now).unwrap_err();
        assert!(matches!(err, GatekeepError::ClearanceRequired { ref job } if job == "test"));
        assert_eq!(run.job("test").unwrap().status, JobStatus::Blocked);
    }

    #[test]
    fn test_approval_unblocks_and_skips_publish() {
        let now = Utc::now();
        let mut run = run("pull_request", "fork/scope", now);
        drain(&mut run, now);

        let state = run
            .record_clearance(ClearanceDecision::approve(run.run_id(), "maintainer", now), now)
            .unwrap();
        assert_eq!(state, ClearanceState::Approved);
        assert_eq!(
            run.job(DEFAULT_CLEARANCE_NODE).unwrap().status,
            JobStatus::Succeeded
        );
        assert_eq!(run.ready_jobs(), vec!["test"]);

        run.start_job("test", now).unwrap();
        run.complete_job("test", ok(), now).unwrap();
        let docs = run.start_job("docs", now).unwrap();
        assert!(!docs.deploy.unwrap().is_publish());
    }

    #[test]
    fn test_rejection_cancels_atomically() {
        let now = Utc::now();
        let mut run = run("pull_request", "fork/scope", now);
        drain(&mut run, now);

        run.record_clearance(ClearanceDecision::reject(run.run_id(), "maintainer", now), now)
            .unwrap();
        assert_eq!(run.status(), RunStatus::Cancelled);
        assert_eq!(run.report().exit_code(), 2);
        for name in ["test", "docs", DEFAULT_CLEARANCE_NODE] {
            let job = run.job(name).unwrap();
            assert_eq!(job.status, JobStatus::Skipped);
            assert_eq!(job.skip_reason, Some(SkipReason::ClearanceRejected));
        }
        assert!(run.job("test").unwrap().started_at.is_none());
        assert!(matches!(
            run.start_job("test", now),
            Err(GatekeepError::RunFinished(_))
        ));
    }

    #[test]
    fn test_second_decision_refused() {
        let now = Utc::now();
        let mut run = run("pull_request", "fork/scope", now);
        run.record_clearance(ClearanceDecision::approve(run.run_id(), "a", now), now)
            .unwrap();
        let err = run
            .record_clearance(ClearanceDecision::reject(run.run_id(), "b", now), now)
            .unwrap_err();
        assert!(matches!(err, GatekeepError::Clearance(_)));
        assert_eq!(run.gate().state(), ClearanceState::Approved);
    }

    #[test]
    fn test_failure_skips_dependents_and_fails_run() {
        let now = Utc::now();
        let mut run = run("push", "acme/scope", now);
        run.start_job("lint", now).unwrap();
        run.complete_job("lint", ok(), now).unwrap();
        run.start_job("test", now).unwrap();
        run.complete_job(
            "test",
            JobOutcome::Failed {
                cause: FailureCause::CommandFailed {
                    step: "test".into(),
                    exit_code: 101,
                },
                steps: Vec::new(),
            },
            now,
        )
        .unwrap();

        let docs = run.job("docs").unwrap();
        assert_eq!(docs.status, JobStatus::Skipped);
        assert_eq!(
            docs.skip_reason,
            Some(SkipReason::DependencyFailed {
                dependency: "test".into()
            })
        );
        assert_eq!(run.status(), RunStatus::Failed);
    }

    #[test]
    fn test_budget_excludes_waiting_time() {
        let t0 = Utc::now();
        let mut run = run("pull_request", "fork/scope", t0);
        run.start_job("lint", t0).unwrap();
        run.complete_job("lint", ok(), t0 + ChronoDuration::minutes(2))
            .unwrap();
        assert!(run.is_suspended());

        // A reviewer shows up three hours later.
        let t1 = t0 + ChronoDuration::hours(3);
        run.record_clearance(ClearanceDecision::approve(run.run_id(), "m", t1), t1)
            .unwrap();
        let lease = run.start_job("test", t1).unwrap();
        assert_eq!(lease.timeout, Duration::from_secs(5 * 60));
        assert_eq!(run.budget().remaining(t1), Duration::from_secs(18 * 60));
    }

    #[test]
    fn test_budget_exhaustion_skips_remaining_jobs() {
        let t0 = Utc::now();
        let mut run = run("push", "acme/scope", t0);
        run.start_job("test", t0).unwrap();
        let late = t0 + ChronoDuration::minutes(25);
        run.complete_job("test", ok(), late).unwrap();

        let docs = run.job("docs").unwrap();
        assert_eq!(docs.skip_reason, Some(SkipReason::BudgetExhausted));
        assert_eq!(run.job("lint").unwrap().status, JobStatus::Skipped);
        assert_eq!(run.status(), RunStatus::Failed);
    }

    #[test]
    fn test_remaining_budget_caps_timeout() {
        let t0 = Utc::now();
        let mut run = run("push", "acme/scope", t0);
        run.start_job("lint", t0).unwrap();
        let t1 = t0 + ChronoDuration::minutes(17);
        run.complete_job("lint", ok(), t1).unwrap();
        let lease = run.start_job("test", t1).unwrap();
        assert_eq!(lease.timeout, Duration::from_secs(3 * 60));
    }

    #[test]
    fn test_serde_roundtrip_keeps_integrity() {
        let now = Utc::now();
        let mut run = run("pull_request", "fork/scope", now);
        drain(&mut run, now);
        let json = serde_json::to_string(&run).unwrap();
        let back: PipelineRun = serde_json::from_str(&json).unwrap();
        back.verify_integrity().unwrap();
        assert!(back.is_suspended());
        assert_eq!(back.events().len(), run.events().len());
    }

    #[test]
    fn test_tampered_graph_detected() {
        let now = Utc::now();
        let run = run("pull_request", "fork/scope", now);
        let mut json: serde_json::Value = serde_json::to_value(&run).unwrap();
        json["graph"]["nodes"]["test"]["secrets"] = serde_json::json!([]);
        let back: PipelineRun = serde_json::from_value(json).unwrap();
        let err = back.verify_integrity().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_event_sequence_is_contiguous() {
        let now = Utc::now();
        let mut run = run("push", "acme/scope", now);
        drain(&mut run, now);
        for (idx, event) in run.events().iter().enumerate() {
            assert_eq!(event.seq, idx as u64 + 1);
        }
        assert_eq!(run.events()[0].kind.name(), "run_created");
    }
}
