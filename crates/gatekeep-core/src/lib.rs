//! Gatekeep Core Library
//!
//! Pure domain model of a clearance-gated CI orchestrator. Nothing in this
//! crate performs I/O beyond reading a pipeline file; the async runtime
//! lives in `gatekeep-ci`.

pub mod audit;
pub mod classify;
pub mod clearance;
pub mod config;
pub mod deploy;
pub mod error;
pub mod event;
pub mod graph;
pub mod metrics;
pub mod obs;
pub mod redact;
pub mod run;
pub mod scheduler;
pub mod telemetry;
pub mod trigger;

pub use audit::{AuditVerdict, RunAudit};
pub use classify::{classify, CanonicalRepository, Classification, SecretAccess, TrustLabel};
pub use clearance::{
    ApprovalEnvironment, ClearanceDecision, ClearanceError, ClearanceGate, ClearanceOutcome,
    ClearanceState,
};
pub use config::PipelineConfig;
pub use deploy::DeployDecision;
pub use error::{GatekeepError, GatekeepResult};
pub use event::{RunEvent, RunEventKind};
pub use graph::{
    DeploySpec, GraphNode, JobGraph, JobSpec, SecretBinding, StepAction, StepSpec,
    DEFAULT_CLEARANCE_NODE,
};
pub use metrics::METRICS;
pub use obs::{
    emit_clearance_decided, emit_clearance_refused, emit_clearance_requested,
    emit_deploy_evaluated, emit_job_finished, emit_job_started, emit_run_created,
    emit_run_finished, emit_run_suspended, RunSpan,
};
pub use redact::{RedactionRule, Redactor};
pub use run::{
    ExecutionBudget, FailureCause, JobInstance, JobLease, JobOutcome, JobStatus, JobSummary,
    PipelineRun, RunReport, RunStatus, SkipReason, StepRecord, StepStatus,
};
pub use telemetry::init_tracing;
pub use trigger::{EventKind, Revision, Trigger, TriggerEvent};
