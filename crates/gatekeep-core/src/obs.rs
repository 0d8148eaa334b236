//! Structured observability hooks for the pipeline run lifecycle.
//!
//! This module provides:
//! - Run-scoped tracing spans via `RunSpan` RAII guard
//! - Emission functions for lifecycle events: run created, clearance
//!   requested/decided, job started/finished, deploy evaluated, run
//!   suspended/finished
//!
//! Events are emitted at `info!` level with an `event = "..."` field.
//! Secret values are never passed to any emitter.

use tracing::info;

/// RAII guard that enters a run-scoped tracing span for the duration of a run.
///
/// ```ignore
/// let _span = RunSpan::enter("1b4e28ba-2fa1-11d2-883f-0016d3cca427");
/// // tracing calls below carry run_id
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("gatekeep.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: run created for a classified trigger.
pub fn emit_run_created(run_id: &str, label: &str, event_kind: &str, revision: &str) {
    info!(
        event = "run.created",
        run_id = %run_id,
        label = %label,
        event_kind = %event_kind,
        revision = %revision,
    );
}

/// Emit event: the run entered `awaiting-approval`.
pub fn emit_clearance_requested(run_id: &str, environment: &str) {
    info!(event = "clearance.requested", run_id = %run_id, environment = %environment);
}

pub fn emit_clearance_decided(run_id: &str, approver: &str, approved: bool) {
    info!(
        event = "clearance.decided",
        run_id = %run_id,
        approver = %approver,
        approved = approved,
    );
}

/// Emit event: a decision was refused (unauthorized, duplicate, ...).
pub fn emit_clearance_refused(run_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "clearance.refused", run_id = %run_id, error = %error);
}

pub fn emit_job_started(run_id: &str, job: &str, secret_bound: bool) {
    info!(
        event = "job.started",
        run_id = %run_id,
        job = %job,
        secret_bound = secret_bound,
    );
}

/// Emit event: job reached a terminal status.
pub fn emit_job_finished(run_id: &str, job: &str, status: &str, duration_ms: u64) {
    info!(
        event = "job.finished",
        run_id = %run_id,
        job = %job,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_deploy_evaluated(run_id: &str, job: &str, publish: bool, reason: Option<&str>) {
    info!(
        event = "deploy.evaluated",
        run_id = %run_id,
        job = %job,
        publish = publish,
        reason = reason.unwrap_or(""),
    );
}

pub fn emit_run_suspended(run_id: &str, environment: &str) {
    info!(event = "run.suspended", run_id = %run_id, environment = %environment);
}

/// Emit event: run reached a terminal status.
pub fn emit_run_finished(run_id: &str, status: &str, active_ms: u64, total_events: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        active_ms = active_ms,
        total_events = total_events,
    );
}
