//! Drives a run: starts every ready job, feeds outcomes back, repeats.
//!
//! Jobs whose dependencies are satisfied run concurrently. The driver stops
//! when nothing is running and nothing is ready, which is either a finished
//! run or one parked on the clearance gate.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use gatekeep_core::{FailureCause, JobOutcome, PipelineRun, RunStatus};
use tokio::task::JoinSet;
use tracing::{info_span, warn, Instrument};

use crate::error::{ExecutionError, ExecutionResult};
use crate::job::JobRunner;

/// Where the driver left the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Waiting for a clearance decision.
    Suspended,
    Finished(RunStatus),
}

/// Executes the jobs of a run with a shared [`JobRunner`].
#[derive(Clone)]
pub struct PipelineExecutor {
    runner: Arc<JobRunner>,
}

impl PipelineExecutor {
    pub fn new(runner: JobRunner) -> Self {
        Self {
            runner: Arc::new(runner),
        }
    }

    /// Run until the run finishes or suspends.
    pub async fn drive(&self, run: &mut PipelineRun) -> ExecutionResult<DriveOutcome> {
        let span = info_span!("gatekeep.drive", run_id = %run.run_id());
        self.drive_inner(run).instrument(span).await
    }

    async fn drive_inner(&self, run: &mut PipelineRun) -> ExecutionResult<DriveOutcome> {
        let run_id = run.run_id();
        let mut tasks = JoinSet::new();

        if let Err(err) = self.pump(run, &mut tasks).await {
            tasks.shutdown().await;
            fail_running(run, &err.to_string());
            return Err(err);
        }

        if run.is_terminal() {
            Ok(DriveOutcome::Finished(run.status()))
        } else if run.is_suspended() {
            Ok(DriveOutcome::Suspended)
        } else {
            Err(ExecutionError::Task(format!(
                "run {run_id} has nothing to run but is neither finished nor suspended"
            )))
        }
    }

    async fn pump(
        &self,
        run: &mut PipelineRun,
        tasks: &mut JoinSet<(String, std::thread::Result<JobOutcome>)>,
    ) -> ExecutionResult<()> {
        let run_id = run.run_id();
        loop {
            for name in run.ready_jobs() {
                let lease = run.start_job(&name, Utc::now())?;
                let runner = Arc::clone(&self.runner);
                let span = info_span!("gatekeep.job", run_id = %run_id, job = %name);
                tasks.spawn(
                    async move {
                        let outcome = AssertUnwindSafe(runner.run(lease)).catch_unwind().await;
                        (name, outcome)
                    }
                    .instrument(span),
                );
            }

            let Some(joined) = tasks.join_next().await else {
                return Ok(());
            };
            let (name, outcome) = joined.map_err(|e| ExecutionError::Task(e.to_string()))?;
            let outcome = outcome.unwrap_or_else(|panic| {
                let reason = panic_message(panic.as_ref());
                warn!(run_id = %run_id, job = %name, reason = %reason, "job task panicked");
                JobOutcome::Failed {
                    cause: FailureCause::ExecutionError {
                        step: name.clone(),
                        reason,
                    },
                    steps: Vec::new(),
                }
            });
            run.complete_job(&name, outcome, Utc::now())?;
        }
    }
}

/// Fail every job still `running` after the driver gave up on it, so the
/// saved run is not left with work nobody will finish.
fn fail_running(run: &mut PipelineRun, reason: &str) {
    let now = Utc::now();
    for name in run.running_jobs() {
        warn!(run_id = %run.run_id(), job = %name, reason = %reason, "abandoning running job");
        let outcome = JobOutcome::Failed {
            cause: FailureCause::ExecutionError {
                step: name.clone(),
                reason: format!("driver stopped: {reason}"),
            },
            steps: Vec::new(),
        };
        if let Err(err) = run.complete_job(&name, outcome, now) {
            warn!(run_id = %run.run_id(), job = %name, error = %err, "could not fail abandoned job");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}
