//! The orchestrator: one entry point per external event.
//!
//! `submit` turns a trigger into a run and drives it as far as it can go;
//! `decide` records a reviewer decision on a stored run and resumes it.
//! The run is saved before and after every drive so a crash never loses
//! a clearance request.

use std::sync::Arc;

use chrono::Utc;
use gatekeep_core::{
    AuditVerdict, ClearanceDecision, ClearanceOutcome, JobGraph, PipelineConfig, PipelineRun,
    RunAudit, RunReport, RunSpan, Trigger, TriggerEvent,
};
use tracing::info;
use uuid::Uuid;

use crate::error::ExecutionResult;
use crate::pipeline::{DriveOutcome, PipelineExecutor};
use crate::store::RunStore;

pub struct Orchestrator {
    config: PipelineConfig,
    graph: JobGraph,
    executor: PipelineExecutor,
    store: Arc<dyn RunStore>,
}

impl Orchestrator {
    /// Validates the pipeline once; every run gets a copy of the same graph.
    pub fn new(
        config: PipelineConfig,
        executor: PipelineExecutor,
        store: Arc<dyn RunStore>,
    ) -> ExecutionResult<Self> {
        config.validate()?;
        let graph = config.build_graph()?;
        Ok(Self {
            config,
            graph,
            executor,
            store,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Create a run for `event` and drive it until it finishes or parks on
    /// the clearance gate.
    pub async fn submit(&self, event: TriggerEvent) -> ExecutionResult<RunReport> {
        let now = Utc::now();
        let trigger = Trigger::from_event(event, now)?;
        let mut run = PipelineRun::new(
            trigger,
            self.config.canonical(),
            self.config.environment(),
            self.graph.clone(),
            self.config.budget(),
            now,
        )?;
        self.store.save(&run).await?;
        self.drive(&mut run).await
    }

    /// Record a clearance decision and resume the run.
    ///
    /// Decisions on one run are serialized through the store's run lock,
    /// held until the resumed drive has been saved. A second decision sees
    /// the first and fails with `AlreadyDecided`.
    pub async fn decide(
        &self,
        run_id: Uuid,
        approver: &str,
        outcome: ClearanceOutcome,
        comment: Option<String>,
    ) -> ExecutionResult<RunReport> {
        let _lock = self.store.lock(run_id).await?;
        let mut run = self.store.load(run_id).await?;
        let seen = run.events().len();
        {
            let _span = RunSpan::enter(&run_id.to_string());
            let now = Utc::now();
            let decision = ClearanceDecision::new(run_id, approver, outcome, comment, now);
            run.record_clearance(decision, now)?;
        }
        self.store.save_if_unchanged(&run, seen).await?;

        if run.is_terminal() {
            return Ok(run.report());
        }
        self.drive(&mut run).await
    }

    pub async fn status(&self, run_id: Uuid) -> ExecutionResult<RunReport> {
        Ok(self.store.load(run_id).await?.report())
    }

    pub async fn load(&self, run_id: Uuid) -> ExecutionResult<PipelineRun> {
        self.store.load(run_id).await
    }

    /// Replay a stored run's event log against its rules.
    pub async fn audit(&self, run_id: Uuid) -> ExecutionResult<AuditVerdict> {
        let run = self.store.load(run_id).await?;
        Ok(RunAudit::evaluate(&run))
    }

    pub async fn list(&self) -> ExecutionResult<Vec<Uuid>> {
        self.store.list().await
    }

    async fn drive(&self, run: &mut PipelineRun) -> ExecutionResult<RunReport> {
        let result = self.executor.drive(run).await;
        self.store.save(run).await?;
        match result? {
            DriveOutcome::Suspended => {
                info!(run_id = %run.run_id(), "run parked until clearance is decided")
            }
            DriveOutcome::Finished(status) => {
                info!(run_id = %run.run_id(), status = %status, "run finished")
            }
        }
        Ok(run.report())
    }
}
