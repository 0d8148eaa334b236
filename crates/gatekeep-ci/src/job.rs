//! Executes one started job.
//!
//! The runner never returns an error: every collaborator failure is turned
//! into a [`FailureCause`] on the job so the run can carry on scheduling.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use gatekeep_core::{
    emit_deploy_evaluated, DeployDecision, DeploySpec, FailureCause, JobLease, JobOutcome,
    Redactor, StepAction, StepRecord, StepStatus, METRICS,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::checkout::{SourceCheckout, WorkingCopy};
use crate::error::ExecutionError;
use crate::publish::{validate_artifact_path, PublishTarget, Publisher};
use crate::runner::{CommandExecutor, CommandRequest};
use crate::secrets::{SecretStore, SecretValue};

/// Lines of stderr kept in a failed step's detail.
const STDERR_TAIL_LINES: usize = 20;

/// Secrets resolved for one job, keyed by secret name.
struct BoundSecrets {
    env: Vec<(String, SecretValue)>,
    by_secret: BTreeMap<String, SecretValue>,
    redactor: Redactor,
}

/// Runs the steps of a leased job against its collaborators.
#[derive(Clone)]
pub struct JobRunner {
    secrets: Arc<dyn SecretStore>,
    checkout: Arc<dyn SourceCheckout>,
    executor: Arc<dyn CommandExecutor>,
    publisher: Arc<dyn Publisher>,
}

impl JobRunner {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        checkout: Arc<dyn SourceCheckout>,
        executor: Arc<dyn CommandExecutor>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            secrets,
            checkout,
            executor,
            publisher,
        }
    }

    /// Run every step of the job in order, stopping at the first failure.
    pub async fn run(&self, lease: JobLease) -> JobOutcome {
        let bound = match self.bind_secrets(&lease).await {
            Ok(bound) => bound,
            Err(cause) => return JobOutcome::Failed { cause, steps: Vec::new() },
        };

        let working_copy = match self.prepare(&lease, &bound.redactor).await {
            Ok(wc) => wc,
            Err(cause) => return JobOutcome::Failed { cause, steps: Vec::new() },
        };

        let Some(deadline) = Instant::now().checked_add(lease.timeout) else {
            return JobOutcome::Failed {
                cause: FailureCause::ExecutionError {
                    step: lease.job.name.clone(),
                    reason: format!("timeout of {}s is out of range", lease.timeout.as_secs()),
                },
                steps: Vec::new(),
            };
        };
        let mut steps = Vec::with_capacity(lease.job.steps.len());

        for step in &lease.job.steps {
            let result = match step.action() {
                StepAction::Run(argv) => {
                    self.run_command(&lease, &step.name, argv, &working_copy, &bound, deadline)
                        .await
                }
                StepAction::Deploy(spec) => {
                    self.deploy(&lease, &step.name, spec, &working_copy, &bound)
                        .await
                }
            };
            match result {
                Ok(record) => steps.push(record),
                Err((record, cause)) => {
                    steps.extend(record);
                    return JobOutcome::Failed { cause, steps };
                }
            }
        }

        JobOutcome::Succeeded { steps }
    }

    async fn bind_secrets(&self, lease: &JobLease) -> Result<BoundSecrets, FailureCause> {
        let mut bound = BoundSecrets {
            env: Vec::with_capacity(lease.job.secrets.len()),
            by_secret: BTreeMap::new(),
            redactor: Redactor::new(),
        };
        for binding in &lease.job.secrets {
            let value = match self.secrets.resolve(&binding.secret).await {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        job = %lease.job.name,
                        secret = %binding.secret,
                        error = %err,
                        "secret resolution failed"
                    );
                    return Err(FailureCause::SecretUnavailable {
                        secret: binding.secret.clone(),
                    });
                }
            };
            bound.redactor.add_secret(&binding.secret, value.expose());
            bound.by_secret.insert(binding.secret.clone(), value.clone());
            bound.env.push((binding.env.clone(), value));
        }
        Ok(bound)
    }

    async fn prepare(
        &self,
        lease: &JobLease,
        redactor: &Redactor,
    ) -> Result<WorkingCopy, FailureCause> {
        let wc = self
            .checkout
            .checkout(&lease.repository, &lease.revision)
            .await
            .map_err(|e| FailureCause::CheckoutFailed {
                reason: redactor.apply(&e.to_string()),
            })?;
        if wc.head() != &lease.revision {
            return Err(FailureCause::CheckoutFailed {
                reason: format!(
                    "working copy is at {}, expected {}",
                    wc.head(),
                    lease.revision
                ),
            });
        }
        Ok(wc)
    }

    async fn run_command(
        &self,
        lease: &JobLease,
        step: &str,
        argv: &[String],
        wc: &WorkingCopy,
        bound: &BoundSecrets,
        deadline: Instant,
    ) -> Result<StepRecord, (Option<StepRecord>, FailureCause)> {
        let timeout_cause = || FailureCause::Timeout {
            step: step.to_string(),
            limit_secs: lease.timeout.as_secs(),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err((None, timeout_cause()));
        }

        let request = CommandRequest {
            job: lease.job.name.clone(),
            step: step.to_string(),
            argv: argv.to_vec(),
            cwd: wc.path().to_path_buf(),
            env: lease.job.env.clone(),
            secret_env: bound.env.clone(),
            timeout: remaining,
        };

        let output = match self.executor.execute(&request).await {
            Ok(output) => output,
            Err(err) => {
                let reason = bound.redactor.apply(&err.to_string());
                let record = StepRecord {
                    name: step.to_string(),
                    status: StepStatus::Failed,
                    exit_code: None,
                    duration_ms: 0,
                    detail: Some(reason.clone()),
                    published_to: None,
                };
                return Err((
                    Some(record),
                    FailureCause::ExecutionError {
                        step: step.to_string(),
                        reason,
                    },
                ));
            }
        };

        let stdout = bound.redactor.apply(&output.stdout);
        let stderr = bound.redactor.apply(&output.stderr);
        debug!(job = %lease.job.name, step, stdout = %stdout, stderr = %stderr, "step output");

        let mut record = StepRecord {
            name: step.to_string(),
            status: StepStatus::Succeeded,
            exit_code: Some(output.exit_code),
            duration_ms: output.duration_ms,
            detail: None,
            published_to: None,
        };

        if output.timed_out {
            record.status = StepStatus::Failed;
            record.exit_code = None;
            record.detail = Some(stderr_tail(&stderr));
            return Err((Some(record), timeout_cause()));
        }
        if !output.passed() {
            record.status = StepStatus::Failed;
            record.detail = Some(stderr_tail(&stderr));
            return Err((
                Some(record),
                FailureCause::CommandFailed {
                    step: step.to_string(),
                    exit_code: output.exit_code,
                },
            ));
        }
        Ok(record)
    }

    async fn deploy(
        &self,
        lease: &JobLease,
        step: &str,
        spec: &DeploySpec,
        wc: &WorkingCopy,
        bound: &BoundSecrets,
    ) -> Result<StepRecord, (Option<StepRecord>, FailureCause)> {
        let run_id = lease.run_id.to_string();
        let decision = lease.deploy.clone().unwrap_or_else(|| DeployDecision::Skip {
            reason: "no deploy decision for this job".to_string(),
        });
        emit_deploy_evaluated(
            &run_id,
            &lease.job.name,
            decision.is_publish(),
            decision.skip_reason(),
        );

        let started = StdInstant::now();
        let mut record = StepRecord {
            name: step.to_string(),
            status: StepStatus::Skipped,
            exit_code: None,
            duration_ms: 0,
            detail: None,
            published_to: None,
        };

        if let DeployDecision::Skip { reason } = decision {
            record.detail = Some(reason);
            return Ok(record);
        }

        let target = PublishTarget::from_deploy(spec, lease.revision.clone());
        let failed = |mut record: StepRecord, reason: String| {
            record.status = StepStatus::Failed;
            record.detail = Some(reason.clone());
            record.duration_ms = started.elapsed().as_millis() as u64;
            (Some(record), FailureCause::PublishFailed { reason })
        };

        if let Err(err) = validate_artifact_path(&spec.source_dir) {
            return Err(failed(record, err.to_string()));
        }
        let Some(key) = bound.by_secret.get(&spec.deploy_key) else {
            let err = ExecutionError::SecretUnavailable(spec.deploy_key.clone());
            return Err(failed(record, err.to_string()));
        };

        let artifact_dir = wc.path().join(&spec.source_dir);
        match self.publisher.publish(&artifact_dir, &target, key).await {
            Ok(receipt) => {
                METRICS.inc_publishes();
                record.status = StepStatus::Succeeded;
                record.duration_ms = started.elapsed().as_millis() as u64;
                record.detail = Some(format!("commit {}", receipt.commit));
                record.published_to = Some(receipt.destination);
                Ok(record)
            }
            Err(err) => Err(failed(record, bound.redactor.apply(&err.to_string()))),
        }
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeCheckout, MemorySecretStore, RecordingPublisher, ScriptedExecutor};
    use gatekeep_core::{JobSpec, Revision, SecretBinding, StepSpec};
    use std::path::PathBuf;
    use std::time::Duration;
    use uuid::Uuid;

    const SHA: &str = "3f2a9c1e5b7d4a6f8e0c2b4d6a8f0e1c3b5d7a9f";

    struct Harness {
        secrets: Arc<MemorySecretStore>,
        checkout: Arc<FakeCheckout>,
        executor: Arc<ScriptedExecutor>,
        publisher: Arc<RecordingPublisher>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                secrets: Arc::new(MemorySecretStore::new().with_secret("DEPLOY_KEY", "key-material")),
                checkout: Arc::new(FakeCheckout::new()),
                executor: Arc::new(ScriptedExecutor::new()),
                publisher: Arc::new(RecordingPublisher::new()),
            }
        }

        fn runner(&self) -> JobRunner {
            JobRunner::new(
                self.secrets.clone(),
                self.checkout.clone(),
                self.executor.clone(),
                self.publisher.clone(),
            )
        }
    }

    fn docs_job() -> JobSpec {
        JobSpec::new("docs")
            .secret(SecretBinding::same_name("DEPLOY_KEY"))
            .step(StepSpec::run("build", &["make", "html"]))
            .step(StepSpec::deploy(
                "deploy",
                DeploySpec {
                    source_dir: PathBuf::from("_build/html"),
                    repository: "acme/scope".into(),
                    branch: "gh-pages".into(),
                    deploy_key: "DEPLOY_KEY".into(),
                },
            ))
    }

    fn lease(job: JobSpec, deploy: Option<DeployDecision>) -> JobLease {
        JobLease {
            run_id: Uuid::new_v4(),
            job,
            revision: Revision::parse(SHA).unwrap(),
            repository: "acme/scope".into(),
            timeout: Duration::from_secs(600),
            deploy,
        }
    }

    #[tokio::test]
    async fn test_publish_records_destination() {
        let h = Harness::new();
        let outcome = h
            .runner()
            .run(lease(docs_job(), Some(DeployDecision::Publish)))
            .await;
        let JobOutcome::Succeeded { steps } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].published_to.as_deref(), Some("acme/scope@gh-pages"));
        assert_eq!(h.publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn test_skip_decision_never_calls_publisher() {
        let h = Harness::new();
        let outcome = h
            .runner()
            .run(lease(
                docs_job(),
                Some(DeployDecision::Skip {
                    reason: "pull_request events never publish".into(),
                }),
            ))
            .await;
        let JobOutcome::Succeeded { steps } = outcome else {
            panic!("expected success");
        };
        assert_eq!(steps[1].status, StepStatus::Skipped);
        assert!(steps[1].detail.as_deref().unwrap().contains("never publish"));
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_missing_secret_fails_before_checkout() {
        let h = Harness {
            secrets: Arc::new(MemorySecretStore::new()),
            ..Harness::new()
        };
        let outcome = h.runner().run(lease(docs_job(), None)).await;
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                cause: FailureCause::SecretUnavailable {
                    secret: "DEPLOY_KEY".into()
                },
                steps: Vec::new(),
            }
        );
        assert!(h.checkout.checkouts().is_empty());
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failing_step_stops_job() {
        let h = Harness::new();
        h.executor.script("build", 2, "", "error: missing toctree\n");
        let outcome = h
            .runner()
            .run(lease(docs_job(), Some(DeployDecision::Publish)))
            .await;
        let JobOutcome::Failed { cause, steps } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(
            cause,
            FailureCause::CommandFailed {
                step: "build".into(),
                exit_code: 2
            }
        );
        assert_eq!(steps.len(), 1);
        assert!(steps[0].detail.as_deref().unwrap().contains("toctree"));
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_step_output_is_redacted() {
        let h = Harness::new();
        h.executor.script("build", 1, "", "auth failed for key-material\n");
        let outcome = h.runner().run(lease(docs_job(), None)).await;
        let JobOutcome::Failed { steps, .. } = outcome else {
            panic!("expected failure");
        };
        let detail = steps[0].detail.clone().unwrap();
        assert!(!detail.contains("key-material"));
        assert!(detail.contains("***"));
    }

    #[tokio::test]
    async fn test_checkout_mismatch_fails_job() {
        let h = Harness::new();
        h.checkout
            .set_head("0000000000000000000000000000000000000000");
        let outcome = h.runner().run(lease(docs_job(), None)).await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                cause: FailureCause::CheckoutFailed { .. },
                ..
            }
        ));
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_artifact_path_escape_fails_publish() {
        let h = Harness::new();
        let mut job = docs_job();
        job.steps[1].deploy.as_mut().unwrap().source_dir = PathBuf::from("../outside");
        let outcome = h.runner().run(lease(job, Some(DeployDecision::Publish))).await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                cause: FailureCause::PublishFailed { .. },
                ..
            }
        ));
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        let h = Harness::new();
        h.executor.delay("build", Duration::from_secs(3600));
        let mut lease = lease(docs_job(), None);
        lease.timeout = Duration::from_secs(60);
        let outcome = h.runner().run(lease).await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                cause: FailureCause::Timeout { limit_secs: 60, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_fails_without_running() {
        let h = Harness::new();
        let mut lease = lease(docs_job(), None);
        lease.timeout = Duration::MAX;
        let outcome = h.runner().run(lease).await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                cause: FailureCause::ExecutionError { .. },
                ..
            }
        ));
        assert!(h.executor.calls().is_empty());
    }
}
