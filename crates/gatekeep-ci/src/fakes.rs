//! In-memory fakes for the runtime traits (testing only)
//!
//! Provides `MemorySecretStore`, `FakeCheckout`, `ScriptedExecutor` and
//! `RecordingPublisher`. Each records how it was called so tests can assert
//! that nothing privileged happened before clearance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use gatekeep_core::Revision;

use crate::checkout::{SourceCheckout, WorkingCopy};
use crate::error::{ExecutionError, ExecutionResult};
use crate::publish::{PublishReceipt, PublishTarget, Publisher};
use crate::runner::{CommandExecutor, CommandOutput, CommandRequest};
use crate::secrets::{SecretStore, SecretValue};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// MemorySecretStore
// ---------------------------------------------------------------------------

/// Secret store backed by a `HashMap<name, value>`.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: HashMap<String, String>,
    requested: Mutex<Vec<String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }

    /// Names resolved so far, in order.
    pub fn requested(&self) -> Vec<String> {
        lock(&self.requested).clone()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn resolve(&self, name: &str) -> ExecutionResult<SecretValue> {
        lock(&self.requested).push(name.to_string());
        self.secrets
            .get(name)
            .filter(|v| !v.is_empty())
            .map(SecretValue::new)
            .ok_or_else(|| ExecutionError::SecretUnavailable(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// FakeCheckout
// ---------------------------------------------------------------------------

/// Checkout that materializes a scratch directory instead of cloning.
#[derive(Debug, Default)]
pub struct FakeCheckout {
    files: Mutex<Vec<(PathBuf, String)>>,
    head: Mutex<Option<String>>,
    failure: Mutex<Option<String>>,
    checkouts: Mutex<Vec<(String, String)>>,
}

impl FakeCheckout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `contents` to `path` in every working copy.
    pub fn with_file(self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        lock(&self.files).push((path.into(), contents.into()));
        self
    }

    /// Report this head instead of the requested revision.
    pub fn set_head(&self, sha: &str) {
        *lock(&self.head) = Some(sha.to_string());
    }

    pub fn fail_with(&self, reason: &str) {
        *lock(&self.failure) = Some(reason.to_string());
    }

    /// `(repository, revision)` pairs checked out so far.
    pub fn checkouts(&self) -> Vec<(String, String)> {
        lock(&self.checkouts).clone()
    }
}

#[async_trait]
impl SourceCheckout for FakeCheckout {
    async fn checkout(&self, repository: &str, revision: &Revision) -> ExecutionResult<WorkingCopy> {
        lock(&self.checkouts).push((repository.to_string(), revision.to_string()));
        if let Some(reason) = lock(&self.failure).clone() {
            return Err(ExecutionError::Checkout {
                repository: repository.to_string(),
                revision: revision.to_string(),
                reason,
            });
        }

        let dir = tempfile::tempdir()?;
        let files = lock(&self.files).clone();
        for (path, contents) in files {
            let full = dir.path().join(path);
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(full, contents).await?;
        }

        let head = match lock(&self.head).clone() {
            Some(sha) => Revision::parse(&sha)?,
            None => revision.clone(),
        };
        Ok(WorkingCopy::new(dir, head))
    }
}

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Script {
    exit_code: i32,
    stdout: String,
    stderr: String,
    delay: Duration,
    panic: bool,
}

/// Executor that answers from a per-step script. Unscripted steps succeed
/// immediately with empty output.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<CommandRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, step: &str, exit_code: i32, stdout: &str, stderr: &str) {
        let mut scripts = lock(&self.scripts);
        let script = scripts.entry(step.to_string()).or_default();
        script.exit_code = exit_code;
        script.stdout = stdout.to_string();
        script.stderr = stderr.to_string();
    }

    /// Make `step` take `delay` before it answers.
    pub fn delay(&self, step: &str, delay: Duration) {
        lock(&self.scripts).entry(step.to_string()).or_default().delay = delay;
    }

    /// Make `step` panic inside the executor.
    pub fn panic_on(&self, step: &str) {
        lock(&self.scripts).entry(step.to_string()).or_default().panic = true;
    }

    pub fn calls(&self) -> Vec<CommandRequest> {
        lock(&self.calls).clone()
    }

    /// Steps executed so far, as `job/step`.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .map(|c| format!("{}/{}", c.job, c.step))
            .collect()
    }

    /// Highest number of commands observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, request: &CommandRequest) -> ExecutionResult<CommandOutput> {
        lock(&self.calls).push(request.clone());
        let script = lock(&self.scripts)
            .get(&request.step)
            .cloned()
            .unwrap_or_default();
        if script.panic {
            panic!("scripted panic in step '{}'", request.step);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let timed_out = script.delay > request.timeout;
        tokio::time::sleep(script.delay.min(request.timeout)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if timed_out {
            return Ok(CommandOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("step '{}' timed out", request.step),
                duration_ms: request.timeout.as_millis() as u64,
                timed_out: true,
            });
        }
        Ok(CommandOutput {
            exit_code: script.exit_code,
            stdout: script.stdout,
            stderr: script.stderr,
            duration_ms: script.delay.as_millis() as u64,
            timed_out: false,
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingPublisher
// ---------------------------------------------------------------------------

/// Publisher that records what it was asked to publish.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(PathBuf, PublishTarget)>>,
    failure: Mutex<Option<String>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, reason: &str) {
        *lock(&self.failure) = Some(reason.to_string());
    }

    /// `(artifact_dir, target)` pairs published so far.
    pub fn published(&self) -> Vec<(PathBuf, PublishTarget)> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(
        &self,
        artifact_dir: &Path,
        target: &PublishTarget,
        deploy_key: &SecretValue,
    ) -> ExecutionResult<PublishReceipt> {
        if let Some(reason) = lock(&self.failure).clone() {
            return Err(ExecutionError::Publish {
                destination: target.destination(),
                reason,
            });
        }
        if deploy_key.is_empty() {
            return Err(ExecutionError::SecretUnavailable("deploy key".to_string()));
        }
        lock(&self.published).push((artifact_dir.to_path_buf(), target.clone()));
        Ok(PublishReceipt {
            destination: target.destination(),
            commit: target.source_revision.to_string(),
        })
    }
}
