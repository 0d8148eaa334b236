//! Command execution.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{ExecutionError, ExecutionResult};
use crate::secrets::SecretValue;

/// Host variables passed through to commands. Everything else, in
/// particular the variables secrets are read from, is cleared.
const INHERITED_ENV: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR", "USER", "TERM"];

/// One command to execute.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub job: String,
    pub step: String,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    /// Plain environment variables.
    pub env: BTreeMap<String, String>,
    /// Secret environment variables, only for jobs that passed clearance.
    pub secret_env: Vec<(String, SecretValue)>,
    pub timeout: Duration,
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code; -1 when killed or terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Executes commands. Implementations must honour `request.timeout`.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, request: &CommandRequest) -> ExecutionResult<CommandOutput>;
}

/// Runs commands as child processes; the child is killed on timeout.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, request: &CommandRequest) -> ExecutionResult<CommandOutput> {
        let start = Instant::now();
        let Some((exe, args)) = request.argv.split_first() else {
            return Err(ExecutionError::Spawn {
                program: String::new(),
                reason: format!("step '{}' has an empty command", request.step),
            });
        };

        let mut command = Command::new(exe);
        command
            .args(args)
            .current_dir(&request.cwd)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for name in INHERITED_ENV {
            if let Ok(value) = std::env::var(name) {
                command.env(name, value);
            }
        }
        command.envs(&request.env);
        for (name, value) in &request.secret_env {
            command.env(name, value.expose());
        }

        let child = command.spawn().map_err(|e| ExecutionError::Spawn {
            program: exe.clone(),
            reason: e.to_string(),
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(CommandOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    timed_out: false,
                })
            }
            Err(_) => Ok(CommandOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!(
                    "step '{}' timed out after {}s",
                    request.step,
                    request.timeout.as_secs()
                ),
                duration_ms: start.elapsed().as_millis() as u64,
                timed_out: true,
            }),
        }
    }
}
