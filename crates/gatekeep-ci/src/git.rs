//! Thin async wrappers around the `git` binary.

use std::path::Path;

use tokio::process::Command;

use crate::error::{ExecutionError, ExecutionResult};

/// Run `git <args>` in `dir` and return trimmed stdout.
pub(crate) async fn run_git(
    dir: &Path,
    args: &[&str],
    envs: &[(&str, &str)],
) -> ExecutionResult<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .envs(envs.iter().copied())
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ExecutionError::Spawn {
            program: "git".to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(ExecutionError::Git {
            command: args.first().copied().unwrap_or_default().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Capture the HEAD commit id of the working copy at `dir`.
pub async fn capture_head_sha(dir: &Path) -> ExecutionResult<String> {
    let sha = run_git(dir, &["rev-parse", "HEAD"], &[]).await?;
    if sha.is_empty() {
        return Err(ExecutionError::Git {
            command: "rev-parse".to_string(),
            stderr: "git rev-parse HEAD returned empty output".to_string(),
        });
    }
    Ok(sha)
}

/// Resolve a repository identity (`owner/name`) to a fetchable URL.
///
/// Absolute paths and URLs are used as given.
pub fn remote_url(base: &str, repository: &str) -> String {
    if repository.contains("://") || repository.starts_with('/') || repository.starts_with("git@")
    {
        return repository.to_string();
    }
    if base.ends_with(':') || base.ends_with('/') {
        format!("{base}{repository}.git")
    } else {
        format!("{base}/{repository}.git")
    }
}
