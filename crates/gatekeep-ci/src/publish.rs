//! Publishing build output.
//!
//! A publish replaces the destination branch wholesale: the artifact
//! directory becomes the only commit of an orphan branch, force-pushed.
//! History on the destination is not preserved, and nothing is pushed
//! unless the commit was created completely.

use std::path::{Component, Path};

use async_trait::async_trait;
use gatekeep_core::{DeploySpec, Revision};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ExecutionError, ExecutionResult};
use crate::git::{remote_url, run_git};
use crate::secrets::SecretValue;

/// Where to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTarget {
    pub repository: String,
    pub branch: String,
    /// Revision the artifacts were built from.
    pub source_revision: Revision,
}

impl PublishTarget {
    pub fn from_deploy(spec: &DeploySpec, source_revision: Revision) -> Self {
        Self {
            repository: spec.repository.clone(),
            branch: spec.branch.clone(),
            source_revision,
        }
    }

    /// `repository@branch`, as recorded on the run.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.repository, self.branch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub destination: String,
    /// Commit id of the published content.
    pub commit: String,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        artifact_dir: &Path,
        target: &PublishTarget,
        deploy_key: &SecretValue,
    ) -> ExecutionResult<PublishReceipt>;
}

/// Reject artifact paths that could leave the checkout.
pub fn validate_artifact_path(source_dir: &Path) -> ExecutionResult<()> {
    let escapes = source_dir.is_absolute()
        || source_dir
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
    if escapes {
        return Err(ExecutionError::Publish {
            destination: source_dir.display().to_string(),
            reason: "artifact directory must be relative to the checkout".to_string(),
        });
    }
    Ok(())
}

/// Publishes with `git`, authenticating over SSH with the deploy key.
#[derive(Debug, Clone)]
pub struct GitPublisher {
    remote_base: String,
    author_name: String,
    author_email: String,
}

impl Default for GitPublisher {
    fn default() -> Self {
        Self {
            remote_base: "git@github.com:".to_string(),
            author_name: "gatekeep".to_string(),
            author_email: "gatekeep@localhost".to_string(),
        }
    }
}

impl GitPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_base(mut self, base: impl Into<String>) -> Self {
        self.remote_base = base.into();
        self
    }

    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }
}

#[async_trait]
impl Publisher for GitPublisher {
    async fn publish(
        &self,
        artifact_dir: &Path,
        target: &PublishTarget,
        deploy_key: &SecretValue,
    ) -> ExecutionResult<PublishReceipt> {
        let destination = target.destination();
        let fail = |reason: String| ExecutionError::Publish {
            destination: destination.clone(),
            reason,
        };

        let meta = tokio::fs::metadata(artifact_dir).await.map_err(|e| {
            fail(format!("artifact directory {}: {e}", artifact_dir.display()))
        })?;
        if !meta.is_dir() {
            return Err(fail(format!("{} is not a directory", artifact_dir.display())));
        }

        let scratch = tempfile::Builder::new().prefix("gatekeep-publish-").tempdir()?;
        let key_path = scratch.path().join("deploy_key");
        write_private(&key_path, deploy_key).await?;
        let ssh = format!(
            "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
            key_path.display()
        );

        let git_dir = scratch.path().join("repo.git");
        let git_dir_arg = git_dir.display().to_string();
        let work_tree_arg = artifact_dir.display().to_string();
        let branch_ref = format!("refs/heads/{}", target.branch);
        let message = format!("Publish {}", target.source_revision);
        let url = remote_url(&self.remote_base, &target.repository);
        let name_cfg = format!("user.name={}", self.author_name);
        let email_cfg = format!("user.email={}", self.author_email);
        let refspec = format!("HEAD:{branch_ref}");
        let cwd = artifact_dir;

        let base = [
            "--git-dir",
            git_dir_arg.as_str(),
            "--work-tree",
            work_tree_arg.as_str(),
        ];

        run_git(cwd, &["init", "-q", "--bare", git_dir_arg.as_str()], &[])
            .await
            .map_err(|e| fail(e.to_string()))?;
        run_git(
            cwd,
            &git_args(&base, &["symbolic-ref", "HEAD", branch_ref.as_str()]),
            &[],
        )
        .await
        .map_err(|e| fail(e.to_string()))?;
        run_git(cwd, &git_args(&base, &["add", "-A", "."]), &[])
            .await
            .map_err(|e| fail(e.to_string()))?;

        let identity = [
            "-c",
            name_cfg.as_str(),
            "-c",
            email_cfg.as_str(),
        ];
        let commit = git_args(
            &identity,
            &git_args(
                &base,
                &["commit", "-q", "--allow-empty", "-m", message.as_str()],
            ),
        );
        run_git(cwd, &commit, &[])
            .await
            .map_err(|e| fail(e.to_string()))?;

        let sha = run_git(cwd, &git_args(&base, &["rev-parse", "HEAD"]), &[])
            .await
            .map_err(|e| fail(e.to_string()))?;

        let push = git_args(
            &base,
            &["push", "-q", "--force", url.as_str(), refspec.as_str()],
        );
        run_git(cwd, &push, &[("GIT_SSH_COMMAND", ssh.as_str())])
            .await
            .map_err(|e| fail(e.to_string()))?;

        info!(destination = %destination, commit = %sha, "published");
        Ok(PublishReceipt {
            destination,
            commit: sha,
        })
    }
}

fn git_args<'a>(head: &[&'a str], tail: &[&'a str]) -> Vec<&'a str> {
    head.iter().chain(tail).copied().collect()
}

async fn write_private(path: &Path, value: &SecretValue) -> ExecutionResult<()> {
    let mut contents = value.expose().to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}
