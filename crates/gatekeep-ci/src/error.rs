//! Error types for the execution runtime.

use gatekeep_core::GatekeepError;
use uuid::Uuid;

/// Errors raised by collaborators (secret store, checkout, executor,
/// publisher, run store) and by the driver.
///
/// Collaborator errors inside a job never escape the job runner; they are
/// converted into a [`FailureCause`](gatekeep_core::FailureCause) on the job.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("secret '{0}' is not available")]
    SecretUnavailable(String),

    #[error("checkout of {revision} from {repository} failed: {reason}")]
    Checkout {
        repository: String,
        revision: String,
        reason: String,
    },

    #[error("command '{program}' could not be started: {reason}")]
    Spawn { program: String, reason: String },

    #[error("publish to {destination} failed: {reason}")]
    Publish { destination: String, reason: String },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {run_id} changed during update: expected {expected} events, found {found}")]
    Conflict {
        run_id: Uuid,
        expected: usize,
        found: usize,
    },

    #[error("job task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Domain(#[from] GatekeepError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutionError {
    /// Whether the underlying problem is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Domain(e) if e.is_configuration())
    }
}

/// Result type for runtime operations.
pub type ExecutionResult<T> = std::result::Result<T, ExecutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_is_transparent() {
        let err: ExecutionError = GatekeepError::config("pipeline declares no jobs").into();
        assert_eq!(
            err.to_string(),
            "configuration error: pipeline declares no jobs"
        );
        assert!(err.is_configuration());
    }

    #[test]
    fn test_secret_unavailable_names_secret_only() {
        let err = ExecutionError::SecretUnavailable("GLORIA_INSTANCE_TOKEN".into());
        assert!(err.to_string().contains("GLORIA_INSTANCE_TOKEN"));
        assert!(!err.is_configuration());
    }
}
