//! Domain-level error taxonomy for Gatekeep.

use crate::clearance::ClearanceError;

/// Gatekeep domain errors.
///
/// Job-level failures (non-zero exits, timeouts, missing secrets) are not
/// errors at this layer; they are recorded on the job as a
/// [`FailureCause`](crate::run::FailureCause).
#[derive(Debug, thiserror::Error)]
pub enum GatekeepError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("clearance rejected by {approver}")]
    ClearanceRejected { approver: String },

    #[error("clearance required before job '{job}' may start")]
    ClearanceRequired { job: String },

    #[error("clearance error: {0}")]
    Clearance(#[from] ClearanceError),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job '{job}' cannot move from {from} to {to}")]
    InvalidTransition {
        job: String,
        from: String,
        to: String,
    },

    #[error("run {0} is already finished")]
    RunFinished(uuid::Uuid),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid pipeline definition: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeepError {
    /// Shorthand for a [`GatekeepError::Configuration`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether this error is fatal for the run and must not be retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Toml(_))
    }
}

/// Result type for Gatekeep domain operations.
pub type GatekeepResult<T> = std::result::Result<T, GatekeepError>;
