//! Gatekeep CI runtime
//!
//! Executes runs modeled by `gatekeep-core`: binds secrets, checks out the
//! pinned revision, runs steps, publishes, and persists runs across a
//! clearance wait.
//!
//! ## Key Components
//!
//! - `JobRunner`: executes one leased job against its collaborators
//! - `PipelineExecutor`: schedules ready jobs concurrently until the run
//!   finishes or suspends
//! - `Orchestrator`: `submit` a trigger, `decide` a clearance
//! - `RunStore`: run persistence (`FsRunStore`, `MemoryRunStore`)

pub mod checkout;
pub mod error;
pub mod fakes;
mod git;
pub mod job;
pub mod pipeline;
pub mod publish;
pub mod runner;
pub mod secrets;
pub mod service;
pub mod store;

pub use checkout::{GitCheckout, SourceCheckout, WorkingCopy};
pub use error::{ExecutionError, ExecutionResult};
pub use git::{capture_head_sha, remote_url};
pub use job::JobRunner;
pub use pipeline::{DriveOutcome, PipelineExecutor};
pub use publish::{GitPublisher, PublishReceipt, PublishTarget, Publisher};
pub use runner::{CommandExecutor, CommandOutput, CommandRequest, ProcessExecutor};
pub use secrets::{EnvSecretStore, SecretStore, SecretValue};
pub use service::Orchestrator;
pub use store::{FsRunStore, MemoryRunStore, RunLock, RunStore};
