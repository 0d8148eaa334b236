//! Trigger events and pinned revisions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GatekeepError, GatekeepResult};

/// Kind of event that requested a pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    PullRequestTarget,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
            EventKind::PullRequestTarget => "pull_request_target",
        }
    }

    /// Whether the event originates from a pull request.
    pub fn is_pull_request(&self) -> bool {
        matches!(self, EventKind::PullRequest | EventKind::PullRequestTarget)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = GatekeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(EventKind::Push),
            "pull_request" => Ok(EventKind::PullRequest),
            "pull_request_target" => Ok(EventKind::PullRequestTarget),
            other => Err(GatekeepError::config(format!(
                "unrecognized event kind: {other}"
            ))),
        }
    }
}

/// An immutable commit identifier.
///
/// Only full hexadecimal object ids are accepted (40 chars for SHA-1, 64 for
/// SHA-256). Branch names, tags and abbreviated ids are rejected so that a
/// run can never be pointed at a reference that moves after clearance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision(String);

impl Revision {
    pub fn parse(input: &str) -> GatekeepResult<Self> {
        let trimmed = input.trim();
        let valid_len = trimmed.len() == 40 || trimmed.len() == 64;
        if !valid_len || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(GatekeepError::config(format!(
                "'{trimmed}' is not a full commit id; runs must be pinned to an exact revision"
            )));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars) for display.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl TryFrom<String> for Revision {
    type Error = GatekeepError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Revision::parse(&value)
    }
}

impl From<Revision> for String {
    fn from(value: Revision) -> Self {
        value.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw event payload as delivered by the hosting platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerEvent {
    pub event_kind: String,
    pub head_revision: String,
    /// Repository the pipeline belongs to (the PR target, or the pushed repo).
    pub repository: String,
    /// Repository the change comes from (the PR head repository).
    pub origin_repository: String,
    pub actor: String,
    /// Branch reference for push events, e.g. `refs/heads/main`.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

/// A validated trigger. Immutable once created; consumed by one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger_id: Uuid,
    pub event_kind: EventKind,
    pub source_revision: Revision,
    pub repository: String,
    pub origin_repository: String,
    pub is_fork: bool,
    pub actor: String,
    pub git_ref: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Trigger {
    /// Validate a raw event into a trigger.
    ///
    /// # Errors
    ///
    /// Returns [`GatekeepError::Configuration`] for an unrecognized event
    /// kind, a revision that is not a full commit id, or empty repository
    /// identities.
    pub fn from_event(event: TriggerEvent, now: DateTime<Utc>) -> GatekeepResult<Self> {
        let event_kind = event.event_kind.parse::<EventKind>()?;
        let source_revision = Revision::parse(&event.head_revision)?;

        let repository = event.repository.trim().to_string();
        let origin_repository = event.origin_repository.trim().to_string();
        if repository.is_empty() || origin_repository.is_empty() {
            return Err(GatekeepError::config(
                "trigger must name both repository and origin_repository",
            ));
        }

        let is_fork = !repository.eq_ignore_ascii_case(&origin_repository);

        Ok(Self {
            trigger_id: Uuid::new_v4(),
            event_kind,
            source_revision,
            repository,
            origin_repository,
            is_fork,
            actor: event.actor,
            git_ref: event.git_ref,
            received_at: now,
        })
    }

    /// Branch name for push events (`refs/heads/` prefix stripped).
    pub fn branch(&self) -> Option<&str> {
        self.git_ref
            .as_deref()
            .map(|r| r.strip_prefix("refs/heads/").unwrap_or(r))
    }
}
