//! Event classification into trust labels.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::trigger::{EventKind, Trigger};

/// Trust label assigned to a trigger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TrustLabel {
    TrustedPush,
    PullRequest,
    PullRequestUntrustedSource,
}

impl fmt::Display for TrustLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustLabel::TrustedPush => write!(f, "trusted-push"),
            TrustLabel::PullRequest => write!(f, "pull-request"),
            TrustLabel::PullRequestUntrustedSource => write!(f, "pull-request-untrusted-source"),
        }
    }
}

/// When secrets may be bound for a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecretAccess {
    /// Secret-bound jobs may start as soon as their dependencies succeed.
    Immediate,
    /// Secret-bound jobs wait for an approved clearance decision.
    AfterClearance,
}

/// The repository identity pushes are trusted from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanonicalRepository {
    pub name: String,
    pub protected_branch: String,
}

impl CanonicalRepository {
    pub fn new(name: impl Into<String>, protected_branch: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protected_branch: protected_branch.into(),
        }
    }

    /// Whether `repository` is this canonical repository.
    pub fn is(&self, repository: &str) -> bool {
        self.name.eq_ignore_ascii_case(repository)
    }
}

/// Output of the classifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Classification {
    pub label: TrustLabel,
    pub secret_access: SecretAccess,
}

impl Classification {
    pub fn requires_clearance(&self) -> bool {
        self.secret_access == SecretAccess::AfterClearance
    }
}

/// Classify a trigger.
///
/// Only a push to the protected branch whose origin and target are both the
/// canonical repository is trusted. Every pull request, fork or not and
/// including `pull_request_target`, requires clearance. Any other push is
/// treated as untrusted.
pub fn classify(trigger: &Trigger, canonical: &CanonicalRepository) -> Classification {
    match trigger.event_kind {
        EventKind::Push => {
            let from_canonical =
                canonical.is(&trigger.origin_repository) && canonical.is(&trigger.repository);
            // A missing ref means the platform already filtered on the protected branch.
            let on_protected = trigger
                .branch()
                .map_or(true, |b| b == canonical.protected_branch);

            if from_canonical && on_protected {
                Classification {
                    label: TrustLabel::TrustedPush,
                    secret_access: SecretAccess::Immediate,
                }
            } else {
                untrusted_source()
            }
        }
        EventKind::PullRequest | EventKind::PullRequestTarget => {
            if trigger.is_fork || !canonical.is(&trigger.origin_repository) {
                untrusted_source()
            } else {
                Classification {
                    label: TrustLabel::PullRequest,
                    secret_access: SecretAccess::AfterClearance,
                }
            }
        }
    }
}

fn untrusted_source() -> Classification {
    Classification {
        label: TrustLabel::PullRequestUntrustedSource,
        secret_access: SecretAccess::AfterClearance,
    }
}
