//! Deploy predicate.
//!
//! Publishing is a side effect visible outside the run, so it is decided by
//! a pure guard over the trigger: only a push whose origin is the canonical
//! repository publishes. Everything else skips the step (never fails it).

use serde::{Deserialize, Serialize};

use crate::classify::CanonicalRepository;
use crate::trigger::{EventKind, Trigger};

/// Outcome of the deploy guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DeployDecision {
    Publish,
    Skip { reason: String },
}

impl DeployDecision {
    pub fn is_publish(&self) -> bool {
        matches!(self, DeployDecision::Publish)
    }

    pub fn skip_reason(&self) -> Option<&str> {
        match self {
            DeployDecision::Publish => None,
            DeployDecision::Skip { reason } => Some(reason),
        }
    }
}

/// Decide whether a deploy step publishes for this trigger.
pub fn evaluate(trigger: &Trigger, canonical: &CanonicalRepository) -> DeployDecision {
    if trigger.event_kind != EventKind::Push {
        return DeployDecision::Skip {
            reason: format!("{} events never publish", trigger.event_kind),
        };
    }
    if !canonical.is(&trigger.origin_repository) {
        return DeployDecision::Skip {
            reason: format!(
                "origin {} is not the canonical repository {}",
                trigger.origin_repository, canonical.name
            ),
        };
    }
    DeployDecision::Publish
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::TriggerEvent;
    use chrono::Utc;

    const SHA: &str = "3f2a9c1e5b7d4a6f8e0c2b4d6a8f0e1c3b5d7a9f";

    fn trigger(kind: &str, origin: &str) -> Trigger {
        Trigger::from_event(
            TriggerEvent {
                event_kind: kind.into(),
                head_revision: SHA.into(),
                repository: "acme/scope".into(),
                origin_repository: origin.into(),
                actor: "octo".into(),
                git_ref: None,
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn canonical() -> CanonicalRepository {
        CanonicalRepository::new("acme/scope", "main")
    }

    #[test]
    fn test_push_from_canonical_publishes() {
        assert_eq!(
            evaluate(&trigger("push", "acme/scope"), &canonical()),
            DeployDecision::Publish
        );
    }

    #[test]
    fn test_pull_request_skips_even_from_canonical() {
        let decision = evaluate(&trigger("pull_request", "acme/scope"), &canonical());
        assert!(!decision.is_publish());
        assert!(decision.skip_reason().unwrap().contains("pull_request"));

        let target = evaluate(&trigger("pull_request_target", "acme/scope"), &canonical());
        assert!(!target.is_publish());
    }

    #[test]
    fn test_push_from_other_origin_skips() {
        let decision = evaluate(&trigger("push", "mallory/scope"), &canonical());
        assert!(decision.skip_reason().unwrap().contains("mallory/scope"));
    }
}
