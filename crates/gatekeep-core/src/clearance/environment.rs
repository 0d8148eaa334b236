//! Named approval environments.

use serde::{Deserialize, Serialize};

/// The environment a clearance gate is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalEnvironment {
    pub name: String,
    /// Principals allowed to decide. Empty admits any principal.
    #[serde(default)]
    pub reviewers: Vec<String>,
    /// Forbid the trigger's actor from clearing their own run.
    #[serde(default)]
    pub prevent_self_review: bool,
}

impl ApprovalEnvironment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reviewers: Vec::new(),
            prevent_self_review: false,
        }
    }

    pub fn with_reviewer(mut self, reviewer: impl Into<String>) -> Self {
        self.reviewers.push(reviewer.into());
        self
    }

    pub fn with_self_review_prevented(mut self) -> Self {
        self.prevent_self_review = true;
        self
    }

    /// Whether `principal` is listed (or the list is open).
    pub fn admits(&self, principal: &str) -> bool {
        self.reviewers.is_empty()
            || self
                .reviewers
                .iter()
                .any(|r| r.eq_ignore_ascii_case(principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_environment_admits_anyone() {
        let env = ApprovalEnvironment::new("external-approval");
        assert!(env.admits("anyone"));
    }

    #[test]
    fn test_listed_reviewers_only() {
        let env = ApprovalEnvironment::new("external-approval").with_reviewer("Alice");
        assert!(env.admits("alice"));
        assert!(!env.admits("mallory"));
    }
}
