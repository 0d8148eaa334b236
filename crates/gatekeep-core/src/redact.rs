//! Output redaction.
//!
//! Every value bound into a job is registered with a [`Redactor`] before
//! the job runs; captured command output passes through it before it is
//! logged or stored.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Replacement text for a redacted secret value.
pub const MASK: &str = "***";

/// Pattern-based redaction rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionRule {
    pub pattern_name: String,
    pub regex_pattern: String,
    pub replacement: String,
}

impl RedactionRule {
    /// Mask a literal secret value wherever it appears.
    pub fn literal(name: &str, value: &str) -> Self {
        Self {
            pattern_name: name.to_string(),
            regex_pattern: regex::escape(value),
            replacement: MASK.to_string(),
        }
    }

    /// Mask `NAME=value` assignments.
    pub fn env_var(name: &str) -> Self {
        Self {
            pattern_name: name.to_string(),
            regex_pattern: format!(r"(?i){}=\S+", regex::escape(name)),
            replacement: format!("{}={}", name, MASK),
        }
    }

    pub fn bearer_token() -> Self {
        Self {
            pattern_name: "bearer_token".to_string(),
            regex_pattern: r"(?i)bearer\s+[a-zA-Z0-9\-._~+/]+=*".to_string(),
            replacement: format!("Bearer {}", MASK),
        }
    }
}

/// Result of redacting one text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedactionResult {
    pub text: String,
    pub redaction_count: usize,
    pub applied_rules: Vec<String>,
}

/// Compiled set of redaction rules.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    rules: Vec<(String, Regex, String)>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule. Rules whose pattern does not compile are dropped with a
    /// warning; the rule text itself is never logged.
    pub fn add_rule(&mut self, rule: RedactionRule) {
        match Regex::new(&rule.regex_pattern) {
            Ok(re) => self.rules.push((rule.pattern_name, re, rule.replacement)),
            Err(_) => {
                tracing::warn!(rule = %rule.pattern_name, "redaction rule failed to compile");
            }
        }
    }

    /// Register a secret value under `name`. Empty values are ignored.
    pub fn add_secret(&mut self, name: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        self.add_rule(RedactionRule::literal(name, value));
        // Multi-line values (keys) are also masked line by line.
        if value.contains('\n') {
            for line in value.lines().map(str::trim).filter(|l| l.len() >= 8) {
                self.add_rule(RedactionRule::literal(name, line));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn redact(&self, text: &str) -> RedactionResult {
        let mut result = text.to_string();
        let mut count = 0;
        let mut applied_rules = Vec::new();

        for (name, re, replacement) in &self.rules {
            let matches = re.find_iter(&result).count();
            if matches > 0 {
                result = re.replace_all(&result, replacement.as_str()).to_string();
                count += matches;
                if !applied_rules.contains(name) {
                    applied_rules.push(name.clone());
                }
            }
        }

        RedactionResult {
            text: result,
            redaction_count: count,
            applied_rules,
        }
    }

    /// Redacted text only.
    pub fn apply(&self, text: &str) -> String {
        self.redact(text).text
    }
}
