//! Read-only secret store.

use std::fmt;

use async_trait::async_trait;

use crate::error::{ExecutionError, ExecutionResult};

/// A resolved secret value.
///
/// `Debug` and `Display` never show the content; use [`SecretValue::expose`]
/// at the single point where the value is handed to a child process.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Source of secret values, queried by name.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Resolve `name`. A missing or empty value is
    /// [`ExecutionError::SecretUnavailable`]; no default is ever substituted.
    async fn resolve(&self, name: &str) -> ExecutionResult<SecretValue>;
}

/// Secrets read from the process environment, optionally under a prefix
/// (`GATEKEEP_SECRET_` + name).
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn variable(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn resolve(&self, name: &str) -> ExecutionResult<SecretValue> {
        match std::env::var(self.variable(name)) {
            Ok(value) if !value.is_empty() => Ok(SecretValue::new(value)),
            _ => Err(ExecutionError::SecretUnavailable(name.to_string())),
        }
    }
}
