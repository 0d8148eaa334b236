//! Pipeline definition loaded from TOML.
//!
//! ```toml
//! [repository]
//! canonical = "ZwickyTransientFacility/scope"
//! protected_branch = "main"
//!
//! [clearance]
//! environment = "external-approval"
//!
//! [budget]
//! minutes = 20
//!
//! [[jobs]]
//! name = "test"
//! secrets = [{ env = "KOWALSKI_INSTANCE_TOKEN", secret = "KOWALSKI_INSTANCE_TOKEN" }]
//! steps = [{ name = "pytest", run = ["python", "-m", "pytest"] }]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classify::CanonicalRepository;
use crate::clearance::ApprovalEnvironment;
use crate::error::{GatekeepError, GatekeepResult};
use crate::graph::{
    DeploySpec, JobGraph, JobSpec, SecretBinding, StepSpec, DEFAULT_CLEARANCE_NODE,
    MAX_TIMEOUT_MINUTES,
};

/// Service tokens bound into the reference `test` job.
pub const REFERENCE_SERVICE_TOKENS: [&str; 3] = [
    "KOWALSKI_INSTANCE_TOKEN",
    "GLORIA_INSTANCE_TOKEN",
    "MELMAN_INSTANCE_TOKEN",
];

/// Secret holding the reference deploy key.
pub const REFERENCE_DEPLOY_KEY: &str = "DOCS_DEPLOY_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositorySection {
    pub canonical: String,
    #[serde(default = "default_protected_branch")]
    pub protected_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClearanceSection {
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Name of the synthetic gate node.
    #[serde(default = "default_clearance_job")]
    pub job: String,
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub prevent_self_review: bool,
}

impl Default for ClearanceSection {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            job: default_clearance_job(),
            reviewers: Vec::new(),
            prevent_self_review: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetSection {
    /// Active execution time allowed per run.
    #[serde(default = "default_budget_minutes")]
    pub minutes: u64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            minutes: default_budget_minutes(),
        }
    }
}

fn default_protected_branch() -> String {
    "main".to_string()
}

fn default_environment() -> String {
    "external-approval".to_string()
}

fn default_clearance_job() -> String {
    DEFAULT_CLEARANCE_NODE.to_string()
}

fn default_budget_minutes() -> u64 {
    20
}

/// A complete pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub repository: RepositorySection,
    #[serde(default)]
    pub clearance: ClearanceSection,
    #[serde(default)]
    pub budget: BudgetSection,
    pub jobs: Vec<JobSpec>,
}

impl PipelineConfig {
    /// Parse and validate a TOML definition.
    pub fn from_toml_str(input: &str) -> GatekeepResult<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> GatekeepResult<Self> {
        let input = std::fs::read_to_string(path).map_err(|e| {
            GatekeepError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&input)
    }

    pub fn to_toml_string(&self) -> GatekeepResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| GatekeepError::config(format!("cannot render pipeline: {e}")))
    }

    /// Check everything that can be checked without running anything.
    pub fn validate(&self) -> GatekeepResult<()> {
        if self.repository.canonical.trim().is_empty() {
            return Err(GatekeepError::config("repository.canonical must be set"));
        }
        if self.repository.protected_branch.trim().is_empty() {
            return Err(GatekeepError::config(
                "repository.protected_branch must not be empty",
            ));
        }
        if self.clearance.environment.trim().is_empty() {
            return Err(GatekeepError::config(
                "clearance.environment must not be empty",
            ));
        }
        if self.budget.minutes == 0 {
            return Err(GatekeepError::config("budget.minutes must be positive"));
        }
        if self.budget.minutes > MAX_TIMEOUT_MINUTES {
            return Err(GatekeepError::config(format!(
                "budget.minutes must not exceed {MAX_TIMEOUT_MINUTES}"
            )));
        }
        if self.jobs.is_empty() {
            return Err(GatekeepError::config("pipeline declares no jobs"));
        }
        self.build_graph().map(|_| ())
    }

    pub fn canonical(&self) -> CanonicalRepository {
        CanonicalRepository::new(
            self.repository.canonical.clone(),
            self.repository.protected_branch.clone(),
        )
    }

    pub fn environment(&self) -> ApprovalEnvironment {
        ApprovalEnvironment {
            name: self.clearance.environment.clone(),
            reviewers: self.clearance.reviewers.clone(),
            prevent_self_review: self.clearance.prevent_self_review,
        }
    }

    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget.minutes.saturating_mul(60))
    }

    pub fn build_graph(&self) -> GatekeepResult<JobGraph> {
        JobGraph::build(self.jobs.clone(), &self.clearance.job)
    }

    /// The reference pipeline: token-bound tests and a documentation job
    /// that publishes to `gh-pages`, both behind `request_clearance`.
    pub fn reference() -> Self {
        let canonical = "ZwickyTransientFacility/scope";

        let test = REFERENCE_SERVICE_TOKENS
            .iter()
            .fold(JobSpec::new("test"), |job, token| {
                job.secret(SecretBinding::same_name(*token))
            })
            .step(StepSpec::run(
                "install",
                &["python", "-m", "pip", "install", "-r", "requirements.txt"],
            ))
            .step(StepSpec::run("pytest", &["python", "-m", "pytest", "-v"]));

        let docs = JobSpec::new("docs")
            .secret(SecretBinding::same_name(REFERENCE_DEPLOY_KEY))
            .step(StepSpec::run(
                "install",
                &["python", "-m", "pip", "install", "-r", "requirements.txt"],
            ))
            .step(StepSpec::run("lint", &["pre-commit", "run", "--all-files"]))
            .step(StepSpec::run(
                "build",
                &["sphinx-build", "-W", "-b", "html", "doc", "doc/_build/html"],
            ))
            .step(StepSpec::deploy(
                "deploy",
                DeploySpec {
                    source_dir: PathBuf::from("doc/_build/html"),
                    repository: canonical.to_string(),
                    branch: "gh-pages".to_string(),
                    deploy_key: REFERENCE_DEPLOY_KEY.to_string(),
                },
            ));

        Self {
            repository: RepositorySection {
                canonical: canonical.to_string(),
                protected_branch: default_protected_branch(),
            },
            clearance: ClearanceSection::default(),
            budget: BudgetSection::default(),
            jobs: vec![test, docs],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[repository]
canonical = "acme/scope"

[[jobs]]
name = "lint"
steps = [{ name = "fmt", run = ["cargo", "fmt", "--check"] }]

[[jobs]]
name = "docs"
needs = ["lint"]
secrets = [{ env = "DEPLOY_KEY", secret = "DOCS_KEY" }]

[[jobs.steps]]
name = "build"
run = ["mdbook", "build"]

[[jobs.steps]]
name = "deploy"
deploy = { source_dir = "book", repository = "acme/scope", branch = "gh-pages", deploy_key = "DOCS_KEY" }
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.repository.protected_branch, "main");
        assert_eq!(config.clearance.job, DEFAULT_CLEARANCE_NODE);
        assert_eq!(config.budget(), Duration::from_secs(20 * 60));

        let graph = config.build_graph().unwrap();
        assert!(graph.needs("docs").unwrap().contains(DEFAULT_CLEARANCE_NODE));
        assert!(graph.job("docs").unwrap().deploy_step().is_some());
    }

    #[test]
    fn test_reference_pipeline_is_valid() {
        let config = PipelineConfig::reference();
        config.validate().unwrap();
        let graph = config.build_graph().unwrap();
        let test = graph.job("test").unwrap();
        assert_eq!(test.secrets.len(), 3);
        assert!(graph.needs("test").unwrap().contains("request_clearance"));
        assert!(graph.needs("docs").unwrap().contains("request_clearance"));
        assert_eq!(config.budget(), Duration::from_secs(1200));
    }

    #[test]
    fn test_reference_roundtrips_through_toml() {
        let config = PipelineConfig::reference();
        let rendered = config.to_toml_string().unwrap();
        let back = PipelineConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_unknown_section_rejected() {
        let input = format!("{MINIMAL}\n[surprise]\nvalue = 1\n");
        let err = PipelineConfig::from_toml_str(&input).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let input = MINIMAL.replace(
            "[repository]",
            "[budget]\nminutes = 0\n\n[repository]",
        );
        let err = PipelineConfig::from_toml_str(&input).unwrap_err();
        assert!(err.to_string().contains("budget.minutes"));
    }

    #[test]
    fn test_oversized_budget_rejected() {
        let input = MINIMAL.replace(
            "[repository]",
            "[budget]\nminutes = 100000000\n\n[repository]",
        );
        let err = PipelineConfig::from_toml_str(&input).unwrap_err();
        assert!(err.to_string().contains("must not exceed"));

        let mut config = PipelineConfig::reference();
        config.budget.minutes = MAX_TIMEOUT_MINUTES;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cycle_surfaces_as_configuration_error() {
        let input = r#"
[repository]
canonical = "acme/scope"

[[jobs]]
name = "a"
needs = ["b"]
steps = [{ name = "x", run = ["true"] }]

[[jobs]]
name = "b"
needs = ["a"]
steps = [{ name = "y", run = ["true"] }]
"#;
        let err = PipelineConfig::from_toml_str(input).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatekeep.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.jobs.len(), 2);

        let missing = PipelineConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(missing.is_configuration());
    }
}
