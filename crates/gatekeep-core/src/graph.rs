//! Static job graph with clearance edge injection.
//!
//! Jobs declare their dependencies through `needs`. When the graph is
//! built, a single synthetic clearance node is inserted and every job that
//! binds secrets (or is marked `privileged`) gains an edge to it, so
//! privileged jobs depend on clearance by construction rather than by
//! convention in each pipeline definition.
//!
//! Topological ordering uses Kahn's algorithm with a sorted frontier so the
//! order is deterministic.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GatekeepError, GatekeepResult};

/// Default name of the synthetic clearance node.
pub const DEFAULT_CLEARANCE_NODE: &str = "request_clearance";

/// Upper bound for job timeouts and the run budget: one week.
pub const MAX_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;

/// Binds a secret from the store to an environment variable of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretBinding {
    /// Environment variable the value is exposed as.
    pub env: String,
    /// Name of the secret in the store.
    pub secret: String,
}

impl SecretBinding {
    pub fn new(env: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            env: env.into(),
            secret: secret.into(),
        }
    }

    /// Bind a secret to an environment variable of the same name.
    pub fn same_name(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            env: name.clone(),
            secret: name,
        }
    }
}

/// Where and how a deploy step publishes build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySpec {
    /// Artifact directory, relative to the checkout.
    pub source_dir: PathBuf,
    /// Destination repository, e.g. `acme/scope`.
    pub repository: String,
    /// Destination branch, replaced wholesale on every publish.
    pub branch: String,
    /// Name of the secret holding the deploy key.
    pub deploy_key: String,
}

/// One step of a job: either a command or the conditional deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    /// Command argv; first element is the executable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeploySpec>,
}

/// Borrowed view of what a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction<'a> {
    Run(&'a [String]),
    Deploy(&'a DeploySpec),
}

impl StepSpec {
    pub fn run(name: impl Into<String>, argv: &[&str]) -> Self {
        Self {
            name: name.into(),
            run: argv.iter().map(|s| s.to_string()).collect(),
            deploy: None,
        }
    }

    pub fn deploy(name: impl Into<String>, spec: DeploySpec) -> Self {
        Self {
            name: name.into(),
            run: Vec::new(),
            deploy: Some(spec),
        }
    }

    /// The step's action. Only meaningful on a validated graph.
    pub fn action(&self) -> StepAction<'_> {
        match &self.deploy {
            Some(deploy) => StepAction::Deploy(deploy),
            None => StepAction::Run(&self.run),
        }
    }
}

/// Declaration of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub needs: Vec<String>,
    /// Gate behind clearance even without secret bindings.
    #[serde(default)]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub secrets: Vec<SecretBinding>,
    /// Plain (non-secret) environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub steps: Vec<StepSpec>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            needs: Vec::new(),
            privileged: false,
            timeout_minutes: None,
            secrets: Vec::new(),
            env: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    pub fn needs(mut self, dep: impl Into<String>) -> Self {
        self.needs.push(dep.into());
        self
    }

    pub fn secret(mut self, binding: SecretBinding) -> Self {
        self.secrets.push(binding);
        self
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn timeout_minutes(mut self, minutes: u64) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    /// Whether this job may only run after clearance passes.
    pub fn requires_clearance(&self) -> bool {
        self.privileged || !self.secrets.is_empty()
    }

    /// The deploy step, if the job has one.
    pub fn deploy_step(&self) -> Option<&DeploySpec> {
        self.steps.last().and_then(|s| s.deploy.as_ref())
    }
}

/// A node of the built graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphNode {
    /// The synthetic clearance checkpoint.
    Clearance,
    Job(JobSpec),
}

/// Validated, acyclic job graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobGraph {
    clearance_node: String,
    nodes: BTreeMap<String, GraphNode>,
    /// Effective dependencies, including injected clearance edges.
    needs: BTreeMap<String, BTreeSet<String>>,
    /// Topological order, dependencies first.
    order: Vec<String>,
}

impl JobGraph {
    /// Build and validate a graph, injecting the clearance node.
    ///
    /// # Errors
    ///
    /// Returns [`GatekeepError::Configuration`] for duplicate or reserved
    /// names, unknown dependencies, malformed steps, misplaced deploy steps,
    /// and dependency cycles.
    pub fn build(jobs: Vec<JobSpec>, clearance_node: &str) -> GatekeepResult<Self> {
        if clearance_node.trim().is_empty() {
            return Err(GatekeepError::config("clearance node name must not be empty"));
        }

        let mut nodes = BTreeMap::new();
        nodes.insert(clearance_node.to_string(), GraphNode::Clearance);

        for job in &jobs {
            validate_job(job, clearance_node)?;
            if nodes.contains_key(&job.name) {
                return Err(GatekeepError::config(format!(
                    "duplicate job name '{}'",
                    job.name
                )));
            }
            nodes.insert(job.name.clone(), GraphNode::Job(job.clone()));
        }

        let mut needs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        needs.insert(clearance_node.to_string(), BTreeSet::new());
        for job in jobs {
            let mut deps = BTreeSet::new();
            for dep in &job.needs {
                if !nodes.contains_key(dep) {
                    return Err(GatekeepError::config(format!(
                        "job '{}' needs unknown job '{}'",
                        job.name, dep
                    )));
                }
                if dep == &job.name {
                    return Err(GatekeepError::config(format!(
                        "job '{}' cannot depend on itself",
                        job.name
                    )));
                }
                deps.insert(dep.clone());
            }
            if job.requires_clearance() {
                deps.insert(clearance_node.to_string());
            }
            needs.insert(job.name, deps);
        }

        let order = topological_order(&needs)?;

        Ok(Self {
            clearance_node: clearance_node.to_string(),
            nodes,
            needs,
            order,
        })
    }

    pub fn clearance_node(&self) -> &str {
        &self.clearance_node
    }

    /// Node names, dependencies first.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        match self.nodes.get(name) {
            Some(GraphNode::Job(spec)) => Some(spec),
            _ => None,
        }
    }

    /// Job declarations in topological order (clearance node excluded).
    pub fn jobs(&self) -> impl Iterator<Item = &JobSpec> {
        self.order.iter().filter_map(|n| self.job(n))
    }

    /// Effective dependencies of `name`.
    pub fn needs(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.needs.get(name)
    }

    /// Whether `name` waits on the clearance node, directly or transitively.
    pub fn is_downstream_of_clearance(&self, name: &str) -> bool {
        let mut stack: Vec<&str> = vec![name];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            let Some(deps) = self.needs.get(current) else {
                continue;
            };
            for dep in deps {
                if dep == &self.clearance_node {
                    return true;
                }
                if seen.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
        false
    }

    /// SHA-256 digest of the graph's canonical JSON form.
    pub fn digest(&self) -> GatekeepResult<String> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

fn validate_job(job: &JobSpec, clearance_node: &str) -> GatekeepResult<()> {
    if job.name.trim().is_empty() {
        return Err(GatekeepError::config("job name must not be empty"));
    }
    if job.name == clearance_node {
        return Err(GatekeepError::config(format!(
            "job name '{}' is reserved for the clearance gate",
            job.name
        )));
    }
    if job.steps.is_empty() {
        return Err(GatekeepError::config(format!(
            "job '{}' has no steps",
            job.name
        )));
    }
    match job.timeout_minutes {
        Some(0) => {
            return Err(GatekeepError::config(format!(
                "job '{}' has a zero timeout",
                job.name
            )));
        }
        Some(minutes) if minutes > MAX_TIMEOUT_MINUTES => {
            return Err(GatekeepError::config(format!(
                "job '{}' timeout of {} minutes exceeds {}",
                job.name, minutes, MAX_TIMEOUT_MINUTES
            )));
        }
        _ => {}
    }

    let last = job.steps.len() - 1;
    for (idx, step) in job.steps.iter().enumerate() {
        match (&step.deploy, step.run.is_empty()) {
            (Some(_), false) => {
                return Err(GatekeepError::config(format!(
                    "step '{}' of job '{}' has both run and deploy",
                    step.name, job.name
                )));
            }
            (None, true) => {
                return Err(GatekeepError::config(format!(
                    "step '{}' of job '{}' has an empty command",
                    step.name, job.name
                )));
            }
            (Some(deploy), true) => {
                if idx != last {
                    return Err(GatekeepError::config(format!(
                        "deploy step '{}' must be the last step of job '{}'",
                        step.name, job.name
                    )));
                }
                if !job.secrets.iter().any(|b| b.secret == deploy.deploy_key) {
                    return Err(GatekeepError::config(format!(
                        "job '{}' deploys with '{}' but does not bind that secret",
                        job.name, deploy.deploy_key
                    )));
                }
            }
            (None, false) => {}
        }
    }
    Ok(())
}

fn topological_order(needs: &BTreeMap<String, BTreeSet<String>>) -> GatekeepResult<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> =
        needs.iter().map(|(n, deps)| (n.as_str(), deps.len())).collect();

    let mut downstream: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (node, deps) in needs {
        for dep in deps {
            downstream.entry(dep.as_str()).or_default().push(node.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&n, _)| n)
        .collect();

    let mut sorted = Vec::with_capacity(needs.len());
    while let Some(node) = queue.pop_front() {
        sorted.push(node.to_string());
        let mut next = Vec::new();
        for dependent in downstream.get(node).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(dependent) {
                *deg -= 1;
                if *deg == 0 {
                    next.push(*dependent);
                }
            }
        }
        next.sort_unstable();
        queue.extend(next);
    }

    if sorted.len() != needs.len() {
        let cycle: Vec<String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg > 0)
            .map(|(&n, _)| n.to_string())
            .collect();
        return Err(GatekeepError::config(format!(
            "dependency cycle detected involving jobs: {}",
            cycle.join(", ")
        )));
    }

    Ok(sorted)
}
