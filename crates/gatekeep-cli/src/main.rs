//! Gatekeep - clearance-gated CI orchestrator CLI
//!
//! The `gatekeep` command runs a pipeline for a trigger event and parks
//! secret-bound work from untrusted sources until a reviewer clears it.
//!
//! ## Commands
//!
//! - `submit`: Create a run for a trigger event and drive it
//! - `approve` / `reject`: Record a clearance decision and resume the run
//! - `status`: Show a run, or list stored runs
//! - `audit`: Replay a stored run's event log against its rules
//! - `classify`: Show how an event would be classified, without running it
//! - `validate`: Check a pipeline file
//! - `init`: Write the reference pipeline

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use gatekeep_ci::{
    EnvSecretStore, FsRunStore, GitCheckout, GitPublisher, JobRunner, Orchestrator,
    PipelineExecutor, ProcessExecutor,
};
use gatekeep_core::{
    classify, ClearanceOutcome, GraphNode, JobStatus, PipelineConfig, RunReport, RunStatus,
    Trigger, TriggerEvent, METRICS,
};
use tracing::Level;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "gatekeep")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Clearance-gated CI orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline definition
    #[arg(long, global = true, env = "GATEKEEP_CONFIG", default_value = "gatekeep.toml")]
    config: PathBuf,

    /// Directory runs are stored in
    #[arg(long, global = true, env = "GATEKEEP_STATE_DIR", default_value = ".gatekeep/runs")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a run for a trigger event and drive it
    Submit {
        /// Event JSON file ("-" reads stdin)
        #[arg(default_value = "-")]
        event: PathBuf,

        #[command(flatten)]
        exec: ExecArgs,
    },

    /// Approve a run waiting for clearance
    Approve {
        run_id: Uuid,

        /// Reviewer recording the decision. Taken as given: the caller's
        /// platform must authenticate it.
        #[arg(short, long, env = "GATEKEEP_REVIEWER")]
        reviewer: String,

        #[arg(short, long)]
        comment: Option<String>,

        #[command(flatten)]
        exec: ExecArgs,
    },

    /// Reject a run waiting for clearance
    Reject {
        run_id: Uuid,

        /// Reviewer recording the decision
        #[arg(short, long, env = "GATEKEEP_REVIEWER")]
        reviewer: String,

        #[arg(short, long)]
        comment: Option<String>,

        #[command(flatten)]
        exec: ExecArgs,
    },

    /// Show a run, or list stored runs
    Status {
        run_id: Option<Uuid>,

        /// Print the report as JSON
        #[arg(long)]
        report_json: bool,
    },

    /// Replay a stored run's event log against its rules
    Audit { run_id: Uuid },

    /// Show how an event would be classified
    Classify {
        #[arg(default_value = "-")]
        event: PathBuf,
    },

    /// Check a pipeline file
    Validate,

    /// Write the reference pipeline
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Settings for commands that execute jobs.
#[derive(clap::Args)]
struct ExecArgs {
    /// Directory checkouts are created in
    #[arg(long, env = "GATEKEEP_WORK_DIR", default_value = ".gatekeep/work")]
    work_dir: PathBuf,

    /// Prefix of the environment variables secrets are read from
    #[arg(long, env = "GATEKEEP_SECRET_PREFIX", default_value = "")]
    secret_prefix: String,

    /// Base URL repositories are fetched from
    #[arg(long, env = "GATEKEEP_FETCH_BASE", default_value = "https://github.com")]
    fetch_base: String,

    /// Base URL publishes are pushed to
    #[arg(long, env = "GATEKEEP_PUSH_BASE", default_value = "git@github.com:")]
    push_base: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    gatekeep_core::init_tracing(cli.json, level);

    let code = match cli.command {
        Commands::Submit { ref event, ref exec } => {
            cmd_submit(&cli.config, &cli.state_dir, event, exec).await?
        }
        Commands::Approve {
            run_id,
            ref reviewer,
            ref comment,
            ref exec,
        } => {
            cmd_decide(
                &cli.config,
                &cli.state_dir,
                exec,
                run_id,
                reviewer,
                ClearanceOutcome::Approved,
                comment.clone(),
            )
            .await?
        }
        Commands::Reject {
            run_id,
            ref reviewer,
            ref comment,
            ref exec,
        } => {
            cmd_decide(
                &cli.config,
                &cli.state_dir,
                exec,
                run_id,
                reviewer,
                ClearanceOutcome::Rejected,
                comment.clone(),
            )
            .await?
        }
        Commands::Status {
            run_id,
            report_json,
        } => cmd_status(&cli.state_dir, run_id, report_json).await?,
        Commands::Audit { run_id } => cmd_audit(&cli.state_dir, run_id).await?,
        Commands::Classify { ref event } => cmd_classify(&cli.config, event)?,
        Commands::Validate => cmd_validate(&cli.config)?,
        Commands::Init { force } => cmd_init(&cli.config, force)?,
    };

    METRICS.flush();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn read_event(path: &Path) -> Result<TriggerEvent> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read event from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event {}", path.display()))?
    };
    serde_json::from_str(&raw).context("Event is not valid JSON")
}

fn orchestrator(config: PipelineConfig, state_dir: &Path, exec: &ExecArgs) -> Result<Orchestrator> {
    let runner = JobRunner::new(
        Arc::new(EnvSecretStore::with_prefix(exec.secret_prefix.clone())),
        Arc::new(GitCheckout::new(&exec.work_dir).with_remote_base(exec.fetch_base.clone())),
        Arc::new(ProcessExecutor::new()),
        Arc::new(GitPublisher::new().with_remote_base(exec.push_base.clone())),
    );
    let store = FsRunStore::new(state_dir)
        .with_context(|| format!("Failed to open run store {}", state_dir.display()))?;
    Orchestrator::new(config, PipelineExecutor::new(runner), Arc::new(store))
        .context("Invalid pipeline")
}

/// Run store for commands that never execute jobs.
fn open_store(state_dir: &Path) -> Result<FsRunStore> {
    FsRunStore::new(state_dir)
        .with_context(|| format!("Failed to open run store {}", state_dir.display()))
}

async fn cmd_submit(config: &Path, state_dir: &Path, event: &Path, exec: &ExecArgs) -> Result<i32> {
    let config = load_config(config)?;
    let event = read_event(event)?;
    let orch = orchestrator(config, state_dir, exec)?;

    let report = orch.submit(event).await.context("Run failed")?;
    print_report(&report);
    Ok(report.exit_code())
}

async fn cmd_decide(
    config: &Path,
    state_dir: &Path,
    exec: &ExecArgs,
    run_id: Uuid,
    reviewer: &str,
    outcome: ClearanceOutcome,
    comment: Option<String>,
) -> Result<i32> {
    let config = load_config(config)?;
    let orch = orchestrator(config, state_dir, exec)?;

    let report = orch
        .decide(run_id, reviewer, outcome, comment)
        .await
        .with_context(|| format!("Failed to record decision for run {run_id}"))?;
    print_report(&report);
    Ok(report.exit_code())
}

async fn cmd_status(state_dir: &Path, run_id: Option<Uuid>, report_json: bool) -> Result<i32> {
    use gatekeep_ci::RunStore;

    let store = open_store(state_dir)?;
    let Some(run_id) = run_id else {
        let ids = store.list().await?;
        if ids.is_empty() {
            println!("No runs found in {}", state_dir.display());
        }
        for id in ids {
            let report = store.load(id).await?.report();
            println!(
                "{}  {:<10} {:<32} {}",
                id,
                status_text(&report),
                report.label,
                report.revision.get(..12).unwrap_or(&report.revision)
            );
        }
        return Ok(0);
    };

    let report = store
        .load(run_id)
        .await
        .with_context(|| format!("Failed to load run {run_id}"))?
        .report();
    if report_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report.exit_code())
}

async fn cmd_audit(state_dir: &Path, run_id: Uuid) -> Result<i32> {
    use gatekeep_ci::RunStore;

    let store = open_store(state_dir)?;
    let run = store
        .load(run_id)
        .await
        .with_context(|| format!("Failed to load run {run_id}"))?;
    let verdict = gatekeep_core::RunAudit::evaluate(&run);

    println!("Audit: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    println!("{}", verdict.message);
    if !verdict.violations.is_empty() {
        println!("Violations:");
        for violation in &verdict.violations {
            println!("  - {}", violation);
        }
    }
    Ok(if verdict.passed { 0 } else { 1 })
}

fn cmd_classify(config: &Path, event: &Path) -> Result<i32> {
    let config = load_config(config)?;
    let event = read_event(event)?;
    let trigger = Trigger::from_event(event, Utc::now()).context("Invalid event")?;
    let classification = classify(&trigger, &config.canonical());
    let deploy = gatekeep_core::deploy::evaluate(&trigger, &config.canonical());

    println!("Event:     {}", trigger.event_kind);
    println!("Revision:  {}", trigger.source_revision);
    println!("Origin:    {}", trigger.origin_repository);
    println!("Label:     {}", classification.label);
    println!(
        "Clearance: {}",
        if classification.requires_clearance() {
            format!("required ({})", config.clearance.environment)
        } else {
            "not required".to_string()
        }
    );
    match deploy.skip_reason() {
        None => println!("Deploy:    publish"),
        Some(reason) => println!("Deploy:    skip ({reason})"),
    }
    Ok(0)
}

fn cmd_validate(config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let graph = config.build_graph()?;

    println!("✓ {} is valid", config_path.display());
    println!("Canonical repository: {}", config.repository.canonical);
    println!("Budget: {} minutes", config.budget.minutes);
    println!();
    for name in graph.order() {
        match graph.node(name) {
            Some(GraphNode::Clearance) => {
                println!("  ◆ {} (environment: {})", name, config.clearance.environment)
            }
            Some(GraphNode::Job(job)) => {
                let needs: Vec<&str> = graph
                    .needs(name)
                    .map(|n| n.iter().map(String::as_str).collect())
                    .unwrap_or_default();
                let marker = if job.requires_clearance() { "🔒" } else { "•" };
                println!("  {} {} <- [{}]", marker, name, needs.join(", "));
            }
            None => {}
        }
    }
    Ok(0)
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    let rendered = PipelineConfig::reference().to_toml_string()?;
    std::fs::write(config_path, rendered)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Wrote reference pipeline to {}", config_path.display());
    Ok(0)
}

fn status_text(report: &RunReport) -> &'static str {
    if report.suspended {
        "waiting"
    } else {
        report.status.as_str()
    }
}

fn print_report(report: &RunReport) {
    let headline = match report.status {
        RunStatus::Succeeded => "✓ SUCCEEDED",
        RunStatus::Failed => "✗ FAILED",
        RunStatus::Cancelled => "✗ CANCELLED",
        RunStatus::Pending | RunStatus::Running if report.suspended => "⏸ WAITING FOR CLEARANCE",
        RunStatus::Pending | RunStatus::Running => "… RUNNING",
    };

    println!("Run ID:    {}", report.run_id);
    println!("Status:    {}", headline);
    println!("Event:     {} @ {}", report.event_kind, report.revision);
    println!("Label:     {}", report.label);
    match &report.approver {
        Some(approver) => println!("Clearance: {} by {}", report.clearance, approver),
        None => println!("Clearance: {}", report.clearance),
    }
    println!();

    for job in &report.jobs {
        let mark = match job.status {
            JobStatus::Succeeded => "✓",
            JobStatus::Failed => "✗",
            JobStatus::Skipped => "-",
            JobStatus::Blocked | JobStatus::Ready | JobStatus::Running => "·",
        };
        match &job.detail {
            Some(detail) => println!("  {} {} ({}): {}", mark, job.name, job.status, detail),
            None => println!("  {} {} ({})", mark, job.name, job.status),
        }
    }

    if report.suspended {
        println!();
        println!(
            "Approve with: gatekeep approve {} --reviewer <name>",
            report.run_id
        );
    }
}
