//! Shipline - deployment orchestration CLI
//!
//! ## Commands
//!
//! - `run`: execute the pipeline for a revision and branch
//! - `rollback`: restore an environment to its last known good artifact
//! - `status`: show a recorded run and its attempts
//! - `plan`: preview stage layers and triggers without executing
//! - `history`: list every attempt recorded against an environment
//! - `envs`: list configured environments
//!
//! Exit codes: 0 success, 1 pipeline or rollback failure, 2 configuration
//! error, 3 no known good state to roll back to.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shipline_core::config::credential_var_for;
use shipline_core::{
    ArtifactRef, AuditLog, CancelToken, CommandExecutor, EnvironmentRegistry, GateDecision,
    JsonlAuditLog, PipelineEngine, RollbackCoordinator, RunContext, RunId, ShiplineConfig,
    ShiplineError, StageAttemptRecord, StageGate, StageStatus, TriggerEvent,
    DEFAULT_CONFIG_FILE,
};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "shipline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deployment orchestration across named environments", long_about = None)]
struct Cli {
    /// Pipeline and environment configuration
    #[arg(short, long, global = true, env = "SHIPLINE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Audit log path (overrides the configured one)
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for a revision pushed to a branch
    Run {
        /// Source revision (commit SHA)
        revision: String,

        /// Branch the revision was pushed to
        branch: String,

        /// Who triggered the run
        #[arg(long, env = "SHIPLINE_ACTOR", default_value = "operator")]
        actor: String,

        /// Artifact path (default: from config)
        #[arg(long)]
        artifact: Option<String>,

        /// Approve a stage name or environment id (repeatable)
        #[arg(long = "approve", value_name = "STAGE|ENV")]
        approvals: Vec<String>,
    },

    /// Roll an environment back to its last known good artifact
    Rollback {
        /// Environment id
        environment: String,

        /// Who requested the rollback
        #[arg(long, env = "SHIPLINE_ACTOR", default_value = "operator")]
        actor: String,
    },

    /// Show a recorded run and its stage attempts
    Status {
        /// Run ID
        run_id: String,

        /// Print the full run record as JSON
        #[arg(long)]
        raw: bool,
    },

    /// Preview stage layers and which stages a branch would trigger
    Plan {
        /// Branch to evaluate triggers against
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// List every attempt recorded against an environment
    History {
        /// Environment id
        environment: String,

        /// Show only the most recent N attempts
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// List configured environments
    Envs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    shipline_core::telemetry::init_tracing(cli.json, level);

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("✗ {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<ShiplineError>()
        .map(ShiplineError::exit_code)
        .unwrap_or(1)
}

async fn dispatch(cli: Cli) -> Result<u8> {
    match cli.command {
        Commands::Run {
            revision,
            branch,
            actor,
            artifact,
            approvals,
        } => {
            cmd_run(
                &cli.config,
                cli.audit_log.as_deref(),
                &revision,
                &branch,
                &actor,
                artifact,
                approvals,
            )
            .await
        }
        Commands::Rollback { environment, actor } => {
            cmd_rollback(&cli.config, cli.audit_log.as_deref(), &environment, &actor).await
        }
        Commands::Status { run_id, raw } => {
            cmd_status(&cli.config, cli.audit_log.as_deref(), &run_id, raw).await
        }
        Commands::Plan { branch } => cmd_plan(&cli.config, branch.as_deref()),
        Commands::History {
            environment,
            limit,
        } => cmd_history(&cli.config, cli.audit_log.as_deref(), &environment, limit).await,
        Commands::Envs => cmd_envs(&cli.config),
    }
}

fn load_config(path: &Path) -> Result<ShiplineConfig> {
    let config = ShiplineConfig::load(path)?;
    info!(config = %path.display(), environments = config.environments.len(), stages = config.stages.len(), "configuration loaded");
    Ok(config)
}

async fn open_audit(path: &Path) -> Result<Arc<JsonlAuditLog>> {
    let log = JsonlAuditLog::open(path)
        .await
        .with_context(|| format!("failed to open audit log {}", path.display()))?;
    Ok(Arc::new(log))
}

/// Queries never create or repair the log.
async fn open_audit_read_only(path: &Path) -> Result<JsonlAuditLog> {
    JsonlAuditLog::open_read_only(path)
        .await
        .with_context(|| format!("failed to open audit log {}", path.display()))
}

/// Audit log path for read-only commands: the override if given, otherwise
/// the one named by the config document.
fn audit_path(config: &Path, override_path: Option<&Path>) -> Result<PathBuf> {
    match override_path {
        Some(p) => Ok(p.to_path_buf()),
        None => Ok(load_config(config)?.audit_log),
    }
}

fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
    cancel
}

async fn cmd_run(
    config_path: &Path,
    audit_override: Option<&Path>,
    revision: &str,
    branch: &str,
    actor: &str,
    artifact: Option<String>,
    approvals: Vec<String>,
) -> Result<u8> {
    let config = load_config(config_path)?;
    let registry = Arc::new(config.build_registry()?);
    let audit = open_audit(audit_override.unwrap_or(&config.audit_log)).await?;
    let executor = Arc::new(CommandExecutor::new(
        Arc::new(config.process_command()),
        config.default_timeout(),
    ));

    let rollback = RollbackCoordinator::new(registry.clone(), executor.clone(), audit.clone())
        .with_retry(config.defaults.retry.clone());
    let engine = PipelineEngine::new(registry, config.stages(), executor, audit)?
        .with_rollback(rollback);

    let mut ctx = RunContext::new(TriggerEvent::new(branch, revision, actor));
    for approval in approvals {
        ctx = ctx.approve(approval);
    }
    let artifact = ArtifactRef::new(artifact.unwrap_or_else(|| config.artifact.clone()), revision);

    let run = engine.run(&ctx, artifact, &cancel_on_ctrl_c()).await?;

    println!("Run {} ({})", run.run_id, run.status);
    for stage in &run.stages {
        let mark = match stage.status {
            StageStatus::Succeeded => "✓",
            StageStatus::Failed => "✗",
            _ => "-",
        };
        println!(
            "  {mark} {:<24} {:<10} {} [{} attempt(s)]",
            stage.name, stage.environment, stage.status, stage.attempts
        );
    }

    Ok(run.exit_code())
}

async fn cmd_rollback(
    config_path: &Path,
    audit_override: Option<&Path>,
    environment: &str,
    actor: &str,
) -> Result<u8> {
    let config = load_config(config_path)?;
    let registry = Arc::new(config.build_registry()?);
    let audit = open_audit(audit_override.unwrap_or(&config.audit_log)).await?;
    let executor = Arc::new(CommandExecutor::new(
        Arc::new(config.process_command()),
        config.default_timeout(),
    ));
    let coordinator = RollbackCoordinator::new(registry, executor, audit)
        .with_retry(config.defaults.retry.clone());

    let report = coordinator
        .rollback(environment, actor, &cancel_on_ctrl_c())
        .await?;

    let mark = if report.succeeded() { "✓" } else { "✗" };
    println!(
        "{mark} Rollback {} of '{}' ({})",
        report.run_id, report.environment, report.status
    );
    println!(
        "  restored revision {} ({}) from attempt {}",
        report.restored.artifact.revision,
        report.restored.artifact.digest.short(),
        report.restored.record_id
    );
    for attempt in &report.attempts {
        println!(
            "  attempt {}: {} {}",
            attempt.attempt, attempt.outcome, attempt.detail
        );
    }

    Ok(report.exit_code())
}

async fn cmd_status(
    config_path: &Path,
    audit_override: Option<&Path>,
    run_id: &str,
    raw: bool,
) -> Result<u8> {
    let audit = open_audit_read_only(&audit_path(config_path, audit_override)?).await?;
    let record = audit.get_run(&RunId(run_id.to_string())).await?;

    if raw {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(0);
    }

    println!("Run:      {}", record.run_id);
    println!("Status:   {}", record.status);
    println!("Revision: {}", record.revision);
    if let Some(branch) = &record.branch {
        println!("Branch:   {branch}");
    }
    println!("Actor:    {}", record.actor);
    println!(
        "Artifact: {} ({})",
        record.artifact.path,
        record.artifact.digest.short()
    );
    println!(
        "Started:  {}",
        record.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(ms) = record.duration_ms {
        println!("Duration: {ms} ms");
    }
    println!();
    print_attempts(&record.attempts);

    if !record.skipped.is_empty() {
        println!();
        for skipped in &record.skipped {
            println!("  - {} skipped: {}", skipped.stage, skipped.reason);
        }
    }

    Ok(0)
}

fn print_attempts(attempts: &[StageAttemptRecord]) {
    if attempts.is_empty() {
        println!("No attempts recorded");
        return;
    }
    println!(
        "{:<24} {:<10} {:<9} {:>3}  {:<23} {:>9}  DETAIL",
        "STAGE", "ENV", "KIND", "#", "OUTCOME", "MS"
    );
    for a in attempts {
        println!(
            "{:<24} {:<10} {:<9} {:>3}  {:<23} {:>9}  {}",
            a.stage,
            a.environment,
            a.kind.to_string(),
            a.attempt,
            a.outcome.to_string(),
            a.duration_ms(),
            a.detail
        );
    }
}

fn cmd_plan(config_path: &Path, branch: Option<&str>) -> Result<u8> {
    let config = load_config(config_path)?;
    // Credentials are not needed to lay out the graph.
    let registry = config.build_registry_with(|var| Some(var.to_string()))?;
    let graph = shipline_core::StageGraph::build(config.stages(), &registry)?;

    let ctx = branch.map(|b| RunContext::new(TriggerEvent::new(b, "", "")));
    for (level, layer) in graph.layers().iter().enumerate() {
        println!("Layer {level}:");
        for stage in layer {
            let deps = if stage.depends_on.is_empty() {
                String::new()
            } else {
                format!(" after [{}]", stage.depends_on.join(", "))
            };
            let verdict = match &ctx {
                Some(ctx) => plan_verdict(&registry, stage, ctx)?,
                None => format!("when {}", stage.trigger),
            };
            println!(
                "  {:<24} {:<8} -> {:<10}{deps}  {verdict}",
                stage.name,
                format!("{:?}", stage.mode).to_lowercase(),
                stage.environment
            );
        }
    }
    Ok(0)
}

/// Gate verdict assuming every upstream succeeds.
fn plan_verdict(
    registry: &EnvironmentRegistry,
    stage: &shipline_core::Stage,
    ctx: &RunContext,
) -> Result<String> {
    let env = registry.resolve(&stage.environment)?;
    let succeeded = StageStatus::Succeeded;
    let upstream: Vec<(&str, &StageStatus)> = stage
        .depends_on
        .iter()
        .map(|d| (d.as_str(), &succeeded))
        .collect();
    Ok(match StageGate::evaluate(stage, env, ctx, &upstream) {
        GateDecision::Run => "✓ would run".to_string(),
        GateDecision::Skip { reason } => format!("- would skip ({reason})"),
    })
}

async fn cmd_history(
    config_path: &Path,
    audit_override: Option<&Path>,
    environment: &str,
    limit: Option<usize>,
) -> Result<u8> {
    let audit = open_audit_read_only(&audit_path(config_path, audit_override)?).await?;
    let mut attempts = audit.attempts_for_environment(environment).await?;
    if let Some(limit) = limit {
        let skip = attempts.len().saturating_sub(limit);
        attempts.drain(..skip);
    }

    println!("History for '{environment}'");
    print_attempts(&attempts);
    Ok(0)
}

fn cmd_envs(config_path: &Path) -> Result<u8> {
    let config = load_config(config_path)?;
    if config.environments.is_empty() {
        println!("No environments configured");
        return Ok(0);
    }

    println!(
        "{:<12} {:<6} {:<6} {:<9} {:<10} CREDENTIAL VAR",
        "ID", "TIER", "TESTS", "APPROVAL", "REFRESH"
    );
    for env in &config.environments {
        let var = env
            .credential_env
            .clone()
            .unwrap_or_else(|| credential_var_for(&env.id));
        let set = if std::env::var_os(&var).is_some() {
            "set"
        } else {
            "unset"
        };
        println!(
            "{:<12} {:<6} {:<6} {:<9} {:<10} {var} ({set})",
            env.id,
            env.tier.to_string(),
            env.test_level.to_string(),
            if env.approval_required { "required" } else { "-" },
            env.refresh_cadence.as_deref().unwrap_or("-"),
        );
    }
    Ok(0)
}
