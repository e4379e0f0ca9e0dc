use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kiln_core::approval::{
    ApprovalFilter, ApprovalManager, ApproveInput, RedbApprovalRepository, RejectInput,
    StatsFilter, TracingNotifier,
};
use kiln_core::workflow::{execution_levels, expand_fan_outs, InMemoryResultCache};
use kiln_core::{
    ApprovalId, ExecuteOptions, ExecutionStatus, Orchestrator, OrchestratorConfig, OrchestratorError,
    ValidationIssue,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod handlers;
mod pipeline;

use pipeline::PipelineFile;

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(about = "ML pipeline orchestrator", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "kiln.toml", env = "KILN_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a pipeline for structural and configuration errors
    Validate { pipeline: PathBuf },

    /// Print the execution levels of a pipeline after fan-out expansion
    Plan { pipeline: PathBuf },

    /// Print the pipeline with every fan-out expanded into concrete jobs
    Expand { pipeline: PathBuf },

    /// Execute a pipeline and print the final execution state
    Run {
        pipeline: PathBuf,

        /// Maximum concurrently running jobs per level
        #[arg(short, long)]
        parallelism: Option<usize>,

        /// Serve repeated jobs from the result cache
        #[arg(long)]
        cache: bool,

        /// Ignore cached results
        #[arg(long)]
        force: bool,
    },

    /// Inspect and decide approval requests in the configured approval store
    #[command(subcommand)]
    Approvals(ApprovalsCommand),
}

#[derive(Subcommand, Debug)]
enum ApprovalsCommand {
    /// List pending requests
    List {
        #[arg(long)]
        workflow: Option<String>,
    },

    Approve {
        id: String,
        #[arg(short, long, env = "KILN_USER")]
        user: String,
        #[arg(long)]
        comment: Option<String>,
    },

    Reject {
        id: String,
        #[arg(short, long, env = "KILN_USER")]
        user: String,
        #[arg(short, long)]
        reason: String,
    },

    /// Counts by status and mean decision time
    Stats {
        #[arg(long)]
        workflow: Option<String>,
    },
}

fn invalid(issues: Vec<ValidationIssue>) -> anyhow::Error {
    OrchestratorError::Validation(issues).into()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn approval_manager(config: &OrchestratorConfig) -> Result<Arc<ApprovalManager>> {
    let manager = match &config.storage.approval_db {
        Some(path) => {
            tracing::info!("Approval store: {}", path);
            let repository = RedbApprovalRepository::new(PathBuf::from(path))?;
            ApprovalManager::new(
                Arc::new(repository),
                Arc::new(TracingNotifier),
                config.approval.clone(),
            )
        }
        None => ApprovalManager::in_memory(config.approval.clone()),
    };
    Ok(Arc::new(manager))
}

fn build_orchestrator(config: &OrchestratorConfig, approvals: Arc<ApprovalManager>) -> Result<Orchestrator> {
    let orchestrator = handlers::register(Orchestrator::builder())
        .config(config.clone())
        .cache(Arc::new(InMemoryResultCache::new()))
        .approvals(approvals)
        .build()?;
    Ok(orchestrator)
}

async fn run(
    config: &OrchestratorConfig,
    path: &Path,
    parallelism: Option<usize>,
    cache: bool,
    force: bool,
) -> Result<()> {
    let pipeline = PipelineFile::load(path)?;
    let approvals = approval_manager(config)?;
    let orchestrator = Arc::new(build_orchestrator(config, approvals.clone())?);

    approvals.start_timeout_checker().await;

    let mut options = ExecuteOptions::new()
        .force_rerun(force)
        .on_job_complete(|state| {
            tracing::info!("Job {} finished: {:?}", state.job_id, state.status);
        });
    if let Some(parallelism) = parallelism {
        options = options.parallelism(parallelism);
    }
    if cache {
        options = options.enable_cache(true);
    }

    tracing::info!("Running pipeline '{}' ({} jobs)", pipeline.name, pipeline.jobs.len());

    let runner = orchestrator.clone();
    let mut execution = tokio::spawn(async move {
        runner
            .execute_expanded(&pipeline.name, pipeline.jobs, options)
            .await
    });

    let result = tokio::select! {
        joined = &mut execution => joined.context("Execution task failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling running executions");
            for running in orchestrator.list_executions().await {
                if running.status == ExecutionStatus::Running {
                    orchestrator.cancel(running.id).await;
                }
            }
            execution.await.context("Execution task failed")?
        }
    };

    approvals.stop_timeout_checker().await;

    match result {
        Ok(execution) => print_json(&execution),
        Err(e) => {
            if let Some(execution) = e.execution() {
                print_json(execution)?;
            }
            Err(e.into())
        }
    }
}

async fn approvals(config: &OrchestratorConfig, command: ApprovalsCommand) -> Result<()> {
    if config.storage.approval_db.is_none() {
        bail!("No approval store configured; set storage.approval_db in the configuration file");
    }
    let manager = approval_manager(config)?;

    match command {
        ApprovalsCommand::List { workflow } => {
            let filter = ApprovalFilter {
                workflow_id: workflow,
                ..Default::default()
            };
            print_json(&manager.list_pending(filter).await?)
        }
        ApprovalsCommand::Approve { id, user, comment } => {
            let request = manager
                .approve(&ApprovalId::new(id), ApproveInput { user_id: user, comment })
                .await?;
            print_json(&request)
        }
        ApprovalsCommand::Reject { id, user, reason } => {
            let request = manager
                .reject(
                    &ApprovalId::new(id),
                    RejectInput {
                        user_id: user,
                        reason,
                        comment: None,
                    },
                )
                .await?;
            print_json(&request)
        }
        ApprovalsCommand::Stats { workflow } => {
            let stats = manager
                .get_stats(StatsFilter {
                    workflow_id: workflow,
                    ..Default::default()
                })
                .await?;
            print_json(&stats)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_core=info,kiln=info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = OrchestratorConfig::load(&args.config)?;

    match args.command {
        Command::Validate { pipeline } => {
            let pipeline = PipelineFile::load(&pipeline)?;
            let approvals = Arc::new(ApprovalManager::in_memory(config.approval.clone()));
            let orchestrator = build_orchestrator(&config, approvals)?;
            let expanded = expand_fan_outs(&pipeline.jobs).map_err(invalid)?;
            let report = orchestrator.validate_pipeline(&expanded);
            print_json(&report)?;
            if !report.valid {
                bail!("Pipeline '{}' is invalid", pipeline.name);
            }
            Ok(())
        }
        Command::Plan { pipeline } => {
            let pipeline = PipelineFile::load(&pipeline)?;
            let expanded = expand_fan_outs(&pipeline.jobs).map_err(invalid)?;
            let levels = execution_levels(&expanded).map_err(invalid)?;

            for (i, level) in levels.iter().enumerate() {
                let ids: Vec<&str> = level.iter().map(|job| job.id.as_str()).collect();
                println!("level {}: {}", i, ids.join(", "));
            }
            Ok(())
        }
        Command::Expand { pipeline } => {
            let mut pipeline = PipelineFile::load(&pipeline)?;
            pipeline.jobs = expand_fan_outs(&pipeline.jobs).map_err(invalid)?;
            print_json(&pipeline)
        }
        Command::Run {
            pipeline,
            parallelism,
            cache,
            force,
        } => run(&config, &pipeline, parallelism, cache, force).await,
        Command::Approvals(command) => approvals(&config, command).await,
    }
}
