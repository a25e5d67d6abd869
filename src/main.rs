use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use conductor::config::Config;
use conductor::telemetry::{TelemetryOptions, init_tracing};

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Run agent phases per issue with durable workflow state")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true, env = "CONDUCTOR_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive issues through their phase chains
    Run {
        /// Issue numbers, in execution order
        #[arg(required = true, value_parser = clap::value_parser!(u64).range(1..))]
        issues: Vec<u64>,

        /// Comma-separated phase list (defaults to conductor.toml)
        #[arg(long)]
        phases: Option<String>,

        /// Execution mode: sequential, fan-out
        #[arg(long)]
        mode: Option<String>,

        /// Issues run at once in fan-out mode
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Report every phase as passed without spawning the agent
        #[arg(long)]
        dry_run: bool,

        /// Per-phase timeout in seconds, overriding conductor.toml
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show tracked issues
    Status {
        /// Show a single issue in detail
        issue: Option<u64>,

        /// Print the raw records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Promote ready-for-merge issues whose work has landed
    Reconcile,
    /// Remove or flag entries whose worktree is gone
    Cleanup {
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,

        /// Remove orphaned entries instead of marking them abandoned
        #[arg(long)]
        force: bool,

        /// Evict merged/abandoned entries older than this (0 disables)
        #[arg(long)]
        max_age_days: Option<u32>,
    },
    /// Inspect or manage cached QA results
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Maintain the workflow state document
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum CacheCommands {
    /// Show the cache state of every check kind
    Status,
    /// Look up one check kind; exits 0 on a hit
    Get { kind: String },
    /// Record a verdict for one check kind against the current tree
    Set {
        kind: String,

        /// Record a failing verdict
        #[arg(long)]
        failed: bool,

        #[arg(short, long)]
        message: Option<String>,

        /// Time to live in seconds (defaults to conductor.toml)
        #[arg(long = "ttl")]
        ttl_secs: Option<u64>,
    },
    /// Clear one check kind, or everything
    Clear { kind: Option<String> },
    /// Evict entries invalidated by changed files
    Invalidate,
}

#[derive(Subcommand, Clone)]
pub enum StateCommands {
    /// Reconstruct the state document from run logs
    Rebuild {
        /// Overwrite an existing state document
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = Config::new(&project_dir, cli.verbose)?;
    let _log_guard = init_tracing(TelemetryOptions {
        verbose: cli.verbose,
        json: cli.log_json,
        log_dir: Some(config.log_dir.clone()),
    });

    let code = match &cli.command {
        Commands::Run {
            issues,
            phases,
            mode,
            max_parallel,
            dry_run,
            timeout,
        } => {
            let args = cmd::RunArgs {
                issues: issues.clone(),
                phases: phases.clone(),
                mode: mode.clone(),
                max_parallel: *max_parallel,
                dry_run: *dry_run,
                timeout_secs: *timeout,
            };
            cmd::cmd_run(&cli, &config, args).await?
        }
        Commands::Status { issue, json } => {
            cmd::cmd_status(&config, *issue, *json)?;
            ExitCode::SUCCESS
        }
        Commands::Reconcile => {
            cmd::cmd_reconcile(&config).await?;
            ExitCode::SUCCESS
        }
        Commands::Cleanup {
            dry_run,
            force,
            max_age_days,
        } => {
            cmd::cmd_cleanup(&config, *dry_run, *force, *max_age_days).await?;
            ExitCode::SUCCESS
        }
        Commands::Cache { command } => cmd::cmd_cache(&config, command)?,
        Commands::State { command } => match command {
            StateCommands::Rebuild { force } => {
                cmd::cmd_state_rebuild(&config, *force).await?;
                ExitCode::SUCCESS
            }
        },
    };

    Ok(code)
}
