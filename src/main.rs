use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use shipwright::config::SHIPWRIGHT_DIR;

mod cmd;

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(version, about = "Build, review, sign off and ship a plan one epic at a time")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .shipwright/ with a starter configuration
    Init {
        /// Project name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
        /// Write a project profile for this stack (rust, node, python, generic)
        #[arg(long)]
        stack: Option<String>,
        /// Developer name for the project profile
        #[arg(long)]
        developer: Option<String>,
    },
    /// Run the pipeline, resuming from the persisted state
    Run {
        /// Never ask for approval
        #[arg(long)]
        autonomous: bool,
        /// Planning document (defaults to [project].plan_file or .shipwright/plan.md)
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Show where the pipeline stands
    Status,
    /// Forget all progress
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Inspect the risk policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the current configuration
    Show,
    /// Validate shipwright.toml
    Validate,
    /// Create a default shipwright.toml
    Init,
}

#[derive(Subcommand, Clone)]
pub enum PolicyCommands {
    /// Show which risk tier a set of changed files resolves to
    Check {
        #[arg(required = true)]
        files: Vec<String>,
    },
}

/// Console logging to stderr plus, inside an initialized project, daily JSON
/// log files under `.shipwright/logs`.
fn init_tracing(project_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let default_level = if verbose { "shipwright=debug" } else { "shipwright=info" };

    let shipwright_dir = project_dir.join(SHIPWRIGHT_DIR);
    let log_dir = shipwright_dir.join("logs");
    let (file_layer, guard) = if shipwright_dir.is_dir() && std::fs::create_dir_all(&log_dir).is_ok()
    {
        let appender = tracing_appender::rolling::daily(&log_dir, "shipwright.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
            );
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // Progress lines already tell the operator what happens; the console
    // only gets warnings unless asked for more.
    let console_level = if verbose { default_level } else { "shipwright=warn" };
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| console_level.into()));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    dotenvy::from_path(project_dir.join(".env")).ok();
    let log_guard = init_tracing(&project_dir, cli.verbose);

    match &cli.command {
        Commands::Init {
            name,
            stack,
            developer,
        } => cmd::cmd_init(
            &project_dir,
            name.as_deref(),
            stack.as_deref(),
            developer.as_deref(),
        )?,
        Commands::Run { autonomous, plan } => {
            let halted = cmd::cmd_run(&project_dir, &cli, *autonomous, plan.clone()).await?;
            if halted {
                drop(log_guard);
                std::process::exit(1);
            }
        }
        Commands::Status => cmd::cmd_status(&project_dir)?,
        Commands::Reset { force } => cmd::cmd_reset(&project_dir, *force)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Policy { command } => cmd::cmd_policy(&project_dir, command)?,
    }

    Ok(())
}
