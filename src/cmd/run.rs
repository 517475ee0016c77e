//! Pipeline execution - `shipwright run`.

use anyhow::Result;
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use shipwright::adapters::default_collaborators;
use shipwright::adapters::retrospective::REPORT_FILE;
use shipwright::config::Config;
use shipwright::gates::ApprovalChannel;
use shipwright::orchestrator::collaborators::DeployOptions;
use shipwright::orchestrator::{Orchestrator, RunOptions, RunOutcome, Runner, StateStore};
use shipwright::phase::PipelinePhase;
use shipwright::profile::DeveloperProfile;
use shipwright::ui::ConsoleProgress;
use shipwright::ui::icons::{CHECK, PAUSE};

use super::super::Cli;

fn check_run_prerequisites(config: &Config) -> Result<()> {
    if !config.shipwright_dir.exists() {
        anyhow::bail!("Project not initialized. Run 'shipwright init' first.");
    }
    Ok(())
}

fn run_options(config: &Config, plan_file: PathBuf) -> Result<RunOptions> {
    // Fail fast on a broken policy; each review re-reads the file.
    config.risk_policy()?;
    let rules = match config.rule_store() {
        Ok(store) => Some(store),
        Err(e) => {
            warn!(error = %e, "Review rule store unavailable; rules will not be learned");
            None
        }
    };
    let deploy = config.toml.deploy.target.clone().map(|target| DeployOptions {
        project_dir: config.project_dir.clone(),
        target,
        provider: config.toml.deploy.provider.clone(),
    });

    Ok(RunOptions {
        project_dir: config.project_dir.clone(),
        project_name: config.project_name(),
        plan_file,
        model: config.toml.project.model.clone(),
        review: config.review_settings(),
        policy_file: Some(config.policy_file()),
        rules,
        reviews_dir: config.reviews_dir(),
        deploy,
        deploy_record: config.deploy_record_file(),
        max_rejection_cycles: config.toml.signoff.max_rejection_cycles,
    })
}

/// Run or resume the pipeline. Returns `true` when the run halted.
pub async fn cmd_run(
    project_dir: &Path,
    cli: &Cli,
    autonomous: bool,
    plan: Option<PathBuf>,
) -> Result<bool> {
    let config = Config::new(project_dir)?.with_cli_args(autonomous, cli.verbose, plan);
    check_run_prerequisites(&config)?;
    config.ensure_directories()?;

    let profile = DeveloperProfile::discover(&config.shipwright_dir)?;
    let orch = Orchestrator::open(StateStore::new(config.state_file()), profile)?;
    if orch.phase() == PipelinePhase::Complete {
        println!("{}Pipeline is complete. Run 'shipwright reset' to start over.", CHECK);
        return Ok(false);
    }
    if orch.phase() != PipelinePhase::Idle || orch.epic_number() > 0 {
        println!("{}{}", PAUSE, style(orch.resume_hint()).dim());
    }

    let plan_file = config.find_plan_file()?;
    let options = run_options(&config, plan_file)?;
    info!(
        project = %options.project_name,
        plan = %options.plan_file.display(),
        autonomous = config.autonomous,
        "Starting pipeline run"
    );

    let prompts_on_terminal =
        !config.autonomous && config.toml.pipeline.approval_channel == ApprovalChannel::Interactive;
    let progress = Arc::new(if prompts_on_terminal {
        ConsoleProgress::plain(config.verbose)
    } else {
        ConsoleProgress::new(config.verbose)
    });
    if !config.autonomous && config.toml.pipeline.approval_channel == ApprovalChannel::Inbox {
        println!(
            "Approval requests will be written to {}",
            config.inbox_dir().display()
        );
    }

    let collab = default_collaborators(&config, progress.clone());
    let mut runner = Runner::new(orch, collab, options);

    match runner.run().await? {
        RunOutcome::Completed => {
            progress.finish();
            println!();
            println!("{}{}", CHECK, style("Pipeline complete").green().bold());
            println!(
                "Retrospective: {}",
                config.shipwright_dir.join(REPORT_FILE).display()
            );
            Ok(false)
        }
        RunOutcome::AlreadyComplete => {
            progress.finish();
            println!("{}Pipeline is complete.", CHECK);
            Ok(false)
        }
        RunOutcome::Halted(failure) => {
            progress.print_halt(&failure);
            Ok(true)
        }
    }
}
