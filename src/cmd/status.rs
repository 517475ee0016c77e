//! Pipeline status and reset commands.

use anyhow::Result;
use std::path::Path;

use shipwright::config::Config;
use shipwright::orchestrator::{Orchestrator, StateStore};
use shipwright::profile::DeveloperProfile;

pub fn cmd_status(project_dir: &Path) -> Result<()> {
    println!();
    println!("Shipwright Status");
    println!("=================");
    println!();

    let config = Config::new(project_dir)?;
    if !config.shipwright_dir.exists() {
        println!("Project: Not initialized");
        println!();
        println!("Run 'shipwright init' to initialize the project.");
        println!();
        return Ok(());
    }

    println!("Project: {}", config.project_name());
    match config.find_plan_file() {
        Ok(path) => println!("Plan:    {}", path.display()),
        Err(_) => println!("Plan:    Missing (add .shipwright/plan.md or set [project].plan_file)"),
    }
    match DeveloperProfile::discover(&config.shipwright_dir) {
        Ok(Some(profile)) => println!("Profile: {} ({})", profile.name, profile.stack),
        Ok(None) => println!("Profile: Missing (add .shipwright/profile.toml)"),
        Err(e) => println!("Profile: Unreadable ({:#})", e),
    }
    let policy_file = config.policy_file();
    if policy_file.exists() {
        println!("Policy:  {}", policy_file.display());
    } else {
        println!("Policy:  None (single default tier)");
    }
    println!();

    let orch = Orchestrator::open(StateStore::new(config.state_file()), None)?;
    let state = orch.state();
    println!("Phase:        {}", state.phase);
    if state.epic_number > 0 {
        println!("Epic:         {}", state.epic_number);
    }
    if let Some(story) = &state.current_story {
        println!("Story:        {}", story);
    }
    if let Some(step) = &state.last_completed_step {
        println!("Last step:    {}", step);
    }
    println!(
        "Scaffolding:  {}",
        if state.scaffolding_complete { "done" } else { "pending" }
    );
    if let Some(updated) = state.updated_at {
        println!("Updated:      {}", updated.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();
    println!("{}", orch.resume_hint());
    println!();
    Ok(())
}

pub fn cmd_reset(project_dir: &Path, force: bool) -> Result<()> {
    use dialoguer::Confirm;

    let config = Config::new(project_dir)?;

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will reset all pipeline progress. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    let mut orch = Orchestrator::open(StateStore::new(config.state_file()), None)?;
    orch.reset()?;

    println!("Reset complete");
    Ok(())
}
