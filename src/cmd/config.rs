//! Configuration view and validation commands - `shipwright config`.

use anyhow::{Context, Result};
use std::path::Path;

use shipwright::config::Config;
use shipwright::pipeline_config::{ShipwrightToml, default_template};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = Config::new(project_dir)?;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Shipwright Configuration");
            println!("========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No shipwright.toml found at {}", config_path.display());
                println!("Using default configuration:");
            }
            println!();
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  agent_cmd = \"{}\"", config.toml.agent_cmd());
            println!("  project = \"{}\"", config.project_name());
            println!("  policy_file = \"{}\"", config.policy_file().display());
            match config.rule_store() {
                Ok(store) => println!("  rules_file = \"{}\"", store.path().display()),
                Err(e) => println!("  rules_file = <unavailable: {}>", e),
            }
            println!();
            if !config_path.exists() {
                println!("Run 'shipwright config init' to create a shipwright.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No shipwright.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ShipwrightToml::load(&config_path)?;
            let mut warnings = toml.validate();
            if let Err(e) = config.risk_policy() {
                warnings.push(format!("Risk policy: {:#}", e));
            }

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("shipwright.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.shipwright_dir)
                .with_context(|| format!("Failed to create {}", config.shipwright_dir.display()))?;
            std::fs::write(&config_path, default_template(&config.project_name()))
                .with_context(|| format!("Failed to write {}", config_path.display()))?;

            println!("Created shipwright.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [project] name, agent_cmd, model, plan_file");
            println!("  - [review] default agents, iterations and fix severity");
            println!("  - [commands] test and deploy commands");
            println!("  - [timeouts] and [sandbox] for command execution");
            println!();
        }
    }

    Ok(())
}
