//! Project initialization - `shipwright init`.

use anyhow::{Context, Result};
use std::path::Path;

use shipwright::config::Config;
use shipwright::pipeline_config::default_template;
use shipwright::profile::{DeveloperProfile, PROFILE_FILE, Stack};
use shipwright::ui::icons::SPARKLE;

pub fn cmd_init(
    project_dir: &Path,
    name: Option<&str>,
    stack: Option<&str>,
    developer: Option<&str>,
) -> Result<()> {
    let stack = stack.map(str::parse::<Stack>).transpose()?;

    let config = Config::new(project_dir)?;
    let was_initialized = config.shipwright_dir.exists();
    config.ensure_directories()?;

    let config_file = config.config_file();
    let wrote_config = !config_file.exists();
    if wrote_config {
        let project_name = name.map(str::to_string).unwrap_or_else(|| config.project_name());
        std::fs::write(&config_file, default_template(&project_name))
            .with_context(|| format!("Failed to write {}", config_file.display()))?;
    }

    let profile_file = config.shipwright_dir.join(PROFILE_FILE);
    let mut wrote_profile = false;
    if stack.is_some() || developer.is_some() {
        if profile_file.exists() {
            println!("Keeping existing profile at {}", profile_file.display());
        } else {
            let developer = developer
                .map(str::to_string)
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "developer".to_string());
            DeveloperProfile::new(developer, stack.unwrap_or_default()).save(&profile_file)?;
            wrote_profile = true;
        }
    }

    if was_initialized {
        println!(
            "Shipwright project already initialized at {}",
            config.shipwright_dir.display()
        );
        if wrote_config {
            println!("Restored missing shipwright.toml.");
        }
        if wrote_profile {
            println!("Wrote profile.toml.");
        }
        return Ok(());
    }

    println!(
        "{}Initialized shipwright project at {}",
        SPARKLE,
        config.shipwright_dir.display()
    );
    println!();
    println!("  .shipwright/");
    println!("  ├── shipwright.toml   # Pipeline configuration");
    if wrote_profile {
        println!("  ├── profile.toml      # Developer profile");
    }
    println!("  ├── reviews/          # Review records per epic");
    println!("  └── logs/             # Run logs");
    println!();
    println!("Next steps:");
    println!("  1. Put your plan in .shipwright/plan.md (## Epic N: Title / ### Story N.M: Title)");
    if !wrote_profile && !profile_file.exists() {
        println!("  2. Add a profile.toml (name, stack) here or in ~/.shipwright/");
        println!("  3. Run `shipwright run`");
    } else {
        println!("  2. Run `shipwright run`");
    }
    Ok(())
}
